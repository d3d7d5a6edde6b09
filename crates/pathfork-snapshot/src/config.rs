use crate::error::{Result, SnapshotError};

const ENV_STATE_BUFFER_SIZE: &str = "PATHFORK_STATE_BUFFER_SIZE";
const ENV_SHRINK_STABLE_SAVES: &str = "PATHFORK_SHRINK_STABLE_SAVES";
const ENV_MAX_FORK_DEPTH: &str = "PATHFORK_MAX_FORK_DEPTH";

const DEFAULT_STATE_BUFFER_SIZE: usize = 16 * 1024;
const DEFAULT_SHRINK_STABLE_SAVES: u32 = 4;

// Keep a misconfigured hint from reserving absurd amounts of memory per path.
const MAX_STATE_BUFFER_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Initial register-blob capacity. A sizing hint only; blobs grow past it as needed.
    pub preferred_state_size: usize,
    /// Consecutive saves with an unchanged blob length after which spare capacity above
    /// `max(len, preferred_state_size)` is released. `0` disables shrinking.
    pub shrink_stable_saves: u32,
    /// Refuse forks that would create nodes deeper than this.
    pub max_fork_depth: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preferred_state_size: DEFAULT_STATE_BUFFER_SIZE,
            shrink_stable_saves: DEFAULT_SHRINK_STABLE_SAVES,
            max_fork_depth: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `PATHFORK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `PATHFORK_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_STATE_BUFFER_SIZE) {
            config.preferred_state_size = parse(ENV_STATE_BUFFER_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SHRINK_STABLE_SAVES) {
            config.shrink_stable_saves = parse(ENV_SHRINK_STABLE_SAVES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_FORK_DEPTH) {
            config.max_fork_depth = Some(parse(ENV_MAX_FORK_DEPTH, &raw)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.preferred_state_size > MAX_STATE_BUFFER_SIZE {
            return Err(SnapshotError::InvalidConfig(format!(
                "preferred_state_size {} exceeds {MAX_STATE_BUFFER_SIZE} bytes",
                self.preferred_state_size
            )));
        }
        if self.max_fork_depth == Some(0) {
            return Err(SnapshotError::InvalidConfig(
                "max_fork_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| SnapshotError::InvalidConfig(format!("{key}: cannot parse {raw:?}")))
}
