use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use pathfork_io_snapshot::{DeviceId, SnapshotDevice, SnapshotStream};
use pathfork_snapshot::{DeviceStateEngine, DeviceStateSnapshot, EngineConfig};
use pathfork_storage::{BaseImage, FileImage, ZeroImage, SECTOR_SIZE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

const DEFAULT_SECTORS: u64 = 2 * 1024 * 1024; // 1 GiB

#[derive(Parser, Debug)]
#[command(
    name = "pathfork-bench",
    about = "Drive a random fork tree over toy devices and a copy-on-write disk, then report lineage statistics."
)]
struct Args {
    /// Size of the zero-filled base disk in sectors (ignored with --image)
    #[arg(long, value_name = "SECTORS", default_value_t = DEFAULT_SECTORS)]
    sectors: u64,

    /// Use this raw disk image as the base disk instead of a zero-filled one
    #[arg(long, value_name = "PATH")]
    image: Option<PathBuf>,

    /// Number of forks to perform
    #[arg(long, default_value_t = 256)]
    forks: u32,

    /// Sector writes each path performs before it forks
    #[arg(long, value_name = "N", default_value_t = 8)]
    writes_per_path: u32,

    /// Seed for the path scheduler
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Refuse forks deeper than this (overrides PATHFORK_MAX_FORK_DEPTH)
    #[arg(long, value_name = "DEPTH")]
    max_fork_depth: Option<u32>,

    /// Print the report as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    seed: u64,
    disk_sectors: u64,
    forks: u64,
    depth_limited_forks: u64,
    live_paths: usize,
    max_depth: u32,
    register_blob_bytes: usize,
    live_nodes: usize,
    overlay_sectors: u64,
    overlay_bytes: u64,
    released_nodes: u64,
    mean_fork_ns: u64,
    mean_restore_ns: u64,
    released_cleanly: bool,
}

/// Interrupt controller model: a mask and a request latch.
#[derive(Default)]
struct Pic {
    imr: u8,
    irr: u8,
}

impl SnapshotDevice for Pic {
    fn save(&self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        stream.put_byte(self.imr)?;
        stream.put_byte(self.irr)
    }

    fn restore(&mut self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        self.imr = stream.get_byte()?;
        self.irr = stream.get_byte()?;
        Ok(())
    }
}

/// Serial port model with a receive FIFO whose length varies per path.
#[derive(Default)]
struct Uart {
    lcr: u8,
    divisor: u16,
    rx: Vec<u8>,
}

impl SnapshotDevice for Uart {
    fn save(&self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        stream.put_byte(self.lcr)?;
        stream.put_u16(self.divisor)?;
        stream.put_len_prefixed(&self.rx)
    }

    fn restore(&mut self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        self.lcr = stream.get_byte()?;
        self.divisor = stream.get_u16()?;
        self.rx = stream.get_len_prefixed(UART_FIFO_LEN)?.to_vec();
        Ok(())
    }
}

const UART_FIFO_LEN: usize = 16;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let report = run(&args)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    if !report.released_cleanly {
        bail!("lineage nodes leaked after all paths were destroyed");
    }
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<Report> {
    let mut config = EngineConfig::from_env().context("read PATHFORK_* configuration")?;
    if args.max_fork_depth.is_some() {
        config.max_fork_depth = args.max_fork_depth;
    }
    let engine = DeviceStateEngine::new(config).context("create engine")?;

    let pic = Rc::new(RefCell::new(Pic::default()));
    let uart = Rc::new(RefCell::new(Uart::default()));
    engine.init_devices(|reg| {
        reg.register_device(DeviceId::singleton(*b"PIC "), pic.clone())?;
        reg.register_device(DeviceId::new(*b"UART", 0), uart.clone())
    })?;

    let image: Box<dyn BaseImage> = match &args.image {
        Some(path) => Box::new(
            FileImage::open(path).with_context(|| format!("open image {}", path.display()))?,
        ),
        None => Box::new(ZeroImage::new(args.sectors)),
    };
    let disk_sectors = image.sector_count();
    if disk_sectors == 0 {
        bail!("base disk has no sectors");
    }
    let disk = engine.attach_disk("hda", image)?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut root = engine.root_snapshot()?;
    root.save_device_state()?;
    let mut paths: Vec<DeviceStateSnapshot> = vec![root];

    let mut fork_time = Duration::ZERO;
    let mut restore_time = Duration::ZERO;
    let mut restores = 0u32;
    let mut forks = 0u64;
    let mut depth_limited = 0u64;
    let sector = [0u8; SECTOR_SIZE];

    for _ in 0..args.forks {
        let idx = rng.gen_range(0..paths.len());
        let path = &mut paths[idx];

        let start = Instant::now();
        path.restore_device_state()?;
        restore_time += start.elapsed();
        restores += 1;

        {
            let mut pic = pic.borrow_mut();
            pic.irr |= 1u8 << rng.gen_range(0..8u32);
            pic.imr = rng.gen();
        }
        {
            let mut uart = uart.borrow_mut();
            uart.divisor = uart.divisor.wrapping_add(1);
            if uart.rx.len() == UART_FIFO_LEN {
                uart.rx.clear();
            }
            uart.rx.push(rng.gen());
        }
        for _ in 0..args.writes_per_path {
            let index = rng.gen_range(0..disk_sectors);
            let mut data = sector;
            data[0] = rng.gen();
            path.write_sector(disk, index, &data)?;
        }
        path.save_device_state()?;

        let start = Instant::now();
        let forked = path.fork();
        fork_time += start.elapsed();
        let (left, right) = match forked {
            Ok(children) => children,
            Err(pathfork_snapshot::SnapshotError::DepthLimit { depth, limit }) => {
                tracing::debug!(depth, limit, "path reached fork depth limit");
                depth_limited += 1;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        forks += 1;
        paths.swap_remove(idx);
        paths.push(left);
        paths.push(right);

        // Retire a path now and then so the tree has dead branches to release.
        if paths.len() > 2 && rng.gen_bool(0.25) {
            let victim = rng.gen_range(0..paths.len());
            paths.swap_remove(victim).destroy();
        }
    }

    let mut max_depth = 0;
    let mut register_blob_bytes = 0;
    for path in &paths {
        max_depth = max_depth.max(path.depth()?);
        register_blob_bytes += path.register_blob().len();
    }
    let stats = engine.lineage_stats();
    tracing::info!(
        forks,
        live_paths = paths.len(),
        overlay_sectors = stats.overlay_sectors,
        "fork tree complete"
    );

    let live_paths = paths.len();
    drop(paths);
    let released_cleanly = engine.lineage_stats().live_nodes == 0;

    Ok(Report {
        seed: args.seed,
        disk_sectors,
        forks,
        depth_limited_forks: depth_limited,
        live_paths,
        max_depth,
        register_blob_bytes,
        live_nodes: stats.live_nodes,
        overlay_sectors: stats.overlay_sectors,
        overlay_bytes: stats.overlay_bytes,
        released_nodes: stats.released_nodes,
        mean_fork_ns: mean_nanos(fork_time, forks + depth_limited),
        mean_restore_ns: mean_nanos(restore_time, u64::from(restores)),
        released_cleanly,
    })
}

fn mean_nanos(total: Duration, count: u64) -> u64 {
    if count == 0 {
        return 0;
    }
    u64::try_from(total.as_nanos() / u128::from(count)).unwrap_or(u64::MAX)
}

fn print_summary(report: &Report) {
    println!(
        "{} forks over {} sectors (seed {})",
        report.forks, report.disk_sectors, report.seed
    );
    if report.depth_limited_forks > 0 {
        println!("  {} forks refused at depth limit", report.depth_limited_forks);
    }
    println!(
        "  {} live paths, max depth {}, {} register blob bytes",
        report.live_paths, report.max_depth, report.register_blob_bytes
    );
    println!(
        "  {} lineage nodes, {} overlay sectors ({} bytes)",
        report.live_nodes, report.overlay_sectors, report.overlay_bytes
    );
    println!(
        "  mean fork {} ns, mean restore {} ns",
        report.mean_fork_ns, report.mean_restore_ns
    );
    println!(
        "  lineage {}",
        if report.released_cleanly {
            "fully released"
        } else {
            "LEAKED"
        }
    );
}
