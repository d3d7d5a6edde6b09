use crate::{BlockLineage, DiskHandle, LineageId, Result, SECTOR_SIZE};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Fork { path: usize },
    Write { path: usize, sector: u64, fill: u8 },
    Read { path: usize, sector: u64 },
    Kill { path: usize },
}

const DISK_SECTORS: u64 = 32;
const MAX_OPS: usize = 96;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => any::<usize>().prop_map(|path| Op::Fork { path }),
        4 => (any::<usize>(), 0..DISK_SECTORS, any::<u8>())
            .prop_map(|(path, sector, fill)| Op::Write { path, sector, fill }),
        4 => (any::<usize>(), 0..DISK_SECTORS).prop_map(|(path, sector)| Op::Read { path, sector }),
        1 => any::<usize>().prop_map(|path| Op::Kill { path }),
    ]
}

/// Base image content: every byte of sector `i` is `i`.
fn base_fallback(_: DiskHandle, index: u64, buf: &mut [u8]) -> Result<()> {
    buf.fill(index as u8);
    Ok(())
}

/// One live path: its lineage node plus a naive full copy of the disk it should observe.
struct Path {
    node: LineageId,
    model: Vec<u8>,
}

fn run(ops: Vec<Op>) -> TestCaseResult {
    let mut lineage = BlockLineage::new();
    let disk = lineage.attach_disk("hda", DISK_SECTORS).unwrap();
    let root = lineage.create_root().unwrap();
    let mut paths = vec![Path {
        node: root,
        model: (0..DISK_SECTORS).map(|i| i as u8).collect(),
    }];

    for op in ops {
        if paths.is_empty() {
            break;
        }
        match op {
            Op::Fork { path } => {
                let idx = path % paths.len();
                let parent = paths.swap_remove(idx);
                let (a, b) = lineage.fork(parent.node).unwrap();
                // The forking path no longer owns the parent as its current node.
                lineage.release(parent.node).unwrap();
                paths.push(Path {
                    node: a,
                    model: parent.model.clone(),
                });
                paths.push(Path {
                    node: b,
                    model: parent.model,
                });
            }
            Op::Write { path, sector, fill } => {
                let idx = path % paths.len();
                lineage
                    .write_sector(paths[idx].node, disk, sector, &[fill; SECTOR_SIZE])
                    .unwrap();
                paths[idx].model[sector as usize] = fill;
            }
            Op::Read { path, sector } => {
                let p = &paths[path % paths.len()];
                let mut buf = [0u8; SECTOR_SIZE];
                lineage
                    .read_sector(p.node, disk, sector, &mut buf, base_fallback)
                    .unwrap();
                let expected = p.model[sector as usize];
                prop_assert!(buf.iter().all(|&b| b == expected));
            }
            Op::Kill { path } => {
                let idx = path % paths.len();
                let p = paths.swap_remove(idx);
                lineage.release(p.node).unwrap();
            }
        }
    }

    // Every surviving path still sees its own disk.
    for p in &paths {
        for sector in 0..DISK_SECTORS {
            let mut buf = [0u8; SECTOR_SIZE];
            lineage
                .read_sector(p.node, disk, sector, &mut buf, base_fallback)
                .unwrap();
            prop_assert!(buf.iter().all(|&b| b == p.model[sector as usize]));
        }
    }

    prop_assert!(lineage.stats().live_nodes >= paths.len());
    for p in paths {
        lineage.release(p.node).unwrap();
    }
    let stats = lineage.stats();
    prop_assert_eq!(stats.live_nodes, 0);
    prop_assert_eq!(stats.overlay_sectors, 0);
    prop_assert_eq!(stats.overlay_bytes, 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    #[test]
    fn lineage_matches_full_copy_model(ops in proptest::collection::vec(op_strategy(), 0..MAX_OPS)) {
        run(ops)?;
    }
}
