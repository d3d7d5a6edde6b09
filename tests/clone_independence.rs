mod harness;

use std::collections::HashMap;

use harness::{Machine, RegisterBank};
use pathfork_snapshot::DeviceStateSnapshot;
use pathfork_storage::SECTOR_SIZE;
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

const DISK_SECTORS: u64 = 1000;

#[derive(Debug, Clone)]
enum Op {
    Fork { path: usize },
    Run { path: usize, ticks: u64, byte: u8 },
    Write { path: usize, sector: u64, fill: u8 },
    Read { path: usize, sector: u64 },
    Kill { path: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => any::<usize>().prop_map(|path| Op::Fork { path }),
        3 => (any::<usize>(), any::<u64>(), any::<u8>())
            .prop_map(|(path, ticks, byte)| Op::Run { path, ticks, byte }),
        3 => (any::<usize>(), 0..DISK_SECTORS, any::<u8>())
            .prop_map(|(path, sector, fill)| Op::Write { path, sector, fill }),
        3 => (any::<usize>(), 0..DISK_SECTORS).prop_map(|(path, sector)| Op::Read { path, sector }),
        1 => any::<usize>().prop_map(|path| Op::Kill { path }),
    ]
}

struct Path {
    snapshot: DeviceStateSnapshot,
    devices: (RegisterBank, RegisterBank),
    sectors: HashMap<u64, u8>,
}

fn run(ops: Vec<Op>) -> TestCaseResult {
    let m = Machine::new(DISK_SECTORS);
    let mut root = m.engine.root_snapshot().unwrap();
    root.save_device_state().unwrap();
    let mut paths = vec![Path {
        snapshot: root,
        devices: m.devices(),
        sectors: HashMap::new(),
    }];

    for op in ops {
        if paths.is_empty() {
            break;
        }
        match op {
            Op::Fork { path } => {
                let mut parent = paths.swap_remove(path % paths.len());
                let (a, b) = parent.snapshot.fork().unwrap();
                paths.push(Path {
                    snapshot: a,
                    devices: parent.devices.clone(),
                    sectors: parent.sectors.clone(),
                });
                paths.push(Path {
                    snapshot: b,
                    devices: parent.devices,
                    sectors: parent.sectors,
                });
            }
            Op::Run { path, ticks, byte } => {
                let n = paths.len();
                let p = &mut paths[path % n];
                p.snapshot.restore_device_state().unwrap();
                prop_assert_eq!(&m.devices(), &p.devices);

                {
                    let mut timer = m.timer.borrow_mut();
                    timer.ticks = timer.ticks.wrapping_add(ticks);
                    timer.regs[(ticks % 4) as usize] ^= u32::from(byte);
                    timer.irq_pending = byte & 1 == 1;
                }
                {
                    let mut nic = m.nic.borrow_mut();
                    if nic.fifo.len() >= 64 {
                        nic.fifo.clear();
                    }
                    nic.fifo.push(byte);
                }
                p.snapshot.save_device_state().unwrap();
                p.devices = m.devices();
            }
            Op::Write { path, sector, fill } => {
                let n = paths.len();
                let p = &mut paths[path % n];
                p.snapshot
                    .write_sector(m.disk, sector, &[fill; SECTOR_SIZE])
                    .unwrap();
                p.sectors.insert(sector, fill);
            }
            Op::Read { path, sector } => {
                let p = &paths[path % paths.len()];
                let data = p.snapshot.read_sector_from_base(m.disk, sector).unwrap();
                let expected = p.sectors.get(&sector).copied().unwrap_or(0);
                prop_assert!(data.iter().all(|&b| b == expected));
            }
            Op::Kill { path } => {
                paths.swap_remove(path % paths.len());
            }
        }
    }

    // Every surviving path still resumes with exactly its own devices and disk.
    for p in &mut paths {
        p.snapshot.restore_device_state().unwrap();
        prop_assert_eq!(&m.devices(), &p.devices);
        for (&sector, &fill) in &p.sectors {
            let data = p.snapshot.read_sector_from_base(m.disk, sector).unwrap();
            prop_assert!(data.iter().all(|&b| b == fill));
        }
    }

    drop(paths);
    let stats = m.engine.lineage_stats();
    prop_assert_eq!(stats.live_nodes, 0);
    prop_assert_eq!(stats.overlay_bytes, 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn paths_stay_independent(ops in proptest::collection::vec(op_strategy(), 0..80)) {
        run(ops)?;
    }
}
