#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pathfork_storage::{BlockLineage, LineageId, SECTOR_SIZE};

const DISK_SECTORS: u64 = 64;

#[derive(Debug, Arbitrary)]
enum Op {
    Fork(u8),
    Write { path: u8, sector: u8, fill: u8 },
    Read { path: u8, sector: u8 },
    Release(u8),
    ReleaseStale(u8),
}

fn pick(i: u8, len: usize) -> usize {
    usize::from(i) % len
}

fuzz_target!(|ops: Vec<Op>| {
    let mut lineage = BlockLineage::new();
    let Ok(disk) = lineage.attach_disk("hda", DISK_SECTORS) else {
        return;
    };
    let Ok(root) = lineage.create_root() else {
        return;
    };
    let mut live: Vec<LineageId> = vec![root];
    let mut dead: Vec<LineageId> = Vec::new();

    for op in ops.into_iter().take(256) {
        if live.is_empty() {
            break;
        }
        match op {
            Op::Fork(i) => {
                let parent = live.swap_remove(pick(i, live.len()));
                let (a, b) = lineage.fork(parent).expect("fork live node");
                lineage.release(parent).expect("release forked parent");
                live.push(a);
                live.push(b);
            }
            Op::Write { path, sector, fill } => {
                let id = live[pick(path, live.len())];
                let sector = u64::from(sector) % DISK_SECTORS;
                lineage
                    .write_sector(id, disk, sector, &[fill; SECTOR_SIZE])
                    .expect("write to leaf");
            }
            Op::Read { path, sector } => {
                let id = live[pick(path, live.len())];
                let mut buf = [0u8; SECTOR_SIZE];
                lineage
                    .read_sector(id, disk, u64::from(sector), &mut buf, |_, _, buf| {
                        buf.fill(0);
                        Ok(())
                    })
                    .ok();
            }
            Op::Release(i) => {
                let id = live.swap_remove(pick(i, live.len()));
                lineage.release(id).expect("release live node");
                dead.push(id);
            }
            Op::ReleaseStale(i) => {
                if !dead.is_empty() {
                    let id = dead[pick(i, dead.len())];
                    assert!(lineage.release(id).is_err());
                }
            }
        }
    }

    for id in live {
        lineage.release(id).expect("release survivor");
    }
    assert_eq!(lineage.stats().live_nodes, 0);
    assert_eq!(lineage.stats().overlay_bytes, 0);
});
