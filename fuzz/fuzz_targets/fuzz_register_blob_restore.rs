#![no_main]

use std::cell::RefCell;
use std::rc::Rc;

use libfuzzer_sys::fuzz_target;
use pathfork_io_snapshot::{DeviceId, DeviceRegistry, SnapshotDevice, SnapshotStream};

#[derive(Default)]
struct Fifo {
    head: u16,
    bytes: Vec<u8>,
    enabled: bool,
}

impl SnapshotDevice for Fifo {
    fn save(&self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        stream.put_u16(self.head)?;
        stream.put_len_prefixed(&self.bytes)?;
        stream.put_bool(self.enabled)
    }

    fn restore(&mut self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        self.head = stream.get_u16()?;
        self.bytes = stream.get_len_prefixed(4096)?.to_vec();
        self.enabled = stream.get_bool()?;
        Ok(())
    }
}

#[derive(Default)]
struct Regs([u64; 3]);

impl SnapshotDevice for Regs {
    fn save(&self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        self.0.iter().try_for_each(|&r| stream.put_u64(r))
    }

    fn restore(&mut self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        for r in &mut self.0 {
            *r = stream.get_u64()?;
        }
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let mut registry = DeviceRegistry::new();
    let _ = registry.register_device(
        DeviceId::singleton(*b"FIFO"),
        Rc::new(RefCell::new(Fifo::default())),
    );
    let _ = registry.register_device(
        DeviceId::new(*b"REGS", 3),
        Rc::new(RefCell::new(Regs::default())),
    );

    let Ok(mut stream) = SnapshotStream::from_bytes(data) else {
        return;
    };
    if registry.restore_devices(&mut stream).is_ok() {
        // Anything accepted must re-serialize to exactly the same bytes.
        let mut out = SnapshotStream::new();
        registry
            .save_devices(&mut out)
            .expect("save after successful restore");
        assert_eq!(out.as_bytes(), data);
    }
});
