#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use pathfork_io_snapshot::{DeviceId, SnapshotDevice, SnapshotStream};
use pathfork_snapshot::{DeviceStateEngine, EngineConfig};
use pathfork_storage::{DiskHandle, ZeroImage};

pub const TIMER: DeviceId = DeviceId::singleton(*b"TIMR");
pub const NIC: DeviceId = DeviceId::new(*b"NIC_", 0);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Small device model: a counter, a handful of registers and a variable-length FIFO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterBank {
    pub ticks: u64,
    pub regs: [u32; 4],
    pub irq_pending: bool,
    pub fifo: Vec<u8>,
}

impl SnapshotDevice for RegisterBank {
    fn save(&self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        stream.put_u64(self.ticks)?;
        for reg in self.regs {
            stream.put_u32(reg)?;
        }
        stream.put_bool(self.irq_pending)?;
        stream.put_len_prefixed(&self.fifo)
    }

    fn restore(&mut self, stream: &mut SnapshotStream) -> pathfork_io_snapshot::Result<()> {
        self.ticks = stream.get_u64()?;
        for reg in &mut self.regs {
            *reg = stream.get_u32()?;
        }
        self.irq_pending = stream.get_bool()?;
        self.fifo = stream.get_len_prefixed(4096)?.to_vec();
        Ok(())
    }
}

/// An engine with two register banks and one zero-filled disk.
pub struct Machine {
    pub engine: DeviceStateEngine,
    pub timer: Rc<RefCell<RegisterBank>>,
    pub nic: Rc<RefCell<RegisterBank>>,
    pub disk: DiskHandle,
}

impl Machine {
    pub fn new(disk_sectors: u64) -> Self {
        Self::with_config(disk_sectors, EngineConfig::default())
    }

    pub fn with_config(disk_sectors: u64, config: EngineConfig) -> Self {
        let engine = DeviceStateEngine::new(config).unwrap();
        let timer = Rc::new(RefCell::new(RegisterBank::default()));
        let nic = Rc::new(RefCell::new(RegisterBank::default()));
        engine
            .init_devices(|reg| {
                reg.register_device(TIMER, timer.clone())?;
                reg.register_device(NIC, nic.clone())
            })
            .unwrap();
        let disk = engine
            .attach_disk("hda", Box::new(ZeroImage::new(disk_sectors)))
            .unwrap();
        Self {
            engine,
            timer,
            nic,
            disk,
        }
    }

    pub fn devices(&self) -> (RegisterBank, RegisterBank) {
        (self.timer.borrow().clone(), self.nic.borrow().clone())
    }
}
