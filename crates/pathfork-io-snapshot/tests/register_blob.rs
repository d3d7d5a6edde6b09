use std::cell::RefCell;
use std::rc::Rc;

use pathfork_io_snapshot::{
    DeviceId, DeviceRegistry, Result, SnapshotDevice, SnapshotStream, StateError,
};
use proptest::prelude::*;

const UART: DeviceId = DeviceId::singleton(*b"UART");
const CMOS: DeviceId = DeviceId::singleton(*b"CMOS");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Uart {
    ier: u8,
    lcr: u8,
    divisor: u16,
    scratch: u8,
    fifo: Vec<u8>,
}

impl SnapshotDevice for Uart {
    fn save(&self, stream: &mut SnapshotStream) -> Result<()> {
        stream.put_byte(self.ier)?;
        stream.put_byte(self.lcr)?;
        stream.put_u16(self.divisor)?;
        stream.put_byte(self.scratch)?;
        stream.put_len_prefixed(&self.fifo)
    }

    fn restore(&mut self, stream: &mut SnapshotStream) -> Result<()> {
        self.ier = stream.get_byte()?;
        self.lcr = stream.get_byte()?;
        self.divisor = stream.get_u16()?;
        self.scratch = stream.get_byte()?;
        self.fifo = stream.get_len_prefixed(64)?.to_vec();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cmos {
    index: u8,
    nmi_masked: bool,
    ram: [u8; 128],
}

impl Default for Cmos {
    fn default() -> Self {
        Self {
            index: 0,
            nmi_masked: false,
            ram: [0; 128],
        }
    }
}

impl SnapshotDevice for Cmos {
    fn save(&self, stream: &mut SnapshotStream) -> Result<()> {
        stream.put_byte(self.index)?;
        stream.put_bool(self.nmi_masked)?;
        stream.put_buffer(&self.ram)
    }

    fn restore(&mut self, stream: &mut SnapshotStream) -> Result<()> {
        self.index = stream.get_byte()?;
        self.nmi_masked = stream.get_bool()?;
        stream.get_into(&mut self.ram)
    }
}

/// Reads one byte fewer than [`Uart`] writes.
struct ShortReader;

impl SnapshotDevice for ShortReader {
    fn save(&self, stream: &mut SnapshotStream) -> Result<()> {
        stream.put_u32(0)
    }

    fn restore(&mut self, stream: &mut SnapshotStream) -> Result<()> {
        stream.get_u16()?;
        stream.get_byte()?;
        Ok(())
    }
}

fn uart_strategy() -> impl Strategy<Value = Uart> {
    (
        any::<u8>(),
        any::<u8>(),
        any::<u16>(),
        any::<u8>(),
        proptest::collection::vec(any::<u8>(), 0..=64),
    )
        .prop_map(|(ier, lcr, divisor, scratch, fifo)| Uart {
            ier,
            lcr,
            divisor,
            scratch,
            fifo,
        })
}

fn cmos_strategy() -> impl Strategy<Value = Cmos> {
    (
        any::<u8>(),
        any::<bool>(),
        proptest::collection::vec(any::<u8>(), 128),
    )
        .prop_map(|(index, nmi_masked, ram)| {
            let mut cmos = Cmos {
                index,
                nmi_masked,
                ..Cmos::default()
            };
            cmos.ram.copy_from_slice(&ram);
            cmos
        })
}

proptest! {
    #[test]
    fn save_then_restore_reproduces_registers(uart in uart_strategy(), cmos in cmos_strategy()) {
        let live_uart = Rc::new(RefCell::new(uart.clone()));
        let live_cmos = Rc::new(RefCell::new(cmos.clone()));
        let mut reg = DeviceRegistry::new();
        reg.init_once(|reg| {
            reg.register_device(UART, live_uart.clone())?;
            reg.register_device(CMOS, live_cmos.clone())
        }).unwrap();

        let mut blob = SnapshotStream::new();
        reg.save_devices(&mut blob).unwrap();

        *live_uart.borrow_mut() = Uart::default();
        *live_cmos.borrow_mut() = Cmos::default();

        blob.reset();
        reg.restore_devices(&mut blob).unwrap();
        prop_assert_eq!(&*live_uart.borrow(), &uart);
        prop_assert_eq!(&*live_cmos.borrow(), &cmos);
    }

    #[test]
    fn restore_never_panics_on_garbage(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut reg = DeviceRegistry::new();
        reg.register_device(UART, Rc::new(RefCell::new(Uart::default()))).unwrap();
        reg.register_device(CMOS, Rc::new(RefCell::new(Cmos::default()))).unwrap();

        let mut blob = SnapshotStream::from_bytes(&data).unwrap();
        let _ = reg.restore_devices(&mut blob);
    }
}

#[test]
fn reordered_registration_is_detected() {
    let uart = Rc::new(RefCell::new(Uart::default()));
    let cmos = Rc::new(RefCell::new(Cmos::default()));

    let mut saving = DeviceRegistry::new();
    saving.register_device(UART, uart.clone()).unwrap();
    saving.register_device(CMOS, cmos.clone()).unwrap();
    let mut blob = SnapshotStream::new();
    saving.save_devices(&mut blob).unwrap();

    let mut restoring = DeviceRegistry::new();
    restoring.register_device(CMOS, cmos).unwrap();
    restoring.register_device(UART, uart).unwrap();

    blob.reset();
    let err = restoring.restore_devices(&mut blob).unwrap_err();
    assert_eq!(
        err,
        StateError::UnknownSection {
            expected: CMOS,
            found: UART
        }
    );
    assert!(err.is_fatal());
}

#[test]
fn callback_reading_too_little_is_detected() {
    let dev = DeviceId::singleton(*b"SHRT");
    let mut reg = DeviceRegistry::new();
    reg.register_device(dev, Rc::new(RefCell::new(ShortReader)))
        .unwrap();

    let mut blob = SnapshotStream::new();
    reg.save_devices(&mut blob).unwrap();
    blob.reset();
    assert_eq!(
        reg.restore_devices(&mut blob).unwrap_err(),
        StateError::SectionLengthMismatch {
            device: dev,
            expected: 4,
            consumed: 3
        }
    );
}

#[test]
fn callback_reading_too_much_overruns_its_section() {
    let uart = DeviceId::singleton(*b"UART");
    let mut saving = DeviceRegistry::new();
    saving
        .register_device(uart, Rc::new(RefCell::new(ShortReader)))
        .unwrap();
    let mut blob = SnapshotStream::new();
    saving.save_devices(&mut blob).unwrap();

    // Same identity, but a restore callback expecting the full UART layout.
    let mut restoring = DeviceRegistry::new();
    restoring
        .register_device(uart, Rc::new(RefCell::new(Uart::default())))
        .unwrap();
    blob.reset();
    let err = restoring.restore_devices(&mut blob).unwrap_err();
    assert!(matches!(err, StateError::BufferOverrun { device, .. } if device == uart));
}
