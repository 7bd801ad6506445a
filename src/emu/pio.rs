use std::io::Write;

use rustc_hash::FxHashMap;

use crate::plat::Width;

/// Port of the serial console.
pub const SERIAL_PORT: u16 = 0x3f8;

/// The platform's I/O space, as seen by `in` and `out`.
pub trait PortIo {
    fn pio_read(&mut self, port: u16, width: Width) -> u32;
    fn pio_write(&mut self, port: u16, width: Width, value: u32);
}

/// A device mapped at one port address.
pub trait PortDevice {
    fn read(&mut self, width: Width) -> u32;
    fn write(&mut self, width: Width, value: u32);
}

/// Dispatches port transactions to the devices mapped on it.
#[derive(Default)]
pub struct PortBus {
    devices: FxHashMap<u16, Box<dyn PortDevice>>,
}

impl PortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with the serial console mapped at [`SERIAL_PORT`].
    pub fn with_serial() -> Self {
        let mut bus = Self::new();
        bus.map(SERIAL_PORT, Box::new(SerialPort::new(std::io::stdout())));
        bus
    }

    /// Maps `device` at `port`, returning the device previously mapped there.
    pub fn map(&mut self, port: u16, device: Box<dyn PortDevice>) -> Option<Box<dyn PortDevice>> {
        self.devices.insert(port, device)
    }
}

impl PortIo for PortBus {
    fn pio_read(&mut self, port: u16, width: Width) -> u32 {
        match self.devices.get_mut(&port) {
            Some(dev) => dev.read(width) & width.mask(),
            None => {
                log::warn!("read from unmapped port {:#06x}", port);
                width.mask()
            }
        }
    }

    fn pio_write(&mut self, port: u16, width: Width, value: u32) {
        match self.devices.get_mut(&port) {
            Some(dev) => dev.write(width, value & width.mask()),
            None => log::warn!(
                "write of {:#x} to unmapped port {:#06x} dropped",
                value & width.mask(),
                port
            ),
        }
    }
}

/// A transmit-only serial port. Each write emits the low byte to the host.
pub struct SerialPort<W: Write> {
    out: W,
}

impl<W: Write> SerialPort<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> PortDevice for SerialPort<W> {
    fn read(&mut self, _width: Width) -> u32 {
        // line status: transmitter always empty
        0x20
    }

    fn write(&mut self, _width: Width, value: u32) {
        let byte = [(value & 0xff) as u8];
        if let Err(e) = self.out.write_all(&byte).and_then(|_| self.out.flush()) {
            log::error!("serial output failed: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    /// A latch device that remembers the last value written to it.
    #[derive(Clone, Default)]
    pub(crate) struct Latch(pub Rc<RefCell<Vec<(Width, u32)>>>);

    impl PortDevice for Latch {
        fn read(&mut self, _width: Width) -> u32 {
            self.0.borrow().last().map(|(_, v)| *v).unwrap_or(0x1234_5678)
        }

        fn write(&mut self, width: Width, value: u32) {
            self.0.borrow_mut().push((width, value));
        }
    }

    #[test]
    fn test_unmapped_port_reads_all_ones() {
        let mut bus = PortBus::new();
        assert_eq!(bus.pio_read(0x60, Width::Byte), 0xff);
        assert_eq!(bus.pio_read(0x60, Width::Long), 0xffff_ffff);
        bus.pio_write(0x60, Width::Byte, 1);
    }

    #[test]
    fn test_mapped_device_masks_width() {
        let latch = Latch::default();
        let mut bus = PortBus::new();
        bus.map(0x80, Box::new(latch.clone()));
        assert_eq!(bus.pio_read(0x80, Width::Word), 0x5678);
        bus.pio_write(0x80, Width::Byte, 0x1ff);
        assert_eq!(latch.0.borrow()[..], [(Width::Byte, 0xff)]);
    }

    #[test]
    fn test_serial_port_output() {
        let mut serial = SerialPort::new(Vec::new());
        serial.write(Width::Byte, 0x4148);
        serial.write(Width::Byte, u32::from(b'i'));
        assert_eq!(serial.out, b"Hi");
    }
}
