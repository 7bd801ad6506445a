use crate::plat::Width;

use super::EmuError;

/// Default guest memory size: 128 MiB.
pub const DEFAULT_RAM_SIZE: usize = 0x800_0000;

/// Guest physical memory. Multi-byte accesses are little-endian.
pub struct Ram {
    pub memory: Box<[u8]>,
}

impl Ram {
    /// Creates a new [`Ram`] instance of `size` bytes, initialized to zero.
    pub fn new(size: usize) -> Self {
        Self {
            memory: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }

    fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>, EmuError> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.memory.len() => Ok(start..end),
            _ => Err(EmuError::MemoryFault {
                addr,
                width: match len {
                    1 => Width::Byte,
                    2 => Width::Word,
                    _ => Width::Long,
                },
            }),
        }
    }

    /// Reads `width` bytes at `addr`, zero-extended to 32 bits.
    pub fn read(&self, addr: u32, width: Width) -> Result<u32, EmuError> {
        let range = self.range(addr, width.bytes())?;
        let mut buf = [0u8; 4];
        buf[..width.bytes()].copy_from_slice(&self.memory[range]);
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes the low `width` bytes of `value` at `addr`.
    pub fn write(&mut self, addr: u32, width: Width, value: u32) -> Result<(), EmuError> {
        let range = self.range(addr, width.bytes())?;
        self.memory[range].copy_from_slice(&value.to_le_bytes()[..width.bytes()]);
        Ok(())
    }

    /// Copies a raw binary image into memory at `addr`.
    pub fn load_image(&mut self, addr: u32, image: &[u8]) -> Result<(), EmuError> {
        let range = self.range(addr, image.len())?;
        self.memory[range].copy_from_slice(image);
        log::info!(
            "loaded {} byte image at {:#010x}",
            image.len(),
            addr
        );
        Ok(())
    }
}

impl Default for Ram {
    fn default() -> Self {
        Self::new(DEFAULT_RAM_SIZE)
    }
}
