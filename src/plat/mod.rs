//! Common platform definitions shared by the emulator and the monitor.

use std::fmt;

use thiserror::Error;

/// An error for the core platform definitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("invalid register encoding {0}")]
    InvalidRegister(u8),
}

/// Type alias for Result<T, [PlatformError]>.
pub type PResult<T> = Result<T, PlatformError>;

/// The width of a memory, port or register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Width {
    Byte = 1,
    Word = 2,
    Long = 4,
}

impl Width {
    /// Number of bytes covered by an access of this width.
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Mask selecting the low bits that fit in this width.
    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xff,
            Width::Word => 0xffff,
            Width::Long => 0xffff_ffff,
        }
    }
}

/// The eight general purpose registers, in ModRM encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];
}

impl TryFrom<u8> for Gpr {
    type Error = PlatformError;

    fn try_from(value: u8) -> PResult<Self> {
        Gpr::ALL
            .get(value as usize)
            .copied()
            .ok_or(PlatformError::InvalidRegister(value))
    }
}

/// The 8-bit register views. `Al`..`Bl` alias bits 0-7 of eax..ebx, `Ah`..`Bh` alias bits 8-15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ByteReg {
    Al = 0,
    Cl,
    Dl,
    Bl,
    Ah,
    Ch,
    Dh,
    Bh,
}

impl ByteReg {
    pub const ALL: [ByteReg; 8] = [
        ByteReg::Al,
        ByteReg::Cl,
        ByteReg::Dl,
        ByteReg::Bl,
        ByteReg::Ah,
        ByteReg::Ch,
        ByteReg::Dh,
        ByteReg::Bh,
    ];

    /// The 32-bit register this view lives in, and the bit offset of the view within it.
    pub fn location(self) -> (Gpr, u32) {
        let idx = self as u8;
        // indices are masked to 0..4, so the conversion cannot fail
        let gpr = Gpr::ALL[(idx & 3) as usize];
        (gpr, if idx & 4 != 0 { 8 } else { 0 })
    }
}

impl TryFrom<u8> for ByteReg {
    type Error = PlatformError;

    fn try_from(value: u8) -> PResult<Self> {
        ByteReg::ALL
            .get(value as usize)
            .copied()
            .ok_or(PlatformError::InvalidRegister(value))
    }
}

pub const REGS_L: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
pub const REGS_W: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
pub const REGS_B: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];

/// Any addressable view of the general purpose register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Long(Gpr),
    Word(Gpr),
    Byte(ByteReg),
}

impl Register {
    /// Looks up a bare register name in the 32-, 16- and 8-bit name tables, in that order.
    pub fn from_name(name: &str) -> Option<Self> {
        let find = |table: &[&str; 8]| table.iter().position(|r| r.eq_ignore_ascii_case(name));
        if let Some(i) = find(&REGS_L) {
            return Some(Register::Long(Gpr::ALL[i]));
        }
        if let Some(i) = find(&REGS_W) {
            return Some(Register::Word(Gpr::ALL[i]));
        }
        find(&REGS_B).map(|i| Register::Byte(ByteReg::ALL[i]))
    }

    /// The accumulator view for an access of the given width (al, ax or eax).
    pub fn accumulator(width: Width) -> Self {
        match width {
            Width::Byte => Register::Byte(ByteReg::Al),
            Width::Word => Register::Word(Gpr::Eax),
            Width::Long => Register::Long(Gpr::Eax),
        }
    }

    pub fn width(self) -> Width {
        match self {
            Register::Long(_) => Width::Long,
            Register::Word(_) => Width::Word,
            Register::Byte(_) => Width::Byte,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::Long(r) => REGS_L[r as usize],
            Register::Word(r) => REGS_W[r as usize],
            Register::Byte(r) => REGS_B[r as usize],
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name())
    }
}

bitflags::bitflags! {
    /// The EFLAGS register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        /// Always reads as 1.
        const RESERVED = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        /// Single-step trap.
        const TF = 1 << 8;
        /// Maskable interrupts enabled.
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

impl Default for Eflags {
    fn default() -> Self {
        Eflags::RESERVED
    }
}

/// The interrupt descriptor table register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Idtr {
    pub limit: u16,
    pub base: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_names() {
        assert_eq!(Register::from_name("eax"), Some(Register::Long(Gpr::Eax)));
        assert_eq!(Register::from_name("SP"), Some(Register::Word(Gpr::Esp)));
        assert_eq!(Register::from_name("bh"), Some(Register::Byte(ByteReg::Bh)));
        assert_eq!(Register::from_name("eip"), None);
        assert_eq!(Register::from_name("xyz"), None);
    }

    #[test]
    fn test_byte_reg_location() {
        assert_eq!(ByteReg::Al.location(), (Gpr::Eax, 0));
        assert_eq!(ByteReg::Ah.location(), (Gpr::Eax, 8));
        assert_eq!(ByteReg::Bh.location(), (Gpr::Ebx, 8));
    }

    #[test]
    fn test_gpr_decode() {
        assert_eq!(Gpr::try_from(7), Ok(Gpr::Edi));
        assert_eq!(Gpr::try_from(8), Err(PlatformError::InvalidRegister(8)));
    }
}
