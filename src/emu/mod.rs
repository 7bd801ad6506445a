//! The emulator/debugger module.

use thiserror::Error;

use crate::plat::{PlatformError, Width};

pub mod debugger;
pub mod decode;
pub mod emulator;
pub mod intr;
pub mod pio;
pub mod ram;
pub mod registers;
pub mod system;
pub mod watchpoint;

/// A fatal emulator error. Any of these ends the guest run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmuError {
    #[error("memory fault: {width:?} access at {addr:#010x}")]
    MemoryFault { addr: u32, width: Width },
    #[error("invalid opcode {opcode:#04x} at {eip:#010x}")]
    InvalidOpcode { opcode: u8, eip: u32 },
    #[error("unimplemented instruction `{mnemonic}` at {eip:#010x}")]
    Unimplemented { mnemonic: &'static str, eip: u32 },
    #[error("interrupt vector {vector:#04x} is beyond the IDT limit {limit:#06x}")]
    IdtLimit { vector: u8, limit: u16 },
    #[error("interrupt gate {0:#04x} is not present")]
    GateNotPresent(u8),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}
