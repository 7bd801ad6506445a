#![cfg_attr(doc, warn(missing_docs))]
//! An emulator for a 32-bit x86 subset with a source-level monitor: expression evaluation,
//! watchpoints, and the system instructions that drive interrupt delivery and port I/O.

pub mod demo;
pub mod emu;
pub mod expr;
pub mod plat;
