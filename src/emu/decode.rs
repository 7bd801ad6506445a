use std::fmt;

use crate::plat::{ByteReg, Gpr, Register, Width};

use super::{
    registers::MachineState,
    system::{PortSel, SystemOp},
    EmuError,
};

/// A decoded guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    /// Stops the guest; eax holds the exit code.
    Hlt,
    /// `mov $imm, reg`
    MovImm { dest: Register, imm: u32 },
    /// `jmp target`, with the relative displacement already resolved.
    Jmp { target: u32 },
    /// Anything handled by [`system::execute`][super::system::execute].
    System(SystemOp),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Nop => write!(f, "nop"),
            Instruction::Hlt => write!(f, "hlt"),
            Instruction::MovImm { dest, imm } => write!(f, "mov ${:#x},{}", imm, dest),
            Instruction::Jmp { target } => write!(f, "jmp {:#x}", target),
            Instruction::System(op) => write!(f, "{}", op),
        }
    }
}

/// An instruction together with the decoding state the executor needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub instr: Instruction,
    /// Length in bytes, prefixes included.
    pub len: u32,
    /// Set by a 0x66 prefix.
    pub operand_size_16: bool,
}

#[derive(Debug, Clone, Copy)]
struct ModRm {
    mode: u8,
    reg: u8,
    rm: u8,
}

impl From<u8> for ModRm {
    fn from(byte: u8) -> Self {
        Self {
            mode: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
        }
    }
}

/// Reads instruction bytes sequentially from guest memory.
struct Fetch<'m, M: ?Sized> {
    machine: &'m M,
    start: u32,
    pos: u32,
}

impl<'m, M: MachineState + ?Sized> Fetch<'m, M> {
    fn next(&mut self, width: Width) -> Result<u32, EmuError> {
        let value = self.machine.vaddr_read(self.pos, width)?;
        self.pos = self.pos.wrapping_add(width.bytes() as u32);
        Ok(value)
    }

    fn u8(&mut self) -> Result<u8, EmuError> {
        Ok(self.next(Width::Byte)? as u8)
    }

    fn imm(&mut self, width: Width) -> Result<u32, EmuError> {
        self.next(width)
    }

    /// Resolves the memory operand of `modrm` against the current register values.
    fn effective_address(&mut self, modrm: ModRm, mnemonic: &'static str) -> Result<u32, EmuError> {
        let unimplemented = EmuError::Unimplemented {
            mnemonic,
            eip: self.start,
        };
        if modrm.mode == 3 || modrm.rm == 4 {
            // register operands are invalid here, SIB forms are not modelled
            return Err(unimplemented);
        }
        if modrm.mode == 0 && modrm.rm == 5 {
            return self.imm(Width::Long);
        }
        let base = self.machine.gpr(Gpr::try_from(modrm.rm)?);
        let disp = match modrm.mode {
            0 => 0,
            1 => self.u8()? as i8 as u32,
            _ => self.imm(Width::Long)?,
        };
        Ok(base.wrapping_add(disp))
    }
}

/// Decodes the instruction at `eip`.
///
/// # Errors
///
/// Returns [`EmuError::InvalidOpcode`] for opcodes outside the modelled set and
/// [`EmuError::Unimplemented`] for operand forms that are recognized but not modelled.
pub fn decode<M: MachineState + ?Sized>(machine: &M, eip: u32) -> Result<Decoded, EmuError> {
    let mut fetch = Fetch {
        machine,
        start: eip,
        pos: eip,
    };
    let mut operand_size_16 = false;
    let mut opcode = fetch.u8()?;
    while opcode == 0x66 {
        operand_size_16 = true;
        opcode = fetch.u8()?;
    }
    let wide = if operand_size_16 {
        Width::Word
    } else {
        Width::Long
    };

    let instr = match opcode {
        0x90 => Instruction::Nop,
        0xf4 => Instruction::Hlt,
        0xb0..=0xb7 => Instruction::MovImm {
            dest: Register::Byte(ByteReg::try_from(opcode - 0xb0)?),
            imm: fetch.imm(Width::Byte)?,
        },
        0xb8..=0xbf => {
            let gpr = Gpr::try_from(opcode - 0xb8)?;
            let dest = if operand_size_16 {
                Register::Word(gpr)
            } else {
                Register::Long(gpr)
            };
            Instruction::MovImm {
                dest,
                imm: fetch.imm(wide)?,
            }
        }
        0xeb => {
            let rel = fetch.u8()? as i8 as u32;
            Instruction::Jmp {
                target: fetch.pos.wrapping_add(rel),
            }
        }
        0xe9 => {
            let rel = fetch.imm(Width::Long)?;
            Instruction::Jmp {
                target: fetch.pos.wrapping_add(rel),
            }
        }
        0xcd => Instruction::System(SystemOp::Int {
            vector: fetch.u8()?,
        }),
        0xcf => Instruction::System(SystemOp::Iret),
        0xe4 | 0xe5 | 0xec | 0xed => {
            let port = if opcode & 0x08 == 0 {
                PortSel::Imm(fetch.u8()?)
            } else {
                PortSel::Dx
            };
            let width = if opcode & 1 == 0 { Width::Byte } else { wide };
            Instruction::System(SystemOp::In { port, width })
        }
        0xe6 | 0xe7 | 0xee | 0xef => {
            let port = if opcode & 0x08 == 0 {
                PortSel::Imm(fetch.u8()?)
            } else {
                PortSel::Dx
            };
            let width = if opcode & 1 == 0 { Width::Byte } else { wide };
            Instruction::System(SystemOp::Out { port, width })
        }
        0x0f => {
            let opcode2 = fetch.u8()?;
            match opcode2 {
                0x01 => {
                    let modrm = ModRm::from(fetch.u8()?);
                    if modrm.reg != 3 {
                        return Err(EmuError::Unimplemented {
                            mnemonic: "group 7",
                            eip,
                        });
                    }
                    Instruction::System(SystemOp::Lidt {
                        addr: fetch.effective_address(modrm, "lidt")?,
                    })
                }
                0x20 => {
                    let modrm = ModRm::from(fetch.u8()?);
                    Instruction::System(SystemOp::MovFromCr {
                        cr: modrm.reg,
                        dest: Gpr::try_from(modrm.rm)?,
                    })
                }
                0x22 => {
                    let modrm = ModRm::from(fetch.u8()?);
                    Instruction::System(SystemOp::MovToCr {
                        cr: modrm.reg,
                        src: Gpr::try_from(modrm.rm)?,
                    })
                }
                _ => {
                    return Err(EmuError::InvalidOpcode {
                        opcode: opcode2,
                        eip,
                    })
                }
            }
        }
        _ => return Err(EmuError::InvalidOpcode { opcode, eip }),
    };

    Ok(Decoded {
        instr,
        len: fetch.pos.wrapping_sub(eip),
        operand_size_16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::{
        ram::Ram,
        registers::{Cpu, Machine},
    };

    fn decode_bytes(bytes: &[u8]) -> Result<Decoded, EmuError> {
        let mut m = Machine::new(Cpu::new(0x10), Ram::new(0x100));
        m.ram.load_image(0x10, bytes).unwrap();
        m.set_gpr(Gpr::Ebx, 0x40);
        decode(&m, 0x10)
    }

    #[test]
    fn test_decode_seed_set() {
        assert_eq!(decode_bytes(&[0x90]).unwrap().instr, Instruction::Nop);
        let mov = decode_bytes(&[0xb9, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(
            mov.instr,
            Instruction::MovImm {
                dest: Register::Long(Gpr::Ecx),
                imm: 0x1234_5678
            }
        );
        assert_eq!(mov.len, 5);
        let mov16 = decode_bytes(&[0x66, 0xb8, 0x34, 0x12]).unwrap();
        assert_eq!(
            mov16.instr,
            Instruction::MovImm {
                dest: Register::Word(Gpr::Eax),
                imm: 0x1234
            }
        );
        assert!(mov16.operand_size_16);
        assert_eq!(mov16.len, 4);
        assert_eq!(
            decode_bytes(&[0xb4, 0x7f]).unwrap().instr,
            Instruction::MovImm {
                dest: Register::Byte(ByteReg::Ah),
                imm: 0x7f
            }
        );
        // backwards jump onto itself
        assert_eq!(
            decode_bytes(&[0xeb, 0xfe]).unwrap().instr,
            Instruction::Jmp { target: 0x10 }
        );
    }

    #[test]
    fn test_decode_system() {
        assert_eq!(
            decode_bytes(&[0xcd, 0x80]).unwrap().instr,
            Instruction::System(SystemOp::Int { vector: 0x80 })
        );
        assert_eq!(
            decode_bytes(&[0xcf]).unwrap().instr,
            Instruction::System(SystemOp::Iret)
        );
        assert_eq!(
            decode_bytes(&[0xee]).unwrap().instr,
            Instruction::System(SystemOp::Out {
                port: PortSel::Dx,
                width: Width::Byte
            })
        );
        assert_eq!(
            decode_bytes(&[0x66, 0xe5, 0x60]).unwrap().instr,
            Instruction::System(SystemOp::In {
                port: PortSel::Imm(0x60),
                width: Width::Word
            })
        );
        assert_eq!(
            decode_bytes(&[0x0f, 0x20, 0xc0]).unwrap().instr,
            Instruction::System(SystemOp::MovFromCr {
                cr: 0,
                dest: Gpr::Eax
            })
        );
    }

    #[test]
    fn test_decode_lidt_addressing() {
        let direct = decode_bytes(&[0x0f, 0x01, 0x1d, 0x00, 0x20, 0x00, 0x00]).unwrap();
        assert_eq!(
            direct.instr,
            Instruction::System(SystemOp::Lidt { addr: 0x2000 })
        );
        assert_eq!(direct.len, 7);
        // lidt [ebx+8]
        let based = decode_bytes(&[0x0f, 0x01, 0x5b, 0x08]).unwrap();
        assert_eq!(based.instr, Instruction::System(SystemOp::Lidt { addr: 0x48 }));
        // lidt with a register operand is not a valid form
        assert_eq!(
            decode_bytes(&[0x0f, 0x01, 0xd8]),
            Err(EmuError::Unimplemented {
                mnemonic: "lidt",
                eip: 0x10
            })
        );
    }

    #[test]
    fn test_decode_unknown_opcode() {
        assert_eq!(
            decode_bytes(&[0x01, 0xc0]),
            Err(EmuError::InvalidOpcode {
                opcode: 0x01,
                eip: 0x10
            })
        );
    }
}
