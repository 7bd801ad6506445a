//! System instructions: the ones that change privileged machine state or leave the CPU
//! through the I/O space.

use std::fmt;

use crate::plat::{Eflags, Gpr, Idtr, Register, Width};

use super::{intr::raise_intr, pio::PortIo, registers::MachineState, EmuError};

/// Where an `in`/`out` instruction takes its port number from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSel {
    Imm(u8),
    Dx,
}

/// The system instructions understood by [`execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemOp {
    /// `lidt m`, with the operand's effective address.
    Lidt { addr: u32 },
    MovToCr { cr: u8, src: Gpr },
    MovFromCr { cr: u8, dest: Gpr },
    /// `int $imm8`
    Int { vector: u8 },
    Iret,
    /// `in port, %al/%ax/%eax`
    In { port: PortSel, width: Width },
    /// `out %al/%ax/%eax, port`
    Out { port: PortSel, width: Width },
}

impl fmt::Display for PortSel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSel::Imm(port) => write!(f, "${:#x}", port),
            PortSel::Dx => write!(f, "(%dx)"),
        }
    }
}

impl fmt::Display for SystemOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemOp::Lidt { addr } => write!(f, "lidt {:#x}", addr),
            SystemOp::MovToCr { cr, src } => write!(f, "movl {},%cr{}", Register::Long(*src), cr),
            SystemOp::MovFromCr { cr, dest } => {
                write!(f, "movl %cr{},{}", cr, Register::Long(*dest))
            }
            SystemOp::Int { vector } => write!(f, "int ${:#x}", vector),
            SystemOp::Iret => write!(f, "iret"),
            SystemOp::In { port, width } => {
                write!(f, "in {},{}", port, Register::accumulator(*width))
            }
            SystemOp::Out { port, width } => {
                write!(f, "out {},{}", Register::accumulator(*width), port)
            }
        }
    }
}

/// Per-instruction decoding state the handlers depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrCtx {
    /// Address of the instruction itself.
    pub eip: u32,
    /// Address of the sequentially next instruction.
    pub seq_eip: u32,
    pub operand_size_16: bool,
}

/// How execution proceeds after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Fall through to the sequentially next instruction.
    Continue,
    /// The handler already set eip; the stepper must not advance it.
    Redirected,
}

/// Whether the instruction's effects can be compared against a reference trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossCheck {
    Compare,
    /// The reference cannot model this instruction; it must adopt our state instead.
    SkipReference,
    /// Our state differs from the reference by construction; adopt the reference's state.
    SkipEmulator,
}

/// The outcome of a successfully executed system instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exec {
    pub flow: Flow,
    pub cross_check: CrossCheck,
}

impl Exec {
    const CONTINUE: Exec = Exec {
        flow: Flow::Continue,
        cross_check: CrossCheck::Compare,
    };
}

/// Executes a system instruction against `machine` and `ports`.
///
/// # Errors
///
/// Every error is fatal to the guest run: faults while touching guest memory or the stack,
/// interrupt delivery failures, and the control-register moves, which are recognized but
/// not modelled.
pub fn execute<M, P>(
    op: SystemOp,
    ctx: InstrCtx,
    machine: &mut M,
    ports: &mut P,
) -> Result<Exec, EmuError>
where
    M: MachineState + ?Sized,
    P: PortIo + ?Sized,
{
    match op {
        SystemOp::Lidt { addr } => {
            let limit = machine.vaddr_read(addr, Width::Word)? as u16;
            let mut base = machine.vaddr_read(addr.wrapping_add(2), Width::Long)?;
            if ctx.operand_size_16 {
                base &= 0x00ff_ffff;
            }
            machine.set_idtr(Idtr { limit, base });
            log::debug!("idtr <- base={:#010x} limit={:#06x}", base, limit);
            Ok(Exec::CONTINUE)
        }
        SystemOp::MovToCr { .. } => Err(EmuError::Unimplemented {
            mnemonic: "mov to control register",
            eip: ctx.eip,
        }),
        SystemOp::MovFromCr { .. } => {
            log::debug!("{}: excluded from reference comparison", op);
            Err(EmuError::Unimplemented {
                mnemonic: "mov from control register",
                eip: ctx.eip,
            })
        }
        SystemOp::Int { vector } => {
            raise_intr(machine, vector, ctx.seq_eip)?;
            Ok(Exec {
                flow: Flow::Redirected,
                cross_check: CrossCheck::SkipEmulator,
            })
        }
        SystemOp::Iret => {
            // all three words are read before esp moves
            let esp = machine.gpr(Gpr::Esp);
            let eip = machine.vaddr_read(esp, Width::Long)?;
            let cs = machine.vaddr_read(esp.wrapping_add(4), Width::Long)?;
            let eflags = machine.vaddr_read(esp.wrapping_add(8), Width::Long)?;
            machine.set_gpr(Gpr::Esp, esp.wrapping_add(12));
            machine.set_eip(eip);
            machine.set_cs(cs as u16);
            machine.set_eflags(Eflags::from_bits_retain(eflags));
            Ok(Exec {
                flow: Flow::Redirected,
                cross_check: CrossCheck::Compare,
            })
        }
        SystemOp::In { port, width } => {
            let port = port_number(machine, port);
            let value = ports.pio_read(port, width);
            machine.set_reg(Register::accumulator(width), value);
            Ok(Exec {
                flow: Flow::Continue,
                cross_check: CrossCheck::SkipReference,
            })
        }
        SystemOp::Out { port, width } => {
            let port = port_number(machine, port);
            let value = machine.reg(Register::accumulator(width));
            ports.pio_write(port, width, value);
            Ok(Exec {
                flow: Flow::Continue,
                cross_check: CrossCheck::SkipReference,
            })
        }
    }
}

fn port_number<M: MachineState + ?Sized>(machine: &M, port: PortSel) -> u16 {
    match port {
        PortSel::Imm(port) => u16::from(port),
        PortSel::Dx => machine.reg(Register::Word(Gpr::Edx)) as u16,
    }
}
