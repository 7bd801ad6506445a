//! Interrupt delivery through the interrupt descriptor table.

use crate::plat::{Eflags, Gpr, Width};

use super::{registers::MachineState, EmuError};

/// Gate type of a 32-bit interrupt gate. Entering through one clears IF.
const INTERRUPT_GATE: u8 = 0xe;

/// A decoded 8-byte IDT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gate {
    pub offset: u32,
    pub selector: u16,
    pub kind: u8,
    pub present: bool,
}

impl Gate {
    pub fn from_words(lo: u32, hi: u32) -> Self {
        Self {
            offset: (lo & 0xffff) | (hi & 0xffff_0000),
            selector: (lo >> 16) as u16,
            kind: ((hi >> 8) & 0xf) as u8,
            present: hi & (1 << 15) != 0,
        }
    }
}

/// Delivers interrupt `vector`: saves the trap context on the guest stack and transfers
/// control to the gate's handler. `ret_addr` is the eip that `iret` will resume at.
///
/// The trap context is pushed as eflags, cs, eip, so `iret` pops it back in the order
/// eip, cs, eflags.
pub fn raise_intr<M: MachineState + ?Sized>(
    machine: &mut M,
    vector: u8,
    ret_addr: u32,
) -> Result<(), EmuError> {
    let idtr = machine.idtr();
    let offset = u32::from(vector) * 8;
    if offset + 7 > u32::from(idtr.limit) {
        return Err(EmuError::IdtLimit {
            vector,
            limit: idtr.limit,
        });
    }
    let entry = idtr.base.wrapping_add(offset);
    let gate = Gate::from_words(
        machine.vaddr_read(entry, Width::Long)?,
        machine.vaddr_read(entry.wrapping_add(4), Width::Long)?,
    );
    if !gate.present {
        return Err(EmuError::GateNotPresent(vector));
    }

    // both ends of the frame must be mapped before the first push
    let esp = machine.gpr(Gpr::Esp);
    machine.vaddr_read(esp.wrapping_sub(12), Width::Long)?;
    machine.vaddr_read(esp.wrapping_sub(4), Width::Long)?;

    let eflags = machine.eflags();
    let cs = machine.cs();
    machine.push(eflags.bits())?;
    machine.push(u32::from(cs))?;
    machine.push(ret_addr)?;

    let mut flags = eflags;
    flags.remove(Eflags::TF);
    if gate.kind == INTERRUPT_GATE {
        flags.remove(Eflags::IF);
    }
    machine.set_eflags(flags);
    machine.set_cs(gate.selector);
    machine.set_eip(gate.offset);
    log::debug!(
        "interrupt {:#04x}: {:04x}:{:08x} -> {:04x}:{:08x}",
        vector,
        cs,
        ret_addr,
        gate.selector,
        gate.offset
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        emu::{
            ram::Ram,
            registers::{Cpu, Machine},
        },
        plat::{Gpr, Idtr},
    };

    pub(crate) const IDT_BASE: u32 = 0x1000;
    pub(crate) const STACK_TOP: u32 = 0x3000;

    /// Writes an IDT entry for `vector` pointing at `handler`.
    pub(crate) fn set_gate(m: &mut Machine, vector: u8, handler: u32, kind: u8, present: bool) {
        let entry = IDT_BASE + u32::from(vector) * 8;
        let lo = (handler & 0xffff) | (0x0008 << 16);
        let hi = (handler & 0xffff_0000) | (u32::from(present) << 15) | (u32::from(kind) << 8);
        m.ram.write(entry, Width::Long, lo).unwrap();
        m.ram.write(entry + 4, Width::Long, hi).unwrap();
    }

    pub(crate) fn machine() -> Machine {
        let mut m = Machine::new(Cpu::new(0x100), Ram::new(0x4000));
        m.set_gpr(Gpr::Esp, STACK_TOP);
        m.set_idtr(Idtr {
            limit: 0x7ff,
            base: IDT_BASE,
        });
        m
    }

    #[test]
    fn test_gate_decode() {
        let gate = Gate::from_words(0x0008_5678, 0x1234_8e00);
        assert_eq!(
            gate,
            Gate {
                offset: 0x1234_5678,
                selector: 8,
                kind: 0xe,
                present: true,
            }
        );
    }

    #[test]
    fn test_raise_pushes_trap_context() {
        let mut m = machine();
        set_gate(&mut m, 0x80, 0x2000, INTERRUPT_GATE, true);
        m.set_cs(0x1b);
        m.set_eflags(Eflags::RESERVED | Eflags::IF | Eflags::ZF);

        raise_intr(&mut m, 0x80, 0x102).unwrap();

        assert_eq!(m.eip(), 0x2000);
        assert_eq!(m.cs(), 8);
        assert!(!m.eflags().contains(Eflags::IF));
        assert_eq!(m.gpr(Gpr::Esp), STACK_TOP - 12);
        assert_eq!(m.ram.read(STACK_TOP - 12, Width::Long).unwrap(), 0x102);
        assert_eq!(m.ram.read(STACK_TOP - 8, Width::Long).unwrap(), 0x1b);
        assert_eq!(
            m.ram.read(STACK_TOP - 4, Width::Long).unwrap(),
            (Eflags::RESERVED | Eflags::IF | Eflags::ZF).bits()
        );
    }

    #[test]
    fn test_trap_gate_keeps_if() {
        let mut m = machine();
        set_gate(&mut m, 3, 0x2000, 0xf, true);
        m.set_eflags(Eflags::RESERVED | Eflags::IF);
        raise_intr(&mut m, 3, 0x101).unwrap();
        assert!(m.eflags().contains(Eflags::IF));
    }

    #[test]
    fn test_vector_beyond_limit() {
        let mut m = machine();
        m.set_idtr(Idtr {
            limit: 0x7f,
            base: IDT_BASE,
        });
        assert_eq!(
            raise_intr(&mut m, 0x10, 0x101),
            Err(EmuError::IdtLimit {
                vector: 0x10,
                limit: 0x7f
            })
        );
        assert_eq!(m.gpr(Gpr::Esp), STACK_TOP);
    }

    #[test]
    fn test_gate_not_present() {
        let mut m = machine();
        set_gate(&mut m, 0x20, 0x2000, INTERRUPT_GATE, false);
        assert_eq!(
            raise_intr(&mut m, 0x20, 0x101),
            Err(EmuError::GateNotPresent(0x20))
        );
    }
}
