use crate::plat::{Eflags, Gpr, Idtr, Register, Width};

use super::{ram::Ram, EmuError};

/// Access to the guest's architectural state.
///
/// The expression evaluator, the watchpoint engine and the system-instruction handler only
/// ever see the machine through this trait, so tests can substitute a mock backend.
pub trait MachineState {
    fn gpr(&self, reg: Gpr) -> u32;
    fn set_gpr(&mut self, reg: Gpr, value: u32);
    fn eip(&self) -> u32;
    fn set_eip(&mut self, value: u32);
    fn cs(&self) -> u16;
    fn set_cs(&mut self, value: u16);
    fn eflags(&self) -> Eflags;
    fn set_eflags(&mut self, value: Eflags);
    fn idtr(&self) -> Idtr;
    fn set_idtr(&mut self, value: Idtr);

    /// Reads `width` bytes at a guest virtual address.
    fn vaddr_read(&self, addr: u32, width: Width) -> Result<u32, EmuError>;
    /// Writes the low `width` bytes of `value` at a guest virtual address.
    fn vaddr_write(&mut self, addr: u32, width: Width, value: u32) -> Result<(), EmuError>;

    /// Reads a 32-, 16- or 8-bit register view.
    fn reg(&self, reg: Register) -> u32 {
        match reg {
            Register::Long(r) => self.gpr(r),
            Register::Word(r) => self.gpr(r) & 0xffff,
            Register::Byte(r) => {
                let (gpr, shift) = r.location();
                (self.gpr(gpr) >> shift) & 0xff
            }
        }
    }

    /// Writes a register view, leaving the bits outside the view untouched.
    fn set_reg(&mut self, reg: Register, value: u32) {
        match reg {
            Register::Long(r) => self.set_gpr(r, value),
            Register::Word(r) => {
                let old = self.gpr(r);
                self.set_gpr(r, (old & !0xffff) | (value & 0xffff));
            }
            Register::Byte(r) => {
                let (gpr, shift) = r.location();
                let old = self.gpr(gpr);
                self.set_gpr(gpr, (old & !(0xff << shift)) | ((value & 0xff) << shift));
            }
        }
    }

    /// Pushes a 32-bit word onto the guest stack.
    fn push(&mut self, value: u32) -> Result<(), EmuError> {
        let esp = self.gpr(Gpr::Esp).wrapping_sub(4);
        self.vaddr_write(esp, Width::Long, value)?;
        self.set_gpr(Gpr::Esp, esp);
        Ok(())
    }

    /// Pops a 32-bit word off the guest stack.
    fn pop(&mut self) -> Result<u32, EmuError> {
        let esp = self.gpr(Gpr::Esp);
        let value = self.vaddr_read(esp, Width::Long)?;
        self.set_gpr(Gpr::Esp, esp.wrapping_add(4));
        Ok(value)
    }
}

/// Selector loaded into cs at reset.
pub const RESET_CS: u16 = 0x8;

/// The CPU register file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub cs: u16,
    pub eflags: Eflags,
    pub idtr: Idtr,
}

impl Cpu {
    /// Creates a register file in its reset state, about to execute at `entry`.
    pub fn new(entry: u32) -> Self {
        Self {
            gpr: [0; 8],
            eip: entry,
            cs: RESET_CS,
            eflags: Eflags::default(),
            idtr: Idtr::default(),
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(0)
    }
}

/// The full guest machine: registers plus memory.
pub struct Machine {
    pub cpu: Cpu,
    pub ram: Ram,
}

impl Machine {
    pub fn new(cpu: Cpu, ram: Ram) -> Self {
        Self { cpu, ram }
    }
}

impl MachineState for Machine {
    fn gpr(&self, reg: Gpr) -> u32 {
        self.cpu.gpr[reg as usize]
    }

    fn set_gpr(&mut self, reg: Gpr, value: u32) {
        self.cpu.gpr[reg as usize] = value;
    }

    fn eip(&self) -> u32 {
        self.cpu.eip
    }

    fn set_eip(&mut self, value: u32) {
        self.cpu.eip = value;
    }

    fn cs(&self) -> u16 {
        self.cpu.cs
    }

    fn set_cs(&mut self, value: u16) {
        self.cpu.cs = value;
    }

    fn eflags(&self) -> Eflags {
        self.cpu.eflags
    }

    fn set_eflags(&mut self, value: Eflags) {
        self.cpu.eflags = value;
    }

    fn idtr(&self) -> Idtr {
        self.cpu.idtr
    }

    fn set_idtr(&mut self, value: Idtr) {
        self.cpu.idtr = value;
    }

    fn vaddr_read(&self, addr: u32, width: Width) -> Result<u32, EmuError> {
        self.ram.read(addr, width)
    }

    fn vaddr_write(&mut self, addr: u32, width: Width, value: u32) -> Result<(), EmuError> {
        self.ram.write(addr, width, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plat::ByteReg;

    fn machine() -> Machine {
        Machine::new(Cpu::default(), Ram::new(0x100))
    }

    #[test]
    fn test_register_views() {
        let mut m = machine();
        m.set_gpr(Gpr::Eax, 0x1234_5678);
        assert_eq!(m.reg(Register::Word(Gpr::Eax)), 0x5678);
        assert_eq!(m.reg(Register::Byte(ByteReg::Al)), 0x78);
        assert_eq!(m.reg(Register::Byte(ByteReg::Ah)), 0x56);

        m.set_reg(Register::Byte(ByteReg::Ah), 0xab);
        assert_eq!(m.gpr(Gpr::Eax), 0x1234_ab78);
        m.set_reg(Register::Word(Gpr::Eax), 0xffff_0001);
        assert_eq!(m.gpr(Gpr::Eax), 0x1234_0001);
    }

    #[test]
    fn test_push_pop() {
        let mut m = machine();
        m.set_gpr(Gpr::Esp, 0x100);
        m.push(0xdead_beef).unwrap();
        m.push(7).unwrap();
        assert_eq!(m.gpr(Gpr::Esp), 0xf8);
        assert_eq!(m.pop().unwrap(), 7);
        assert_eq!(m.pop().unwrap(), 0xdead_beef);
        assert_eq!(m.gpr(Gpr::Esp), 0x100);
    }

    #[test]
    fn test_push_fault_leaves_esp() {
        let mut m = machine();
        m.set_gpr(Gpr::Esp, 2);
        assert!(m.push(1).is_err());
        assert_eq!(m.gpr(Gpr::Esp), 2);
    }
}
