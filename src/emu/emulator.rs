use std::collections::VecDeque;

use crate::plat::Gpr;

use super::{
    decode::{decode, Instruction},
    pio::PortBus,
    registers::{MachineState, Machine},
    system::{self, CrossCheck, Exec, Flow, InstrCtx, SystemOp},
    EmuError,
};

/// Number of executed instructions kept for backtraces.
pub const HISTORY_LEN: usize = 256;

/// The emulator's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmuState {
    /// The guest may execute further instructions.
    Running,
    /// The guest executed `hlt`; eax held this exit code.
    Halted(u32),
    /// A fatal error stopped the guest. The machine state is left as it was when the
    /// failing instruction began, for inspection.
    Aborted,
}

/// The main emulation context: a machine, its I/O space, and the stepping logic.
pub struct Emulator {
    pub machine: Machine,
    pub ports: PortBus,
    pub state: EmuState,
    /// `(eip, instruction)` of the most recently executed instructions, oldest first.
    pub instr_history: VecDeque<(u32, Instruction)>,
    /// Instructions whose effects could not be compared against a reference trace.
    pub cross_check_skips: u64,
}

impl Emulator {
    pub fn new(machine: Machine, ports: PortBus) -> Self {
        Self {
            machine,
            ports,
            state: EmuState::Running,
            instr_history: VecDeque::with_capacity(HISTORY_LEN),
            cross_check_skips: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == EmuState::Running
    }

    /// Executes one instruction.
    ///
    /// # Errors
    ///
    /// Any error is fatal: the emulator moves to [`EmuState::Aborted`] and the error is
    /// returned for reporting. Stepping a halted or aborted emulator does nothing.
    pub fn step_instr(&mut self) -> Result<(), EmuError> {
        if !self.is_running() {
            return Ok(());
        }
        self.exec_once().map_err(|e| {
            log::error!("{}", e);
            self.state = EmuState::Aborted;
            e
        })
    }

    fn exec_once(&mut self) -> Result<(), EmuError> {
        let eip = self.machine.eip();
        let decoded = decode(&self.machine, eip)?;
        let seq_eip = eip.wrapping_add(decoded.len);
        log::debug!(">>> {:08x}: {}", eip, decoded.instr);

        let exec = match decoded.instr {
            Instruction::Nop => Exec {
                flow: Flow::Continue,
                cross_check: CrossCheck::Compare,
            },
            Instruction::Hlt => {
                let code = self.machine.gpr(Gpr::Eax);
                log::info!("guest halted at {:#010x} with code {}", eip, code);
                self.state = EmuState::Halted(code);
                Exec {
                    flow: Flow::Continue,
                    cross_check: CrossCheck::Compare,
                }
            }
            Instruction::MovImm { dest, imm } => {
                self.machine.set_reg(dest, imm);
                Exec {
                    flow: Flow::Continue,
                    cross_check: CrossCheck::Compare,
                }
            }
            Instruction::Jmp { target } => {
                self.machine.set_eip(target);
                Exec {
                    flow: Flow::Redirected,
                    cross_check: CrossCheck::Compare,
                }
            }
            Instruction::System(op) => {
                let ctx = InstrCtx {
                    eip,
                    seq_eip,
                    operand_size_16: decoded.operand_size_16,
                };
                let result = system::execute(op, ctx, &mut self.machine, &mut self.ports);
                // a control register read is never compared, even when it aborts the run
                if result.is_err() && matches!(op, SystemOp::MovFromCr { .. }) {
                    self.cross_check_skips += 1;
                }
                result?
            }
        };

        if exec.flow == Flow::Continue {
            self.machine.set_eip(seq_eip);
        }
        if exec.cross_check != CrossCheck::Compare {
            log::trace!("{:08x}: {:?}", eip, exec.cross_check);
            self.cross_check_skips += 1;
        }
        if self.instr_history.len() == HISTORY_LEN {
            self.instr_history.pop_front();
        }
        self.instr_history.push_back((eip, decoded.instr));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        emu::{pio::tests::Latch, ram::Ram, registers::Cpu},
        plat::{Eflags, Idtr, Width},
    };

    pub(crate) const BASE: u32 = 0x1000;

    /// A small guest: loads an IDT, prints 'A' through port 0x3f8 from an `int 0x80` handler,
    /// then halts with eax = 0x41.
    pub(crate) fn demo_guest() -> Vec<u8> {
        crate::demo::image(BASE)
    }

    pub(crate) fn emulator(image: &[u8]) -> (Emulator, Latch) {
        let mut ram = Ram::new(0x1_0000);
        ram.load_image(BASE, image).unwrap();
        let latch = Latch::default();
        let mut ports = PortBus::new();
        ports.map(0x3f8, Box::new(latch.clone()));
        (Emulator::new(Machine::new(Cpu::new(BASE), ram), ports), latch)
    }

    #[test]
    fn test_run_demo_to_halt() {
        let (mut emu, latch) = emulator(&demo_guest());
        for _ in 0..100 {
            emu.step_instr().unwrap();
            if !emu.is_running() {
                break;
            }
        }
        assert_eq!(emu.state, EmuState::Halted(0x41));
        let out: Vec<u32> = latch.0.borrow().iter().map(|(_, v)| *v).collect();
        assert_eq!(out, vec![0x41, 0x0a]);
        assert!(emu.cross_check_skips >= 3);
        // interrupt entry and exit leave cs and eflags as they were
        assert_eq!(emu.machine.cs(), 0x8);
        assert_eq!(emu.machine.eflags(), Eflags::RESERVED);
        assert!(emu
            .instr_history
            .iter()
            .any(|(_, i)| *i == Instruction::System(SystemOp::Iret)));
    }

    #[test]
    fn test_invalid_opcode_aborts() {
        let (mut emu, _) = emulator(&[0x90, 0x0f, 0x0b]);
        emu.step_instr().unwrap();
        assert_eq!(emu.machine.eip(), BASE + 1);
        assert_eq!(
            emu.step_instr(),
            Err(EmuError::InvalidOpcode {
                opcode: 0x0b,
                eip: BASE + 1
            })
        );
        assert_eq!(emu.state, EmuState::Aborted);
        assert_eq!(emu.machine.eip(), BASE + 1);
        // stepping an aborted guest is a no-op
        assert_eq!(emu.step_instr(), Ok(()));
        assert_eq!(emu.instr_history.len(), 1);
    }

    #[test]
    fn test_control_register_read_aborts() {
        let (mut emu, _) = emulator(&[0x0f, 0x20, 0xd8]);
        assert!(matches!(
            emu.step_instr(),
            Err(EmuError::Unimplemented { .. })
        ));
        assert_eq!(emu.state, EmuState::Aborted);
        assert_eq!(emu.cross_check_skips, 1);

        let (mut emu, _) = emulator(&[0x0f, 0x22, 0xd8]);
        assert!(emu.step_instr().is_err());
        assert_eq!(emu.cross_check_skips, 0);
    }

    #[test]
    fn test_iret_off_stack_top_leaves_machine_untouched() {
        let (mut emu, _) = emulator(&[0xcf]);
        // eflags would sit just past the end of memory
        emu.machine.set_gpr(Gpr::Esp, 0xfff8);
        let before = emu.machine.cpu.clone();
        assert_eq!(
            emu.step_instr(),
            Err(EmuError::MemoryFault {
                addr: 0x1_0000,
                width: Width::Long
            })
        );
        assert_eq!(emu.state, EmuState::Aborted);
        assert_eq!(emu.machine.cpu, before);
    }

    #[test]
    fn test_int_below_stack_bottom_leaves_machine_untouched() {
        let (mut emu, _) = emulator(&[0xcd, 0x00]);
        emu.machine.set_idtr(Idtr {
            limit: 0x7,
            base: 0x2000,
        });
        emu.machine.ram.write(0x2000, Width::Long, 0x0008_3000).unwrap();
        emu.machine.ram.write(0x2004, Width::Long, 0x0000_8e00).unwrap();
        emu.machine.ram.write(0, Width::Long, 0xdead_beef).unwrap();
        emu.machine.set_gpr(Gpr::Esp, 4);
        let before = emu.machine.cpu.clone();
        assert!(matches!(
            emu.step_instr(),
            Err(EmuError::MemoryFault { .. })
        ));
        assert_eq!(emu.state, EmuState::Aborted);
        assert_eq!(emu.machine.cpu, before);
        assert_eq!(emu.machine.ram.read(0, Width::Long).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_jmp_and_history_bound() {
        // jmp . forever
        let (mut emu, _) = emulator(&[0xeb, 0xfe]);
        for _ in 0..HISTORY_LEN + 10 {
            emu.step_instr().unwrap();
        }
        assert_eq!(emu.machine.eip(), BASE);
        assert_eq!(emu.instr_history.len(), HISTORY_LEN);
        assert_eq!(emu.machine.ram.read(BASE, Width::Word).unwrap(), 0xfeeb);
    }
}
