use anyhow::{anyhow, bail, Context, Result};
use rustyline::{error::ReadlineError, DefaultEditor};

use crate::{
    expr::Evaluator,
    plat::{ByteReg, Gpr, Register, Width},
};

use super::{
    emulator::{EmuState, Emulator},
    registers::MachineState,
    watchpoint::{WatchError, WatchHit, WatchId, WatchInfo, WatchPool},
};

/// Why [`Debugger::exec`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The requested number of instructions ran.
    Done,
    /// A watchpoint changed value.
    Watch(WatchHit),
    /// The guest halted or aborted.
    Ended(EmuState),
}

/// What the REPL loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandStatus {
    Done,
    Quit,
}

type Handler = fn(&mut Debugger, Option<&str>) -> Result<CommandStatus>;

const COMMANDS: &[(&str, &str, Handler)] = &[
    ("help", "Display information about all supported commands", Debugger::cmd_help),
    ("c", "Continue the execution of the program", Debugger::cmd_c),
    ("q", "Exit the monitor", Debugger::cmd_q),
    ("si", "Single-step execution [N instructions] (default N=1)", Debugger::cmd_si),
    ("info", "Print program state: `info r` registers, `info w` watchpoints", Debugger::cmd_info),
    ("p", "Evaluate an expression", Debugger::cmd_p),
    ("x", "Examine memory: `x N EXPR` prints N words starting at EXPR", Debugger::cmd_x),
    ("w", "Set a watchpoint on an expression", Debugger::cmd_w),
    ("d", "Delete a watchpoint", Debugger::cmd_d),
    ("bt", "Print the last N instructions executed (default 10)", Debugger::cmd_bt),
];

/// A monitor session: the emulator plus the evaluator and watchpoints that observe it.
pub struct Debugger {
    pub emu: Emulator,
    pub evaluator: Evaluator,
    pub watches: WatchPool,
}

impl Debugger {
    pub fn new(emu: Emulator, watches: WatchPool) -> Self {
        Self {
            emu,
            evaluator: Evaluator::new(),
            watches,
        }
    }

    pub fn evaluate(&mut self, expr: &str) -> Result<i32> {
        Ok(self.evaluator.evaluate(expr, &self.emu.machine)?)
    }

    pub fn set_watch(&mut self, expr: &str) -> Result<WatchId, WatchError> {
        self.watches
            .set(expr, &mut self.evaluator, &self.emu.machine)
    }

    pub fn delete_watch(&mut self, id: WatchId) -> bool {
        self.watches.delete(id)
    }

    pub fn list_watches(&self) -> Vec<WatchInfo> {
        self.watches.list()
    }

    pub fn check_watches(&mut self) -> Result<Option<WatchHit>, WatchError> {
        self.watches.check(&mut self.evaluator, &self.emu.machine)
    }

    /// Executes up to `n` instructions, checking the watchpoints after each one.
    ///
    /// # Errors
    ///
    /// Returns the fatal emulator error that aborted the guest, or a watchpoint that could
    /// no longer be evaluated.
    pub fn exec(&mut self, n: u64) -> Result<StopReason> {
        for _ in 0..n {
            if !self.emu.is_running() {
                return Ok(StopReason::Ended(self.emu.state));
            }
            self.emu.step_instr()?;
            if let Some(hit) = self.check_watches()? {
                return Ok(StopReason::Watch(hit));
            }
        }
        if self.emu.is_running() {
            Ok(StopReason::Done)
        } else {
            Ok(StopReason::Ended(self.emu.state))
        }
    }

    /// Runs the guest to completion without the REPL.
    pub fn run_batch(&mut self) -> Result<EmuState> {
        loop {
            match self.exec(u64::MAX)? {
                StopReason::Ended(state) => return Ok(state),
                StopReason::Watch(hit) => report_hit(&hit),
                StopReason::Done => {}
            }
        }
    }

    pub fn repl(&mut self) -> Result<()> {
        let mut rl = DefaultEditor::new()?;
        eprintln!("Welcome to the x86 monitor! Type `help` for commands.");
        loop {
            let line = match rl.readline("(mon) ") {
                Ok(line) => line,
                Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            rl.add_history_entry(line)?;
            match self.dispatch(line) {
                Ok(CommandStatus::Quit) => break,
                Ok(CommandStatus::Done) => {}
                Err(e) => eprintln!("error: {:#}", e),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, line: &str) -> Result<CommandStatus> {
        let (cmd, args) = match line.split_once(char::is_whitespace) {
            Some((cmd, args)) => (cmd, Some(args.trim()).filter(|a| !a.is_empty())),
            None => (line, None),
        };
        let (_, _, handler) = COMMANDS
            .iter()
            .find(|(name, _, _)| *name == cmd)
            .ok_or_else(|| anyhow!("unknown command '{}'", cmd))?;
        handler(self, args)
    }

    fn resume(&mut self, n: u64) -> Result<CommandStatus> {
        if !self.emu.is_running() {
            eprintln!(
                "The guest has ended ({:?}); restart the monitor to run it again.",
                self.emu.state
            );
            return Ok(CommandStatus::Done);
        }
        match self.exec(n)? {
            StopReason::Done => {}
            StopReason::Watch(hit) => report_hit(&hit),
            StopReason::Ended(EmuState::Halted(code)) => {
                eprintln!("guest halted with code {}", code)
            }
            StopReason::Ended(state) => eprintln!("guest stopped: {:?}", state),
        }
        if let Some((eip, instr)) = self.emu.instr_history.back() {
            eprintln!("[eip={:08x}] --> {}", eip, instr);
        }
        Ok(CommandStatus::Done)
    }

    fn cmd_help(&mut self, args: Option<&str>) -> Result<CommandStatus> {
        match args {
            None => {
                for (name, desc, _) in COMMANDS {
                    println!("{} - {}", name, desc);
                }
            }
            Some(arg) => {
                let (name, desc, _) = COMMANDS
                    .iter()
                    .find(|(name, _, _)| *name == arg)
                    .ok_or_else(|| anyhow!("unknown command '{}'", arg))?;
                println!("{} - {}", name, desc);
            }
        }
        Ok(CommandStatus::Done)
    }

    fn cmd_c(&mut self, _args: Option<&str>) -> Result<CommandStatus> {
        self.resume(u64::MAX)
    }

    fn cmd_q(&mut self, _args: Option<&str>) -> Result<CommandStatus> {
        Ok(CommandStatus::Quit)
    }

    fn cmd_si(&mut self, args: Option<&str>) -> Result<CommandStatus> {
        let n = match args {
            None => 1,
            Some(arg) => arg
                .parse::<u64>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| anyhow!("the number of steps must be greater than 0"))?,
        };
        self.resume(n)
    }

    fn cmd_info(&mut self, args: Option<&str>) -> Result<CommandStatus> {
        match args {
            Some("r") => self.print_registers(),
            Some("w") => self.print_watches(),
            _ => bail!("usage: info r | info w"),
        }
        Ok(CommandStatus::Done)
    }

    fn cmd_p(&mut self, args: Option<&str>) -> Result<CommandStatus> {
        let expr = args.ok_or_else(|| anyhow!("usage: p EXPR"))?;
        let value = self.evaluate(expr)?;
        println!("{} ({:#x})", value, value as u32);
        Ok(CommandStatus::Done)
    }

    fn cmd_x(&mut self, args: Option<&str>) -> Result<CommandStatus> {
        let (count, expr) = args
            .and_then(|a| a.split_once(char::is_whitespace))
            .ok_or_else(|| anyhow!("usage: x N EXPR"))?;
        let count: u32 = count.parse().context("N must be a number")?;
        let mut addr = self.evaluate(expr)? as u32;
        for _ in 0..count {
            let word = self.emu.machine.vaddr_read(addr, Width::Long)?;
            println!("{:#010x}: {:#010x}", addr, word);
            addr = addr.wrapping_add(4);
        }
        Ok(CommandStatus::Done)
    }

    fn cmd_w(&mut self, args: Option<&str>) -> Result<CommandStatus> {
        let expr = args.ok_or_else(|| anyhow!("usage: w EXPR"))?;
        let id = self.set_watch(expr)?;
        let value = self
            .watches
            .list()
            .into_iter()
            .find(|w| w.id == id)
            .map(|w| w.value)
            .unwrap_or_default();
        println!("watchpoint {}: {} (value = {})", id, expr, value);
        Ok(CommandStatus::Done)
    }

    fn cmd_d(&mut self, args: Option<&str>) -> Result<CommandStatus> {
        let id: WatchId = args
            .ok_or_else(|| anyhow!("usage: d N"))?
            .parse()
            .context("N must be a watchpoint number")?;
        if self.delete_watch(id) {
            println!("deleted watchpoint {}", id);
        } else {
            bail!("no watchpoint {}", id);
        }
        Ok(CommandStatus::Done)
    }

    fn cmd_bt(&mut self, args: Option<&str>) -> Result<CommandStatus> {
        let n: usize = args.map(str::parse::<usize>).transpose()?.unwrap_or(10);
        let history = &self.emu.instr_history;
        for (eip, instr) in history.iter().skip(history.len().saturating_sub(n)) {
            println!("{:08x}: {}", eip, instr);
        }
        Ok(CommandStatus::Done)
    }

    fn print_registers(&self) {
        let m = &self.emu.machine;
        for gpr in Gpr::ALL {
            let reg = Register::Long(gpr);
            println!("{:<6}{:#010x}", reg.name(), m.reg(reg));
        }
        println!("{:<6}{:#010x}", "eip", m.eip());
        for gpr in Gpr::ALL {
            let reg = Register::Word(gpr);
            println!("{:<6}{:#06x}", reg.name(), m.reg(reg));
        }
        for byte in ByteReg::ALL {
            let reg = Register::Byte(byte);
            println!("{:<6}{:#04x}", reg.name(), m.reg(reg));
        }
        println!("{:<6}{:#06x}", "cs", m.cs());
        println!("{:<6}{:#010x} {:?}", "eflags", m.eflags().bits(), m.eflags());
        let idtr = m.idtr();
        println!("{:<6}base={:#010x} limit={:#06x}", "idtr", idtr.base, idtr.limit);
    }

    fn print_watches(&self) {
        let watches = self.list_watches();
        if watches.is_empty() {
            println!("No watchpoints.");
            return;
        }
        println!("{:<6}{:<24}{:<8}value", "Num", "expr", "hits");
        for w in watches {
            println!("{:<6}{:<24}{:<8}{}", w.id, w.expr, w.hits, w.value);
        }
    }
}

fn report_hit(hit: &WatchHit) {
    println!("Hardware watchpoint {}: {}", hit.id, hit.expr);
    println!("Old value = {}", hit.old);
    println!("New value = {}", hit.new);
}
