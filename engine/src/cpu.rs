//! The fetch/execute loop over the tiny instruction language. Every value the CPU needs comes from
//! an asynchronous MMU read; the CPU itself never touches memory directly. An instruction that
//! depends on one or more reads parks in [`Pending::Resolve`] until the replies land on the
//! process's private mailbox channel, resuming exactly where it left off even if the process is
//! rotated off RUNNING in the meantime.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cmd;
use crate::error::CpuFault;
use crate::instruction::{self, CompareOp, Instruction};
use crate::mailbox::{Mailbox, Message, Recipient};
use crate::observable_log::ObservableLog;
use crate::pcb::Pid;

struct Meta {
    code_length: usize,
    pc: usize,
    /// File stem of the program's source path, used to name its output file (§6).
    basename: String,
}

enum Pending {
    Fetch,
    Resolve { need: VecDeque<(String, usize)>, resolved: Vec<String>, then: Then },
}

enum Then {
    Out,
    Inc(usize),
    Dec(usize),
    SetTo(usize),
    MathTo { addr: usize, expr: String },
    JumpIf { op: CompareOp, label: String, lhs_is_var: bool, lhs_token: String, rhs_is_var: bool, rhs_token: String },
}

pub struct Cpu {
    instruction_text: HashMap<Pid, HashMap<usize, String>>,
    var_addr: HashMap<Pid, HashMap<String, usize>>,
    labels: HashMap<Pid, HashMap<String, usize>>,
    pending: HashMap<Pid, Pending>,
    outputs: HashMap<Pid, BufWriter<File>>,
    meta: HashMap<Pid, Meta>,
    active: Option<Pid>,
    output_dir: PathBuf,
    trace_log: Arc<ObservableLog>,
    general_output_log: Arc<ObservableLog>,
}

impl Cpu {
    pub fn new(output_dir: PathBuf, trace_log: Arc<ObservableLog>, general_output_log: Arc<ObservableLog>) -> Self {
        Cpu {
            instruction_text: HashMap::new(),
            var_addr: HashMap::new(),
            labels: HashMap::new(),
            pending: HashMap::new(),
            outputs: HashMap::new(),
            meta: HashMap::new(),
            active: None,
            output_dir,
            trace_log,
            general_output_log,
        }
    }

    pub fn active_pid(&self) -> Option<Pid> { self.active }

    fn drop_pid(&mut self, pid: Pid) {
        self.instruction_text.remove(&pid);
        self.var_addr.remove(&pid);
        self.labels.remove(&pid);
        self.pending.remove(&pid);
        self.meta.remove(&pid);
        if let Some(mut w) = self.outputs.remove(&pid) {
            let _ = w.flush();
        }
        if self.active == Some(pid) {
            self.active = None;
        }
    }

    fn request_read(&self, mailbox: &Mailbox, pid: Pid, address: usize) {
        mailbox.put(Recipient::Cpu, Recipient::Scheduler, cmd!["block", pid]);
        mailbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["read", pid, address, true]);
    }

    fn fault(&mut self, mailbox: &Mailbox, pid: Pid, err: CpuFault) {
        log::error!(target: "cpu", "[CPU/ERROR] pid {pid}: {err}");
        self.general_output_log.push(format!("[{pid}] ERROR: {err}"));
        mailbox.put(Recipient::Cpu, Recipient::External, cmd!["error", pid, err.to_string()]);
        mailbox.put(Recipient::Cpu, Recipient::Scheduler, cmd!["drop", pid]);
        self.drop_pid(pid);
    }

    /// Best-effort fallback for a label the scheduler never sent (or sent before the program
    /// contained it): scan whatever lines this pid has already had fetched. Can't see forward
    /// references that haven't executed yet; that's the cost of not doing a full async rescan.
    fn fallback_find_label(&self, pid: Pid, name: &str) -> Option<usize> {
        let lines = self.instruction_text.get(&pid)?;
        lines.iter().find_map(|(&addr, text)| {
            let (head, _) = text.split_once(':')?;
            (head == name).then_some(addr)
        })
    }

    fn resolve_label(&self, pid: Pid, name: &str) -> Option<usize> {
        self.labels.get(&pid).and_then(|m| m.get(name)).copied().or_else(|| self.fallback_find_label(pid, name))
    }

    /// Claims `<basename>.txt`, or `<basename>(n).txt` for the first `n` not already taken, so two
    /// processes admitted from the same source never clobber each other's output file.
    fn claim_output_path(&self, basename: &str) -> std::io::Result<File> {
        fs::create_dir_all(&self.output_dir)?;
        let mut n: u32 = 1;
        loop {
            let filename = if n == 1 { format!("{basename}.txt") } else { format!("{basename}({n}).txt") };
            match OpenOptions::new().write(true).create_new(true).open(self.output_dir.join(filename)) {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn output_writer(&mut self, pid: Pid) -> std::io::Result<&mut BufWriter<File>> {
        if !self.outputs.contains_key(&pid) {
            let basename = self.meta.get(&pid).map(|m| m.basename.clone()).unwrap_or_else(|| pid.to_string());
            let file = self.claim_output_path(&basename)?;
            self.outputs.insert(pid, BufWriter::new(file));
        }
        Ok(self.outputs.get_mut(&pid).unwrap())
    }

    fn set_pc(&mut self, mailbox: &Mailbox, pid: Pid, pc: usize) {
        if let Some(meta) = self.meta.get_mut(&pid) {
            meta.pc = pc;
        }
        mailbox.put(Recipient::Cpu, Recipient::Scheduler, cmd!["setPc", pid, pc]);
    }

    fn fetch_or_execute(&mut self, mailbox: &Mailbox, pid: Pid) {
        let Some(pc) = self.meta.get(&pid).map(|m| m.pc) else { return };
        if let Some(line) = self.instruction_text.get(&pid).and_then(|m| m.get(&pc)).cloned() {
            self.decode_and_execute(mailbox, pid, &line);
        } else {
            self.request_read(mailbox, pid, pc);
            self.pending.insert(pid, Pending::Fetch);
        }
    }

    fn decode_and_execute(&mut self, mailbox: &Mailbox, pid: Pid, line: &str) {
        let pc = self.meta.get(&pid).map(|m| m.pc).unwrap_or(0);
        self.trace_log.push(format!("{pid}@{pc}: {line}"));
        let instruction = match instruction::parse(line) {
            Ok(i) => i,
            Err(e) => return self.fault(mailbox, pid, e),
        };
        match instruction {
            Instruction::Null => self.advance_pc(mailbox, pid),
            Instruction::Exit => {
                mailbox.put(Recipient::Cpu, Recipient::Scheduler, cmd!["drop", pid]);
                self.drop_pid(pid);
            }
            Instruction::Alloc(n) => {
                mailbox.put(Recipient::Cpu, Recipient::Scheduler, cmd!["block", pid]);
                mailbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["allocate", pid, n, false]);
                self.advance_pc(mailbox, pid);
            }
            Instruction::Free(n) => {
                mailbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["free", pid, n]);
                self.advance_pc(mailbox, pid);
            }
            Instruction::Var { name, addr, value } => {
                let Some(code_length) = self.meta.get(&pid).map(|m| m.code_length) else { return };
                let real = addr + code_length;
                self.var_addr.entry(pid).or_default().insert(name, real);
                if let Some(value) = value {
                    mailbox.put(Recipient::Cpu, Recipient::Scheduler, cmd!["block", pid]);
                    mailbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["write", pid, real, value, true]);
                }
                self.advance_pc(mailbox, pid);
            }
            Instruction::Jump(label) => match self.resolve_label(pid, &label) {
                Some(target) => self.set_pc(mailbox, pid, target),
                None => self.fault(mailbox, pid, CpuFault::UndefinedLabel(label)),
            },
            Instruction::Set { lhs, rhs } => {
                let Some(&addr) = self.var_addr.get(&pid).and_then(|m| m.get(&lhs)) else {
                    return self.fault(mailbox, pid, CpuFault::UndefinedVariable(lhs));
                };
                if rhs.parse::<f64>().is_ok() {
                    mailbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["write", pid, addr, rhs, false]);
                    self.advance_pc(mailbox, pid);
                } else {
                    match self.var_addr.get(&pid).and_then(|m| m.get(&rhs)).copied() {
                        Some(rhs_addr) => self.begin_resolve(mailbox, pid, vec![(rhs, rhs_addr)], Then::SetTo(addr)),
                        None => self.fault(mailbox, pid, CpuFault::UndefinedVariable(rhs)),
                    }
                }
            }
            Instruction::Out(name) => match self.var_addr.get(&pid).and_then(|m| m.get(&name)).copied() {
                Some(addr) => self.begin_resolve(mailbox, pid, vec![(name, addr)], Then::Out),
                None => self.fault(mailbox, pid, CpuFault::UndefinedVariable(name)),
            },
            Instruction::Inc(name) => match self.var_addr.get(&pid).and_then(|m| m.get(&name)).copied() {
                Some(addr) => self.begin_resolve(mailbox, pid, vec![(name, addr)], Then::Inc(addr)),
                None => self.fault(mailbox, pid, CpuFault::UndefinedVariable(name)),
            },
            Instruction::Dec(name) => match self.var_addr.get(&pid).and_then(|m| m.get(&name)).copied() {
                Some(addr) => self.begin_resolve(mailbox, pid, vec![(name, addr)], Then::Dec(addr)),
                None => self.fault(mailbox, pid, CpuFault::UndefinedVariable(name)),
            },
            Instruction::Math { target, expr } => {
                let Some(&target_addr) = self.var_addr.get(&pid).and_then(|m| m.get(&target)) else {
                    return self.fault(mailbox, pid, CpuFault::UndefinedVariable(target));
                };
                let mut need = Vec::new();
                let mut ok = true;
                for name in instruction::operand_names(&expr) {
                    match self.var_addr.get(&pid).and_then(|m| m.get(&name)).copied() {
                        Some(addr) => need.push((name, addr)),
                        None => {
                            self.fault(mailbox, pid, CpuFault::UndefinedVariable(name));
                            ok = false;
                            break;
                        }
                    }
                }
                if ok {
                    self.begin_resolve(mailbox, pid, need, Then::MathTo { addr: target_addr, expr });
                }
            }
            Instruction::JumpIf { lhs, op, rhs, label } => {
                let mut need = Vec::new();
                let lhs_is_var = lhs.parse::<f64>().is_err();
                let rhs_is_var = rhs.parse::<f64>().is_err();
                if lhs_is_var {
                    match self.var_addr.get(&pid).and_then(|m| m.get(&lhs)).copied() {
                        Some(addr) => need.push((lhs.clone(), addr)),
                        None => return self.fault(mailbox, pid, CpuFault::UndefinedVariable(lhs)),
                    }
                }
                if rhs_is_var {
                    match self.var_addr.get(&pid).and_then(|m| m.get(&rhs)).copied() {
                        Some(addr) => need.push((rhs.clone(), addr)),
                        None => return self.fault(mailbox, pid, CpuFault::UndefinedVariable(rhs)),
                    }
                }
                self.begin_resolve(
                    mailbox,
                    pid,
                    need,
                    Then::JumpIf { op, label, lhs_is_var, lhs_token: lhs, rhs_is_var, rhs_token: rhs },
                );
            }
        }
    }

    fn begin_resolve(&mut self, mailbox: &Mailbox, pid: Pid, need: Vec<(String, usize)>, then: Then) {
        let need: VecDeque<(String, usize)> = need.into();
        match need.front() {
            Some(&(_, addr)) => {
                self.request_read(mailbox, pid, addr);
                self.pending.insert(pid, Pending::Resolve { need, resolved: Vec::new(), then });
            }
            None => self.finish(mailbox, pid, then, Vec::new()),
        }
    }

    fn advance_pc(&mut self, mailbox: &Mailbox, pid: Pid) {
        if let Some(pc) = self.meta.get(&pid).map(|m| m.pc) {
            self.set_pc(mailbox, pid, pc + 1);
        }
    }

    fn finish(&mut self, mailbox: &Mailbox, pid: Pid, then: Then, resolved: Vec<String>) {
        match then {
            Then::Out => {
                let value = resolved.into_iter().next().unwrap_or_default();
                self.general_output_log.push(format!("[{pid}] {value}"));
                if let Ok(writer) = self.output_writer(pid) {
                    let _ = writeln!(writer, "{value}");
                    let _ = writer.flush();
                }
                self.advance_pc(mailbox, pid);
            }
            Then::Inc(addr) => {
                let current: f64 = resolved.first().and_then(|v| v.parse().ok()).unwrap_or(0.0);
                let formatted = instruction::format_double(current + 1.0);
                mailbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["write", pid, addr, formatted, false]);
                self.advance_pc(mailbox, pid);
            }
            Then::Dec(addr) => {
                let current: f64 = resolved.first().and_then(|v| v.parse().ok()).unwrap_or(0.0);
                let formatted = instruction::format_double(current - 1.0);
                mailbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["write", pid, addr, formatted, false]);
                self.advance_pc(mailbox, pid);
            }
            Then::SetTo(addr) => {
                let value = resolved.into_iter().next().unwrap_or_default();
                mailbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["write", pid, addr, value, false]);
                self.advance_pc(mailbox, pid);
            }
            Then::MathTo { addr, expr } => match instruction::evaluate(&expr, &resolved) {
                Ok(value) => {
                    let formatted = instruction::format_double(value);
                    mailbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["write", pid, addr, formatted, false]);
                    self.advance_pc(mailbox, pid);
                }
                Err(e) => self.fault(mailbox, pid, e),
            },
            Then::JumpIf { op, label, lhs_is_var, lhs_token, rhs_is_var, rhs_token } => {
                let mut it = resolved.into_iter();
                let lhs = if lhs_is_var { it.next().unwrap_or_default() } else { lhs_token };
                let rhs = if rhs_is_var { it.next().unwrap_or_default() } else { rhs_token };
                if op.evaluate(&lhs, &rhs) {
                    match self.resolve_label(pid, &label) {
                        Some(target) => self.set_pc(mailbox, pid, target),
                        None => return self.fault(mailbox, pid, CpuFault::UndefinedLabel(label)),
                    }
                } else {
                    self.advance_pc(mailbox, pid);
                }
            }
        }
    }

    fn advance_pending(&mut self, mailbox: &Mailbox, pid: Pid) {
        let Some(pending) = self.pending.remove(&pid) else { return };
        match pending {
            Pending::Fetch => match mailbox.get(Recipient::Process(pid)) {
                Some(reply) if reply.verb() == "data" => {
                    let line = reply.arg(1).unwrap_or("").to_string();
                    let pc = self.meta.get(&pid).map(|m| m.pc).unwrap_or(0);
                    self.instruction_text.entry(pid).or_default().insert(pc, line.clone());
                    self.decode_and_execute(mailbox, pid, &line);
                }
                _ => {
                    self.pending.insert(pid, Pending::Fetch);
                }
            },
            Pending::Resolve { mut need, mut resolved, then } => match mailbox.get(Recipient::Process(pid)) {
                Some(reply) if reply.verb() == "data" => {
                    resolved.push(reply.arg(1).unwrap_or("").to_string());
                    need.pop_front();
                    match need.front() {
                        Some(&(_, addr)) => {
                            self.request_read(mailbox, pid, addr);
                            self.pending.insert(pid, Pending::Resolve { need, resolved, then });
                        }
                        None => self.finish(mailbox, pid, then, resolved),
                    }
                }
                _ => {
                    self.pending.insert(pid, Pending::Resolve { need, resolved, then });
                }
            },
        }
    }

    pub fn tick(&mut self, mailbox: &Mailbox) {
        while let Some(message) = mailbox.get(Recipient::Cpu) {
            match message.verb() {
                "running" => {
                    if message.arg(1) == Some("none") {
                        self.active = None;
                    } else if let (Some(pid), Some(pc), Some(code_length), Some(code_path)) = (
                        message.arg(1).and_then(|s| s.parse::<Pid>().ok()),
                        message.arg(2).and_then(|s| s.parse::<usize>().ok()),
                        message.arg(3).and_then(|s| s.parse::<usize>().ok()),
                        message.arg(4),
                    ) {
                        let basename = Path::new(code_path)
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| pid.to_string());
                        self.meta.insert(pid, Meta { code_length, pc, basename });
                        self.active = Some(pid);
                    }
                }
                "labels" => {
                    if let Some(pid) = message.arg(1).and_then(|s| s.parse::<Pid>().ok()) {
                        let mut map = HashMap::new();
                        for token in &message.tokens()[2..] {
                            if let Some((name, idx)) = token.split_once('=') {
                                if let Ok(idx) = idx.parse() {
                                    map.insert(name.to_string(), idx);
                                }
                            }
                        }
                        self.labels.insert(pid, map);
                    }
                }
                "drop" => {
                    if let Some(pid) = message.arg(1).and_then(|s| s.parse::<Pid>().ok()) {
                        self.drop_pid(pid);
                    }
                }
                _ => {}
            }
        }

        for pid in self.pending.keys().copied().collect::<Vec<_>>() {
            self.advance_pending(mailbox, pid);
        }
        if let Some(pid) = self.active {
            if !self.pending.contains_key(&pid) {
                self.fetch_or_execute(mailbox, pid);
            }
        }

        // Query who is running for next tick, after this tick's own work has been queued.
        mailbox.put(Recipient::Cpu, Recipient::Scheduler, vec!["getRunning".to_string()]);
    }
}

pub fn run(mut cpu: Cpu, mailbox: Arc<Mailbox>, tick_rate_hz: u32, shutdown: Arc<AtomicBool>) {
    let period = Duration::from_secs_f64(1.0 / tick_rate_hz as f64);
    while !shutdown.load(Ordering::Relaxed) {
        cpu.tick(&mailbox);
        std::thread::sleep(period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cpu(output_dir: PathBuf) -> Cpu {
        Cpu::new(output_dir, Arc::new(ObservableLog::new()), Arc::new(ObservableLog::new()))
    }

    fn push_running(mailbox: &Mailbox, pid: Pid, pc: usize, code_length: usize) {
        mailbox.put(Recipient::Scheduler, Recipient::Cpu, cmd!["running", pid, pc, code_length, "prog.txt"]);
    }

    /// Every instruction costs at least two CPU ticks: one to issue the fetch/value read, one to
    /// consume the reply. This feeds a single fabricated MMU reply and drives both ticks.
    fn run_one_instruction(mailbox: &Mailbox, cpu: &mut Cpu, pid: Pid, reply: &str) {
        cpu.tick(mailbox);
        mailbox.put(Recipient::Mmu, Recipient::Process(pid), cmd!["data", reply, true]);
        cpu.tick(mailbox);
    }

    fn drain_scheduler_until(mailbox: &Mailbox, verb: &str) -> Message {
        std::iter::from_fn(|| mailbox.get(Recipient::Scheduler))
            .find(|m| m.verb() == verb)
            .unwrap_or_else(|| panic!("no `{verb}` message was sent to the scheduler"))
    }

    #[test]
    fn var_with_value_writes_then_advances() {
        let mailbox = Mailbox::new();
        let mut cpu = new_cpu(std::env::temp_dir().join("osim-cpu-test-var"));
        push_running(&mailbox, Pid(1), 0, 1);
        run_one_instruction(&mailbox, &mut cpu, Pid(1), "var x 0 5");

        let write = mailbox.get(Recipient::Mmu).unwrap();
        assert_eq!(write.verb(), "write");
        assert_eq!(write.arg(2), Some("1")); // addr 0 + code_length 1
        assert_eq!(write.arg(3), Some("5"));

        let set_pc = drain_scheduler_until(&mailbox, "setPc");
        assert_eq!(set_pc.arg(2), Some("1"));
    }

    #[test]
    fn out_blocks_then_writes_output_file() {
        let output_dir = std::env::temp_dir().join(format!("osim-cpu-test-out-{}", std::process::id()));
        let _ = fs::remove_dir_all(&output_dir);
        let mailbox = Mailbox::new();
        let mut cpu = new_cpu(output_dir.clone());

        push_running(&mailbox, Pid(2), 0, 0);
        run_one_instruction(&mailbox, &mut cpu, Pid(2), "var x 0 7");
        mailbox.get(Recipient::Mmu); // consume the init write
        drain_scheduler_until(&mailbox, "setPc");

        push_running(&mailbox, Pid(2), 1, 0);
        cpu.tick(&mailbox);
        assert_eq!(drain_scheduler_until(&mailbox, "block").verb(), "block");
        let read = mailbox.get(Recipient::Mmu).unwrap();
        assert_eq!(read.verb(), "read");
        assert_eq!(read.arg(2), Some("1")); // fetching the instruction text at pc 1

        mailbox.put(Recipient::Mmu, Recipient::Process(Pid(2)), cmd!["data", "out x", true]);
        cpu.tick(&mailbox);
        // the value read itself is now pending; one more round trip resolves it.
        assert_eq!(drain_scheduler_until(&mailbox, "block").verb(), "block");
        mailbox.get(Recipient::Mmu); // the read for x's value
        mailbox.put(Recipient::Mmu, Recipient::Process(Pid(2)), cmd!["data", "7", true]);
        cpu.tick(&mailbox);

        let contents = fs::read_to_string(output_dir.join("prog.txt.txt")).unwrap();
        assert_eq!(contents, "7\n");
    }

    #[test]
    fn unknown_opcode_faults_and_drops() {
        let mailbox = Mailbox::new();
        let mut cpu = new_cpu(std::env::temp_dir().join("osim-cpu-test-fault"));
        push_running(&mailbox, Pid(3), 0, 0);
        run_one_instruction(&mailbox, &mut cpu, Pid(3), "bogus");
        assert_eq!(mailbox.get(Recipient::External).unwrap().verb(), "error");
        assert_eq!(drain_scheduler_until(&mailbox, "drop").verb(), "drop");
        assert!(cpu.active_pid().is_none());
    }

    #[test]
    fn jump_to_known_label_sets_pc_directly() {
        let mailbox = Mailbox::new();
        let mut cpu = new_cpu(std::env::temp_dir().join("osim-cpu-test-jump"));
        push_running(&mailbox, Pid(4), 0, 0);
        mailbox.put(
            Recipient::Scheduler,
            Recipient::Cpu,
            vec!["labels".to_string(), "4".to_string(), "end=3".to_string()],
        );
        run_one_instruction(&mailbox, &mut cpu, Pid(4), "jump end");

        let set_pc = drain_scheduler_until(&mailbox, "setPc");
        assert_eq!(set_pc.arg(2), Some("3"));
    }
}
