//! Process lifecycle, ready queue, round-robin quantum enforcement, and swap coordination.
//! Serves its own mailbox queue (`Recipient::Scheduler`) once per tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cmd;
use crate::coordination::SwapCoordination;
use crate::instruction::scan_labels;
use crate::mailbox::{Mailbox, Message, Recipient};
use crate::pcb::{Pcb, Pid, Status};

enum SchedulerRequest {
    Admit { path: String, code_length: usize },
    Allocated { pid: Pid },
    Unblock { pid: Pid },
    Block { pid: Pid },
    Drop { pid: Pid },
    SwappedOut { pid: Pid },
    SwappedIn { pid: Pid },
    Skip { pid: Pid },
    GetRunning,
    SetPc { pid: Pid, pc: usize },
}

fn parse_request(message: &Message) -> Option<SchedulerRequest> {
    let pid_at = |i: usize| message.arg(i)?.parse::<Pid>().ok();
    match message.verb() {
        "admit" => Some(SchedulerRequest::Admit {
            path: message.arg(1)?.to_string(),
            code_length: message.arg(2)?.parse().ok()?,
        }),
        "allocated" => Some(SchedulerRequest::Allocated { pid: pid_at(1)? }),
        "unblock" => Some(SchedulerRequest::Unblock { pid: pid_at(1)? }),
        "block" => Some(SchedulerRequest::Block { pid: pid_at(1)? }),
        "drop" => Some(SchedulerRequest::Drop { pid: pid_at(1)? }),
        "swappedOut" => Some(SchedulerRequest::SwappedOut { pid: pid_at(1)? }),
        "swappedIn" => Some(SchedulerRequest::SwappedIn { pid: pid_at(1)? }),
        "skip" => Some(SchedulerRequest::Skip { pid: pid_at(1)? }),
        "getRunning" => Some(SchedulerRequest::GetRunning),
        "setPc" => Some(SchedulerRequest::SetPc { pid: pid_at(1)?, pc: message.arg(2)?.parse().ok()? }),
        _ => None,
    }
}

pub struct Scheduler {
    processes: HashMap<Pid, Pcb>,
    ready: VecDeque<Pid>,
    blocked: HashSet<Pid>,
    swapped: HashSet<Pid>,
    pending_swap_in: HashSet<Pid>,
    pending_removal: Vec<Pid>,
    running: Option<Pid>,
    running_ticks: u32,
    quantum: u32,
    next_pid: u32,
    admission_order: u64,
}

impl Scheduler {
    pub fn new(quantum: u32) -> Self {
        Scheduler {
            processes: HashMap::new(),
            ready: VecDeque::new(),
            blocked: HashSet::new(),
            swapped: HashSet::new(),
            pending_swap_in: HashSet::new(),
            pending_removal: Vec::new(),
            running: None,
            running_ticks: 0,
            quantum,
            next_pid: 1,
            admission_order: 0,
        }
    }

    pub fn running_pid(&self) -> Option<Pid> { self.running }

    pub fn pcb(&self, pid: Pid) -> Option<&Pcb> { self.processes.get(&pid) }

    fn admit(&mut self, mailbox: &Mailbox, path: String, code_length: usize) {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        self.admission_order += 1;
        let pcb = Pcb::new(pid, path, code_length, self.admission_order);
        self.processes.insert(pid, pcb);
        log::info!(target: "scheduler", "admitting pid {pid} ({code_length} line(s))");
        mailbox.put(Recipient::Scheduler, Recipient::Mmu, cmd!["allocate", pid, code_length, true]);
    }

    /// Code was allocated for a loading process: load its text and pre-scan labels, then mark it
    /// READY. See §9: labels are pre-loaded here instead of lazily by the CPU on first schedule.
    fn handle_allocated(&mut self, mailbox: &Mailbox, pid: Pid) {
        let Some(pcb) = self.processes.get(&pid) else { return };
        let code_path = pcb.code_path.clone();
        let code_length = pcb.code_length;
        let source = match fs::read_to_string(&code_path) {
            Ok(s) => s,
            Err(e) => {
                log::error!(target: "scheduler", "pid {pid} could not read {code_path}: {e}");
                mailbox.put(Recipient::Scheduler, Recipient::Mmu, cmd!["drop", pid]);
                mailbox.put(Recipient::Scheduler, Recipient::Cpu, cmd!["drop", pid]);
                self.processes.remove(&pid);
                return;
            }
        };
        let lines: Vec<&str> = source.lines().collect();
        for (addr, line) in lines.iter().enumerate().take(code_length) {
            let final_ = addr + 1 == code_length;
            mailbox.put(Recipient::Scheduler, Recipient::Mmu, cmd!["write", pid, addr, *line, final_]);
        }

        let labels = scan_labels(&source);
        if !labels.is_empty() {
            let mut tokens = vec!["labels".to_string(), pid.to_string()];
            tokens.extend(labels.iter().map(|(name, idx)| format!("{name}={idx}")));
            mailbox.put(Recipient::Scheduler, Recipient::Cpu, tokens);
        }

        if let Some(pcb) = self.processes.get_mut(&pid) {
            pcb.status = Status::Ready;
        }
        self.ready.push_back(pid);
        log::info!(target: "scheduler", "pid {pid} admitted and ready");
    }

    fn handle_unblock(&mut self, pid: Pid) {
        if self.blocked.remove(&pid) {
            if let Some(pcb) = self.processes.get_mut(&pid) {
                pcb.status = Status::Ready;
            }
            self.ready.push_back(pid);
        }
    }

    fn handle_block(&mut self, pid: Pid) {
        if self.running == Some(pid) {
            self.running = None;
            self.running_ticks = 0;
        }
        if let Some(pcb) = self.processes.get_mut(&pid) {
            pcb.status = Status::Blocked;
        }
        self.blocked.insert(pid);
    }

    fn handle_drop(&mut self, mailbox: &Mailbox, pid: Pid) {
        if !self.processes.contains_key(&pid) {
            return;
        }
        log::info!(target: "scheduler", "pid {pid} dropped");
        if self.running == Some(pid) {
            self.running = None;
            self.running_ticks = 0;
        }
        self.ready.retain(|&p| p != pid);
        self.blocked.remove(&pid);
        self.swapped.remove(&pid);
        self.pending_swap_in.remove(&pid);
        if let Some(pcb) = self.processes.get_mut(&pid) {
            pcb.status = Status::Terminated;
        }
        mailbox.put(Recipient::Scheduler, Recipient::Mmu, cmd!["drop", pid]);
        mailbox.put(Recipient::Scheduler, Recipient::Cpu, cmd!["drop", pid]);
        self.pending_removal.push(pid);
    }

    fn handle_swapped_out(&mut self, pid: Pid) {
        self.ready.retain(|&p| p != pid);
        self.blocked.remove(&pid);
        self.swapped.insert(pid);
        if let Some(pcb) = self.processes.get_mut(&pid) {
            pcb.status = Status::SwappedOut;
        }
    }

    fn handle_swapped_in(&mut self, pid: Pid) {
        self.swapped.remove(&pid);
        self.pending_swap_in.remove(&pid);
        if let Some(pcb) = self.processes.get_mut(&pid) {
            pcb.status = Status::Ready;
        }
        self.ready.push_back(pid);
    }

    fn handle_skip(&mut self, pid: Pid) {
        self.pending_swap_in.remove(&pid);
        self.ready.retain(|&p| p != pid);
        self.ready.push_back(pid);
    }

    fn reply_running(&self, mailbox: &Mailbox) {
        match self.running.and_then(|pid| self.processes.get(&pid).map(|pcb| (pid, pcb))) {
            Some((pid, pcb)) => {
                mailbox.put(
                    Recipient::Scheduler,
                    Recipient::Cpu,
                    cmd!["running", pid, pcb.pc, pcb.code_length, pcb.code_path],
                );
            }
            None => {
                mailbox.put(Recipient::Scheduler, Recipient::Cpu, vec!["running".to_string(), "none".to_string()]);
            }
        }
    }

    fn set_pc(&mut self, pid: Pid, pc: usize) {
        if let Some(pcb) = self.processes.get_mut(&pid) {
            pcb.pc = pc;
        }
    }

    /// Candidates for swapping: every BLOCKED pid, plus the PID at the tail of READY.
    fn publish_swappable(&self, coordination: &SwapCoordination) {
        let mut candidates: Vec<Pid> = self.blocked.iter().copied().collect();
        if let Some(&tail) = self.ready.back() {
            candidates.push(tail);
        }
        coordination.publish_swappable(candidates);
    }

    fn try_start_next(&mut self, mailbox: &Mailbox) {
        while let Some(&pid) = self.ready.front() {
            match self.processes.get(&pid).map(|p| p.status) {
                Some(Status::SwappedOut) => {
                    // Defensive: a prior swap raced with this PID still sitting at the ready
                    // head. Ask the MMU to bring it back and try the next candidate meanwhile.
                    self.ready.pop_front();
                    if self.pending_swap_in.insert(pid) {
                        mailbox.put(Recipient::Scheduler, Recipient::Mmu, cmd!["swapIn", pid]);
                    }
                }
                Some(Status::Ready) => {
                    self.ready.pop_front();
                    if let Some(pcb) = self.processes.get_mut(&pid) {
                        pcb.status = Status::Running;
                    }
                    self.running = Some(pid);
                    self.running_ticks = 0;
                    return;
                }
                _ => {
                    // Stale entry (already terminated/blocked via a race); drop it silently.
                    self.ready.pop_front();
                }
            }
        }
    }

    fn advance_running(&mut self, mailbox: &Mailbox, coordination: &SwapCoordination) {
        if coordination.is_locked() {
            return;
        }
        match self.running {
            Some(_pid) => {
                self.running_ticks += 1;
                if self.running_ticks >= self.quantum {
                    if let Some(pid) = self.running.take() {
                        if let Some(pcb) = self.processes.get_mut(&pid) {
                            pcb.status = Status::Ready;
                        }
                        self.ready.push_back(pid);
                    }
                    self.running_ticks = 0;
                    self.try_start_next(mailbox);
                }
            }
            None => self.try_start_next(mailbox),
        }
    }

    pub fn tick(&mut self, mailbox: &Mailbox, coordination: &SwapCoordination) {
        for pid in self.pending_removal.drain(..).collect::<Vec<_>>() {
            self.processes.remove(&pid);
        }
        while let Some(message) = mailbox.get(Recipient::Scheduler) {
            match parse_request(&message) {
                Some(SchedulerRequest::Admit { path, code_length }) => self.admit(mailbox, path, code_length),
                Some(SchedulerRequest::Allocated { pid }) => self.handle_allocated(mailbox, pid),
                Some(SchedulerRequest::Unblock { pid }) => self.handle_unblock(pid),
                Some(SchedulerRequest::Block { pid }) => self.handle_block(pid),
                Some(SchedulerRequest::Drop { pid }) => self.handle_drop(mailbox, pid),
                Some(SchedulerRequest::SwappedOut { pid }) => self.handle_swapped_out(pid),
                Some(SchedulerRequest::SwappedIn { pid }) => self.handle_swapped_in(pid),
                Some(SchedulerRequest::Skip { pid }) => self.handle_skip(pid),
                Some(SchedulerRequest::GetRunning) => self.reply_running(mailbox),
                Some(SchedulerRequest::SetPc { pid, pc }) => self.set_pc(pid, pc),
                None => log::error!(target: "scheduler", "unparseable request: {:?}", message.tokens()),
            }
        }
        self.publish_swappable(coordination);
        self.advance_running(mailbox, coordination);
    }
}

pub fn run(
    mut scheduler: Scheduler,
    mailbox: Arc<Mailbox>,
    coordination: Arc<SwapCoordination>,
    tick_rate_hz: u32,
    shutdown: Arc<AtomicBool>,
) {
    let period = Duration::from_secs_f64(1.0 / tick_rate_hz as f64);
    while !shutdown.load(Ordering::Relaxed) {
        scheduler.tick(&mailbox, &coordination);
        std::thread::sleep(period);
    }
}
