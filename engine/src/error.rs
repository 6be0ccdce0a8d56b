//! Error types for each component. Matching the rest of this codebase, these are hand-written
//! `Display` impls rather than a derive-macro error crate — there isn't enough variance in these
//! enums to earn the dependency.

use std::fmt;

use crate::pcb::Pid;

/// Faults raised while decoding or executing an instruction. Always localised to the offending
/// process: the CPU drops it and logs `[CPU/ERROR] ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuFault {
    UnknownOpcode(String),
    UndefinedVariable(String),
    UndefinedLabel(String),
    MalformedMath(String),
    NotANumber(String),
    MmuRejected(Pid),
}

impl fmt::Display for CpuFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuFault::UnknownOpcode(op) => write!(f, "unknown opcode `{op}`"),
            CpuFault::UndefinedVariable(name) => write!(f, "undefined variable `{name}`"),
            CpuFault::UndefinedLabel(name) => write!(f, "undefined label `{name}`"),
            CpuFault::MalformedMath(expr) => write!(f, "malformed math expression `{expr}`"),
            CpuFault::NotANumber(token) => write!(f, "`{token}` is not a number"),
            CpuFault::MmuRejected(pid) => write!(f, "MMU rejected pid {pid}"),
        }
    }
}

impl std::error::Error for CpuFault {}

/// Outcomes the MMU can report for a request. `Dropped`/`SystemFatal` are not strictly "errors"
/// from a caller's perspective (the MMU always replies with *something*) but are modelled here so
/// component code can match on fault class instead of re-parsing mailbox tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmuError {
    /// `NO_FREE_FRAMES` persisted even after exhausting the swappable candidate list.
    NoVictimAvailable,
    /// `pages + already_held > page_number`.
    CapacityExceeded,
    /// Read/write to an unmapped page, or a read of an empty cell.
    UnmappedAddress { pid: Pid, address: usize },
    /// `free` requested more blocks than the process holds.
    OverFree { pid: Pid, requested: usize, held: usize },
    /// Swap file I/O failed. This is SYSTEM_FATAL: the whole simulator aborts.
    SwapIo(String),
}

impl fmt::Display for MmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmuError::NoVictimAvailable => write!(f, "no swap victim available"),
            MmuError::CapacityExceeded => write!(f, "allocation exceeds system capacity"),
            MmuError::UnmappedAddress { pid, address } => {
                write!(f, "pid {pid} touched unmapped address {address}")
            }
            MmuError::OverFree { pid, requested, held } => {
                write!(f, "pid {pid} tried to free {requested} blocks but holds {held}")
            }
            MmuError::SwapIo(msg) => write!(f, "swap file I/O failure: {msg}"),
        }
    }
}

impl std::error::Error for MmuError {}

/// Scheduler-side errors. Currently only transient ones: a requested operation on a PID the
/// scheduler no longer knows about (it may have just been dropped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    UnknownPid(Pid),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::UnknownPid(pid) => write!(f, "no such pid {pid}"),
        }
    }
}

impl std::error::Error for SchedulerError {}
