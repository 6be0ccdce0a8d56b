//! Process Control Block and process status.

use std::fmt;

/// A process identifier. Assigned monotonically starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl std::str::FromStr for Pid {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Ok(Pid(s.parse()?)) }
}

/// Lifecycle state of a process, per §3 of the design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Ready,
    Running,
    Blocked,
    SwappedOut,
    Terminated,
}

/// Process Control Block.
#[derive(Debug, Clone)]
pub struct Pcb {
    pub pid: Pid,
    pub code_path: String,
    pub code_length: usize,
    pub pc: usize,
    pub status: Status,
    /// Creation order, used to break ties when picking a swap victim.
    pub priority_of_loading: u64,
}

impl Pcb {
    pub fn new(pid: Pid, code_path: String, code_length: usize, priority_of_loading: u64) -> Self {
        Pcb { pid, code_path, code_length, pc: 0, status: Status::New, priority_of_loading }
    }
}
