//! The in-memory message bus. Every cross-component interaction in this simulator — CPU asking
//! the scheduler who is running, the scheduler asking the MMU to allocate, the MMU answering a
//! read — goes through here instead of a direct call. See the module's role in `lib.rs`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::pcb::Pid;

/// The closed set of addressable mailbox endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    Scheduler,
    Mmu,
    Cpu,
    /// A process's private reply channel, used for data/instruction fetch replies.
    Process(Pid),
    /// Not a valid recipient; used only as the sender tag for messages originating outside the
    /// three components (program admission requested by the host driver).
    External,
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Scheduler => write!(f, "SCHEDULER"),
            Recipient::Mmu => write!(f, "MMU"),
            Recipient::Cpu => write!(f, "CPU"),
            Recipient::Process(pid) => write!(f, "{pid}"),
            Recipient::External => write!(f, "EXTERNAL"),
        }
    }
}

/// A single mailbox message. `command` is the pipe-delimited token list; `tokens()[0]` names the
/// verb.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: Recipient,
    pub recipient: Recipient,
    command: Vec<String>,
}

impl Message {
    pub fn tokens(&self) -> &[String] { &self.command }

    pub fn verb(&self) -> &str { self.command.first().map(String::as_str).unwrap_or("") }

    pub fn arg(&self, idx: usize) -> Option<&str> { self.command.get(idx).map(String::as_str) }

    fn rendered(&self) -> String { self.command.join("|") }
}

/// Convenience macro-free builder: `cmd!["allocate", pid, blocks, loading]`.
#[macro_export]
macro_rules! cmd {
    ($($part:expr),+ $(,)?) => {
        vec![$($part.to_string()),+]
    };
}

#[derive(Default)]
struct Inner {
    queues: HashMap<Recipient, VecDeque<Message>>,
    log: Vec<String>,
}

/// Thread-safe, non-blocking, FIFO-per-recipient message bus.
pub struct Mailbox {
    inner: Mutex<Inner>,
}

impl Mailbox {
    pub fn new() -> Self { Mailbox { inner: Mutex::new(Inner::default()) } }

    /// Appends a message to `recipient`'s queue. Never blocks, never reorders.
    pub fn put(&self, sender: Recipient, recipient: Recipient, command: Vec<String>) {
        let message = Message { sender, recipient, command };
        log::trace!(target: "mailbox", "{} -> {}: {}", message.sender, message.recipient, message.rendered());
        let mut inner = self.inner.lock().unwrap();
        let rendered = format!("{} -> {}: {}", message.sender, message.recipient, message.rendered());
        inner.queues.entry(recipient).or_default().push_back(message);
        inner.log.push(rendered);
    }

    /// Returns and removes the oldest message addressed to `recipient`, or `None` if its queue is
    /// empty. Never blocks.
    pub fn get(&self, recipient: Recipient) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.get_mut(&recipient).and_then(VecDeque::pop_front)
    }

    /// A snapshot of every message ever put, for UI consumption.
    pub fn log_snapshot(&self) -> Vec<String> { self.inner.lock().unwrap().log.clone() }
}

impl Default for Mailbox {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_recipient() {
        let mbox = Mailbox::new();
        mbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["read", 1, 0, true]);
        mbox.put(Recipient::Cpu, Recipient::Mmu, cmd!["read", 1, 1, true]);
        let first = mbox.get(Recipient::Mmu).unwrap();
        let second = mbox.get(Recipient::Mmu).unwrap();
        assert_eq!(first.arg(2), Some("0"));
        assert_eq!(second.arg(2), Some("1"));
        assert!(mbox.get(Recipient::Mmu).is_none());
    }

    #[test]
    fn recipients_are_independent() {
        let mbox = Mailbox::new();
        mbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["allocated", 3]);
        assert!(mbox.get(Recipient::Cpu).is_none());
        assert_eq!(mbox.get(Recipient::Scheduler).unwrap().verb(), "allocated");
    }

    #[test]
    fn empty_get_does_not_block_or_panic() {
        let mbox = Mailbox::new();
        assert!(mbox.get(Recipient::Process(Pid(42))).is_none());
    }

    #[test]
    fn log_is_append_only_and_observable() {
        let mbox = Mailbox::new();
        mbox.put(Recipient::Scheduler, Recipient::Mmu, cmd!["free", 1, 2]);
        mbox.get(Recipient::Mmu);
        assert_eq!(mbox.log_snapshot().len(), 1);
    }
}
