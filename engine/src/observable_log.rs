//! A minimal append-only, thread-safe text log. Same shape as the mailbox's own internal log,
//! factored out so the execution-trace and general-output streams (§6) can use it too.

use std::sync::Mutex;

#[derive(Default)]
pub struct ObservableLog {
    lines: Mutex<Vec<String>>,
}

impl ObservableLog {
    pub fn new() -> Self { ObservableLog { lines: Mutex::new(Vec::new()) } }

    pub fn push(&self, line: String) { self.lines.lock().unwrap().push(line); }

    pub fn snapshot(&self) -> Vec<String> { self.lines.lock().unwrap().clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_snapshot_preserves_order() {
        let log = ObservableLog::new();
        log.push("a".into());
        log.push("b".into());
        assert_eq!(log.snapshot(), vec!["a".to_string(), "b".to_string()]);
    }
}
