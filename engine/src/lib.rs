//! Core engine for the teaching operating-system simulator: a mailbox-connected Scheduler, MMU,
//! and CPU, each running on its own OS thread at its own configurable tick rate. See
//! [`Simulator`] for the entry point; `osim-cli` is the only consumer of this crate outside its
//! own test suite.

pub mod config;
pub mod coordination;
pub mod cpu;
pub mod error;
pub mod instruction;
pub mod mailbox;
pub mod mmu;
pub mod observable_log;
pub mod pcb;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cmd;
use config::BootConfig;
use coordination::SwapCoordination;
use error::MmuError;
use mailbox::{Mailbox, Recipient};
use observable_log::ObservableLog;

/// A running instance of the three worker threads, sharing one [`Mailbox`] and one
/// [`SwapCoordination`]. Dropping this without calling [`Simulator::shutdown`] leaves the threads
/// running; always shut down explicitly.
pub struct Simulator {
    mailbox: Arc<Mailbox>,
    trace_log: Arc<ObservableLog>,
    general_output_log: Arc<ObservableLog>,
    shutdown: Arc<AtomicBool>,
    scheduler_handle: Option<JoinHandle<()>>,
    mmu_handle: Option<JoinHandle<Result<(), MmuError>>>,
    cpu_handle: Option<JoinHandle<()>>,
}

impl Simulator {
    /// Validates `config`, then spawns the scheduler, MMU, and CPU threads.
    pub fn spawn(config: BootConfig) -> Result<Self, config::ConfigError> {
        config.validate()?;
        log::info!(
            target: "osim",
            "spawning simulator: {} page(s) of {} block(s), quantum {}",
            config.page_number,
            config.page_size,
            config.quantum,
        );

        let mailbox = Arc::new(Mailbox::new());
        let trace_log = Arc::new(ObservableLog::new());
        let general_output_log = Arc::new(ObservableLog::new());
        let coordination = Arc::new(SwapCoordination::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = scheduler::Scheduler::new(config.quantum);
        let scheduler_handle = {
            let mailbox = mailbox.clone();
            let coordination = coordination.clone();
            let shutdown = shutdown.clone();
            let rate = config.scheduler_clock_hz;
            std::thread::Builder::new()
                .name("osim-scheduler".into())
                .spawn(move || scheduler::run(scheduler, mailbox, coordination, rate, shutdown))
                .expect("failed to spawn scheduler thread")
        };

        let mmu = mmu::Mmu::new(config.page_size, config.page_number, config.swap_dir.clone());
        let mmu_handle = {
            let mailbox = mailbox.clone();
            let coordination = coordination.clone();
            let shutdown = shutdown.clone();
            let rate = config.memory_clock_hz;
            std::thread::Builder::new()
                .name("osim-mmu".into())
                .spawn(move || mmu::run(mmu, mailbox, coordination, rate, shutdown))
                .expect("failed to spawn MMU thread")
        };

        let cpu = cpu::Cpu::new(config.output_dir.clone(), trace_log.clone(), general_output_log.clone());
        let cpu_handle = {
            let mailbox = mailbox.clone();
            let shutdown = shutdown.clone();
            let rate = config.cpu_clock_hz;
            std::thread::Builder::new()
                .name("osim-cpu".into())
                .spawn(move || cpu::run(cpu, mailbox, rate, shutdown))
                .expect("failed to spawn CPU thread")
        };

        Ok(Simulator {
            mailbox,
            trace_log,
            general_output_log,
            shutdown,
            scheduler_handle: Some(scheduler_handle),
            mmu_handle: Some(mmu_handle),
            cpu_handle: Some(cpu_handle),
        })
    }

    /// Submits a program for admission. `code_length` is the number of lines in `path` the
    /// scheduler should load; the caller is expected to have counted them (the host driver reads
    /// the file to do so before calling this).
    pub fn admit_program(&self, path: impl Into<String>, code_length: usize) {
        self.mailbox.put(Recipient::External, Recipient::Scheduler, cmd!["admit", path.into(), code_length]);
    }

    /// A snapshot of every message ever exchanged, for UI consumption.
    pub fn mailbox_log(&self) -> Vec<String> {
        self.mailbox.log_snapshot()
    }

    /// A snapshot of the per-cycle CPU execution trace, for UI consumption.
    pub fn trace_log(&self) -> Vec<String> {
        self.trace_log.snapshot()
    }

    /// A snapshot of the general output log: process-visible `out` values and error reports.
    pub fn general_output_log(&self) -> Vec<String> {
        self.general_output_log.snapshot()
    }

    /// Signals all three threads to stop after their current tick and waits for them to exit.
    pub fn shutdown(mut self) -> Result<(), MmuError> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.scheduler_handle.take() {
            let _ = h.join();
        }
        let mmu_result = match self.mmu_handle.take() {
            Some(h) => h.join().unwrap_or(Ok(())),
            None => Ok(()),
        };
        if let Some(h) = self.cpu_handle.take() {
            let _ = h.join();
        }
        mmu_result
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn admit_program_enqueues_a_scheduler_message() {
        let mailbox = Mailbox::new();
        mailbox.put(Recipient::External, Recipient::Scheduler, cmd!["admit", "prog.txt", 3]);
        let message = mailbox.get(Recipient::Scheduler).unwrap();
        assert_eq!(message.verb(), "admit");
        assert_eq!(message.arg(1), Some("prog.txt"));
    }

    #[test]
    fn simulator_runs_a_null_exit_program_to_completion() {
        let dir = std::env::temp_dir().join(format!("osim-lib-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let program_path = dir.join("prog.txt");
        let mut f = std::fs::File::create(&program_path).unwrap();
        writeln!(f, "null").unwrap();
        writeln!(f, "exit").unwrap();
        drop(f);

        let config = BootConfig {
            page_size: 4,
            page_number: 8,
            memory_clock_hz: 200,
            scheduler_clock_hz: 200,
            cpu_clock_hz: 200,
            quantum: 2,
            swap_dir: dir.join("swap"),
            output_dir: dir.join("output"),
        };
        let sim = Simulator::spawn(config).unwrap();
        sim.admit_program(program_path.to_string_lossy().to_string(), 2);
        std::thread::sleep(std::time::Duration::from_millis(200));
        let log = sim.mailbox_log();
        sim.shutdown().unwrap();

        assert!(log.iter().any(|line| line.contains("allocate")));
    }
}
