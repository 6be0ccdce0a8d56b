//! Boot-time configuration. Plain data only — this crate does not parse it from anywhere; the
//! `osim-cli` crate builds one of these from flags/a JSON file and hands it to
//! [`crate::Simulator::spawn`].

use std::path::PathBuf;

/// The numeric inputs §6 lists as GUI widgets in the original design.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Blocks per page.
    pub page_size: usize,
    /// Total pages of physical memory.
    pub page_number: usize,
    /// MMU tick rate, ops/second.
    pub memory_clock_hz: u32,
    /// Scheduler tick rate, ops/second.
    pub scheduler_clock_hz: u32,
    /// CPU tick rate, ops/second.
    pub cpu_clock_hz: u32,
    /// Scheduler ticks a process may hold RUNNING before rotation.
    pub quantum: u32,
    /// Directory swap files are written under (`<dir>/<pid>.txt`).
    pub swap_dir: PathBuf,
    /// Directory per-process output files are written under.
    pub output_dir: PathBuf,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            page_size: 4,
            page_number: 64,
            memory_clock_hz: 20,
            scheduler_clock_hz: 10,
            cpu_clock_hz: 20,
            quantum: 5,
            swap_dir: PathBuf::from("swap"),
            output_dir: PathBuf::from("output"),
        }
    }
}

/// A validation failure in a [`BootConfig`], surfaced before any worker thread is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroField(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroField(name) => write!(f, "`{name}` must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl BootConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 { return Err(ConfigError::ZeroField("page_size")); }
        if self.page_number == 0 { return Err(ConfigError::ZeroField("page_number")); }
        if self.memory_clock_hz == 0 { return Err(ConfigError::ZeroField("memory_clock_hz")); }
        if self.scheduler_clock_hz == 0 { return Err(ConfigError::ZeroField("scheduler_clock_hz")); }
        if self.cpu_clock_hz == 0 { return Err(ConfigError::ZeroField("cpu_clock_hz")); }
        if self.quantum == 0 { return Err(ConfigError::ZeroField("quantum")); }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() { BootConfig::default().validate().unwrap(); }

    #[test]
    fn zero_quantum_rejected() {
        let mut cfg = BootConfig::default();
        cfg.quantum = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroField("quantum")));
    }
}
