//! Command-line front end for `osim-engine`. Loads an optional JSON config, overlays CLI flags on
//! top of it, admits one or more programs, lets the simulator run for a fixed window, then prints
//! the mailbox log and shuts the worker threads down.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{App, Arg};
use osim_engine::config::{BootConfig, ConfigError};
use osim_engine::error::MmuError;
use osim_engine::Simulator;
use serde::Deserialize;

/// The subset of [`BootConfig`] that can be supplied as JSON. Every field is optional; anything
/// left out falls back to [`BootConfig::default`], then to a CLI flag if one was also given.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    page_size: Option<usize>,
    page_number: Option<usize>,
    memory_clock_hz: Option<u32>,
    scheduler_clock_hz: Option<u32>,
    cpu_clock_hz: Option<u32>,
    quantum: Option<u32>,
    swap_dir: Option<String>,
    output_dir: Option<String>,
}

#[derive(Debug)]
enum CliError {
    ReadConfig(PathBuf, std::io::Error),
    ParseConfig(PathBuf, serde_json::Error),
    Validate(ConfigError),
    ReadProgram(PathBuf, std::io::Error),
    Mmu(MmuError),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::ReadConfig(path, e) => write!(f, "could not read config {}: {e}", path.display()),
            CliError::ParseConfig(path, e) => write!(f, "could not parse config {}: {e}", path.display()),
            CliError::Validate(e) => write!(f, "invalid configuration: {e}"),
            CliError::ReadProgram(path, e) => write!(f, "could not read program {}: {e}", path.display()),
            CliError::Mmu(e) => write!(f, "simulator aborted: {e}"),
        }
    }
}

impl std::error::Error for CliError {}

fn load_config(path: Option<&str>) -> Result<FileConfig, CliError> {
    match path {
        None => Ok(FileConfig::default()),
        Some(path) => {
            let path = PathBuf::from(path);
            let text = fs::read_to_string(&path).map_err(|e| CliError::ReadConfig(path.clone(), e))?;
            serde_json::from_str(&text).map_err(|e| CliError::ParseConfig(path, e))
        }
    }
}

fn merge_config(file: FileConfig, matches: &clap::ArgMatches) -> BootConfig {
    let default = BootConfig::default();
    let parse_flag = |name: &str| matches.value_of(name).and_then(|v| v.parse().ok());
    BootConfig {
        page_size: parse_flag("page-size").or(file.page_size).unwrap_or(default.page_size),
        page_number: parse_flag("page-number").or(file.page_number).unwrap_or(default.page_number),
        memory_clock_hz: parse_flag("memory-hz").or(file.memory_clock_hz).unwrap_or(default.memory_clock_hz),
        scheduler_clock_hz: parse_flag("scheduler-hz").or(file.scheduler_clock_hz).unwrap_or(default.scheduler_clock_hz),
        cpu_clock_hz: parse_flag("cpu-hz").or(file.cpu_clock_hz).unwrap_or(default.cpu_clock_hz),
        quantum: parse_flag("quantum").or(file.quantum).unwrap_or(default.quantum),
        swap_dir: matches
            .value_of("swap-dir")
            .map(PathBuf::from)
            .or_else(|| file.swap_dir.map(PathBuf::from))
            .unwrap_or(default.swap_dir),
        output_dir: matches
            .value_of("output-dir")
            .map(PathBuf::from)
            .or_else(|| file.output_dir.map(PathBuf::from))
            .unwrap_or(default.output_dir),
    }
}

fn count_lines(path: &str) -> Result<usize, CliError> {
    let text = fs::read_to_string(path).map_err(|e| CliError::ReadProgram(PathBuf::from(path), e))?;
    Ok(text.lines().count())
}

fn run() -> Result<(), CliError> {
    env_logger::init();

    let matches = App::new("osim")
        .version(env!("CARGO_PKG_VERSION"))
        .author("bunnie <bunnie@kosagi.com>")
        .about("Runs the teaching OS simulator: a mailbox-connected scheduler, MMU, and CPU")
        .arg(Arg::with_name("config").long("config").short("c").takes_value(true).help("JSON boot configuration"))
        .arg(Arg::with_name("program").long("program").short("p").takes_value(true).multiple(true).required(true).help("Program source file(s) to admit"))
        .arg(Arg::with_name("seconds").long("seconds").takes_value(true).default_value("5").help("How long to let the simulator run before shutdown"))
        .arg(Arg::with_name("page-size").long("page-size").takes_value(true))
        .arg(Arg::with_name("page-number").long("page-number").takes_value(true))
        .arg(Arg::with_name("memory-hz").long("memory-hz").takes_value(true))
        .arg(Arg::with_name("scheduler-hz").long("scheduler-hz").takes_value(true))
        .arg(Arg::with_name("cpu-hz").long("cpu-hz").takes_value(true))
        .arg(Arg::with_name("quantum").long("quantum").takes_value(true))
        .arg(Arg::with_name("swap-dir").long("swap-dir").takes_value(true))
        .arg(Arg::with_name("output-dir").long("output-dir").takes_value(true))
        .get_matches();

    let file_config = load_config(matches.value_of("config"))?;
    let config = merge_config(file_config, &matches);
    config.validate().map_err(CliError::Validate)?;

    let programs: Vec<&str> = matches.values_of("program").into_iter().flatten().collect();
    let mut admissions = Vec::with_capacity(programs.len());
    for path in &programs {
        admissions.push((path.to_string(), count_lines(path)?));
    }

    let seconds: u64 = matches.value_of("seconds").and_then(|v| v.parse().ok()).unwrap_or(5);

    let sim = Simulator::spawn(config).map_err(CliError::Validate)?;
    for (path, code_length) in admissions {
        log::info!(target: "osim-cli", "admitting {path} ({code_length} line(s))");
        sim.admit_program(path, code_length);
    }

    std::thread::sleep(Duration::from_secs(seconds));

    for line in sim.mailbox_log() {
        println!("{line}");
    }

    sim.shutdown().map_err(CliError::Mmu)
}

fn main() {
    if let Err(e) = run() {
        eprintln!("osim: {e}");
        std::process::exit(1);
    }
}
