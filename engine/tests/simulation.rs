//! End-to-end tests driving a real [`Simulator`]: three live threads, a mailbox, and programs
//! written to a temp directory. These exercise the full admit -> schedule -> fetch/execute ->
//! memory round trip rather than any single component in isolation.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use osim_engine::config::BootConfig;
use osim_engine::Simulator;

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("osim-it-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_program(dir: &PathBuf, name: &str, lines: &[&str]) -> (String, usize) {
    let path = dir.join(name);
    let mut f = fs::File::create(&path).unwrap();
    for line in lines {
        writeln!(f, "{line}").unwrap();
    }
    (path.to_string_lossy().to_string(), lines.len())
}

fn fast_config(dir: &PathBuf) -> BootConfig {
    BootConfig {
        page_size: 4,
        page_number: 64,
        memory_clock_hz: 300,
        scheduler_clock_hz: 300,
        cpu_clock_hz: 300,
        quantum: 4,
        swap_dir: dir.join("swap"),
        output_dir: dir.join("output"),
    }
}

fn read_output(dir: &PathBuf, basename: &str) -> String {
    fs::read_to_string(dir.join("output").join(format!("{basename}.txt"))).unwrap_or_default()
}

#[test]
fn out_instruction_writes_value_to_output_file() {
    let dir = scratch_dir("var-out");
    let (path, len) = write_program(&dir, "prog.txt", &["alloc 1", "var x 0 5", "out x", "exit"]);
    let sim = Simulator::spawn(fast_config(&dir)).unwrap();
    sim.admit_program(path, len);
    std::thread::sleep(Duration::from_millis(500));
    let log = sim.mailbox_log();
    let general_output = sim.general_output_log();
    sim.shutdown().unwrap();

    assert_eq!(read_output(&dir, "prog").trim(), "5");
    assert!(log.iter().any(|l| l.contains("CPU -> SCHEDULER") && l.contains("drop")));
    assert!(general_output.iter().any(|l| l == "[1] 5"));
}

#[test]
fn math_expression_honors_no_precedence_contract() {
    // math z = (x+y)*2 with x=10, y=3 -> 26, written left to right through parens.
    let dir = scratch_dir("math");
    let (path, len) = write_program(
        &dir,
        "prog.txt",
        &["alloc 1", "var x 0 10", "var y 1 3", "var z 2", "math z=(x+y)*2", "out z", "exit"],
    );
    let sim = Simulator::spawn(fast_config(&dir)).unwrap();
    sim.admit_program(path, len);
    std::thread::sleep(Duration::from_millis(700));
    sim.shutdown().unwrap();

    assert_eq!(read_output(&dir, "prog").trim(), "26.0");
}

#[test]
fn jumpif_loop_counts_down_and_emits_each_value() {
    // n starts at 3, decrements to 0, printing each value along the way.
    let dir = scratch_dir("loop");
    let (path, len) = write_program(
        &dir,
        "prog.txt",
        &[
            "alloc 1",
            "var n 0 3",
            "loop:out n",
            "dec n",
            "jumpif n > 0 loop",
            "exit",
        ],
    );
    let sim = Simulator::spawn(fast_config(&dir)).unwrap();
    sim.admit_program(path, len);
    std::thread::sleep(Duration::from_millis(900));
    sim.shutdown().unwrap();

    let lines: Vec<String> = read_output(&dir, "prog").lines().map(str::to_string).collect();
    assert_eq!(lines, vec!["3.0".to_string(), "2.0".to_string(), "1.0".to_string()]);
}

#[test]
fn unknown_opcode_faults_the_process_and_surfaces_on_external() {
    let dir = scratch_dir("fault");
    let (path, len) = write_program(&dir, "prog.txt", &["bogus"]);
    let sim = Simulator::spawn(fast_config(&dir)).unwrap();
    sim.admit_program(path, len);
    std::thread::sleep(Duration::from_millis(400));
    let log = sim.mailbox_log();
    sim.shutdown().unwrap();

    assert!(log.iter().any(|l| l.contains("CPU -> EXTERNAL") && l.contains("error")));
}

#[test]
fn alloc_then_free_round_trips_without_faulting() {
    let dir = scratch_dir("alloc-free");
    let (path, len) = write_program(&dir, "prog.txt", &["alloc 4", "free 4", "exit"]);
    let sim = Simulator::spawn(fast_config(&dir)).unwrap();
    sim.admit_program(path, len);
    std::thread::sleep(Duration::from_millis(500));
    let log = sim.mailbox_log();
    sim.shutdown().unwrap();

    assert!(!log.iter().any(|l| l.contains("CPU -> EXTERNAL") && l.contains("error")));
}

#[test]
fn two_processes_round_robin_and_both_complete() {
    let dir = scratch_dir("round-robin");
    let (path_a, len_a) = write_program(&dir, "a.txt", &["alloc 1", "var x 0 1", "out x", "exit"]);
    let (path_b, len_b) = write_program(&dir, "b.txt", &["alloc 1", "var y 0 2", "out y", "exit"]);
    let sim = Simulator::spawn(fast_config(&dir)).unwrap();
    sim.admit_program(path_a, len_a);
    sim.admit_program(path_b, len_b);
    std::thread::sleep(Duration::from_millis(800));
    sim.shutdown().unwrap();

    assert_eq!(read_output(&dir, "a").trim(), "1");
    assert_eq!(read_output(&dir, "b").trim(), "2");
}

#[test]
fn capacity_exceeding_allocation_drops_the_process() {
    let dir = scratch_dir("capacity");
    let (path, len) = write_program(&dir, "prog.txt", &["alloc 10000", "exit"]);
    let mut config = fast_config(&dir);
    config.page_number = 4; // total capacity far smaller than the requested 10000 blocks
    let sim = Simulator::spawn(config).unwrap();
    sim.admit_program(path, len);
    std::thread::sleep(Duration::from_millis(400));
    let log = sim.mailbox_log();
    sim.shutdown().unwrap();

    assert!(log.iter().any(|l| l.contains("-> SCHEDULER") && l.contains("drop")));
}
