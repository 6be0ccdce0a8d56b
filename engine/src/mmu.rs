//! Paged virtual memory: allocation, free, read, write, and disk swapping. Serves one request per
//! tick, polling its own mailbox queue (`Recipient::Mmu`).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cmd;
use crate::coordination::SwapCoordination;
use crate::error::MmuError;
use crate::mailbox::{Mailbox, Recipient};
use crate::pcb::Pid;

fn ceil_div(a: usize, b: usize) -> usize { (a + b - 1) / b }

enum AllocOutcome {
    Success,
    ExceedsCapacity,
    NoVictim,
}

pub struct Mmu {
    page_size: usize,
    page_number: usize,
    memory: Vec<Option<String>>,
    frame_in_use: Vec<bool>,
    page_tables: HashMap<Pid, BTreeMap<usize, usize>>,
    swap_dir: PathBuf,
}

impl Mmu {
    pub fn new(page_size: usize, page_number: usize, swap_dir: PathBuf) -> Self {
        Mmu {
            page_size,
            page_number,
            memory: vec![None; page_size * page_number],
            frame_in_use: vec![false; page_number],
            page_tables: HashMap::new(),
            swap_dir,
        }
    }

    pub fn pages_held(&self, pid: Pid) -> usize {
        self.page_tables.get(&pid).map_or(0, BTreeMap::len)
    }

    pub fn free_frame_count(&self) -> usize { self.frame_in_use.iter().filter(|b| !**b).count() }

    fn try_allocate(&mut self, pid: Pid, pages_needed: usize) -> bool {
        if pages_needed == 0 { return true; }
        let free: Vec<usize> = (0..self.page_number).filter(|&i| !self.frame_in_use[i]).take(pages_needed).collect();
        if free.len() < pages_needed { return false; }
        let already_held = self.pages_held(pid);
        let table = self.page_tables.entry(pid).or_default();
        for (i, frame_idx) in free.into_iter().enumerate() {
            table.insert(already_held + i, frame_idx);
            self.frame_in_use[frame_idx] = true;
        }
        true
    }

    fn allocate_pages(
        &mut self,
        mailbox: &Mailbox,
        coordination: &SwapCoordination,
        pid: Pid,
        pages: usize,
    ) -> Result<AllocOutcome, MmuError> {
        let already_held = self.pages_held(pid);
        if pages + already_held > self.page_number {
            return Ok(AllocOutcome::ExceedsCapacity);
        }
        let mut lock_acquired = false;
        let outcome = loop {
            if self.try_allocate(pid, pages) {
                break AllocOutcome::Success;
            }
            if !lock_acquired {
                coordination.lock();
                lock_acquired = true;
            }
            match coordination.take_next_candidate() {
                Some(victim) => {
                    self.swap_out(victim)?;
                    mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["swappedOut", victim]);
                }
                None => break AllocOutcome::NoVictim,
            }
        };
        if lock_acquired {
            coordination.unlock();
        }
        Ok(outcome)
    }

    fn swap_out(&mut self, pid: Pid) -> Result<(), MmuError> {
        let table = self.page_tables.remove(&pid).unwrap_or_default();
        let mut lines = Vec::new();
        for &frame_idx in table.values() {
            let offset = frame_idx * self.page_size;
            for cell in &self.memory[offset..offset + self.page_size] {
                lines.push(cell.clone().unwrap_or_default());
            }
        }
        for &frame_idx in table.values() {
            self.frame_in_use[frame_idx] = false;
            let offset = frame_idx * self.page_size;
            for cell in &mut self.memory[offset..offset + self.page_size] {
                *cell = None;
            }
        }
        fs::create_dir_all(&self.swap_dir).map_err(|e| MmuError::SwapIo(e.to_string()))?;
        let path = self.swap_dir.join(format!("{pid}.txt"));
        fs::write(&path, lines.join("\n")).map_err(|e| MmuError::SwapIo(e.to_string()))?;
        Ok(())
    }

    fn drop_process(&mut self, pid: Pid) {
        if let Some(table) = self.page_tables.remove(&pid) {
            for &frame_idx in table.values() {
                self.frame_in_use[frame_idx] = false;
                let offset = frame_idx * self.page_size;
                for cell in &mut self.memory[offset..offset + self.page_size] {
                    *cell = None;
                }
            }
        }
    }

    fn locate(&self, pid: Pid, address: usize) -> Option<usize> {
        let page = address / self.page_size;
        let offset = address % self.page_size;
        self.page_tables.get(&pid)?.get(&page).map(|frame_idx| frame_idx * self.page_size + offset)
    }

    pub fn handle_allocate(
        &mut self,
        mailbox: &Mailbox,
        coordination: &SwapCoordination,
        pid: Pid,
        blocks: usize,
        loading: bool,
    ) -> Result<(), MmuError> {
        let pages = if blocks == 0 { 0 } else { ceil_div(blocks, self.page_size) };
        match self.allocate_pages(mailbox, coordination, pid, pages)? {
            AllocOutcome::Success => {
                log::debug!(target: "mmu", "pid {pid} allocated {pages} page(s) (loading={loading})");
                let verb = if loading { "allocated" } else { "unblock" };
                mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd![verb, pid]);
            }
            AllocOutcome::ExceedsCapacity => {
                log::warn!(target: "mmu", "pid {pid} request for {pages} page(s) exceeds capacity");
                mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["drop", pid]);
            }
            AllocOutcome::NoVictim => {
                log::warn!(target: "mmu", "pid {pid} skipped: no swap victim available");
                mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["skip", pid]);
            }
        }
        Ok(())
    }

    pub fn handle_free(&mut self, mailbox: &Mailbox, pid: Pid, blocks: usize) {
        let pages = if blocks == 0 { 0 } else { ceil_div(blocks, self.page_size) };
        let held = self.pages_held(pid);
        if pages > held {
            log::warn!(target: "mmu", "pid {pid} tried to free {pages} page(s), holds {held}");
            mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["drop", pid]);
            return;
        }
        if pages == 0 {
            return;
        }
        let table = self.page_tables.get_mut(&pid).expect("held > 0 implies a page table exists");
        let victims: Vec<(usize, usize)> = table.iter().rev().take(pages).map(|(&k, &v)| (k, v)).collect();
        for (page_index, frame_idx) in victims {
            let offset = frame_idx * self.page_size;
            for cell in &mut self.memory[offset..offset + self.page_size] {
                *cell = None;
            }
            self.frame_in_use[frame_idx] = false;
            table.remove(&page_index);
        }
        log::debug!(target: "mmu", "pid {pid} freed {pages} page(s)");
    }

    pub fn handle_swap_in(&mut self, mailbox: &Mailbox, coordination: &SwapCoordination, pid: Pid) -> Result<(), MmuError> {
        let path = self.swap_dir.join(format!("{pid}.txt"));
        let contents = fs::read_to_string(&path).map_err(|e| MmuError::SwapIo(e.to_string()))?;
        let lines: Vec<&str> = if contents.is_empty() { Vec::new() } else { contents.split('\n').collect() };
        let blocks = lines.len();
        let pages = if blocks == 0 { 0 } else { ceil_div(blocks, self.page_size) };
        match self.allocate_pages(mailbox, coordination, pid, pages)? {
            AllocOutcome::Success => {
                for (addr, line) in lines.iter().enumerate() {
                    if !line.is_empty() {
                        let offset = self.locate(pid, addr).expect("just allocated");
                        self.memory[offset] = Some(line.to_string());
                    }
                }
                log::debug!(target: "mmu", "pid {pid} swapped in ({blocks} block(s))");
                mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["swappedIn", pid]);
            }
            AllocOutcome::ExceedsCapacity | AllocOutcome::NoVictim => {
                log::warn!(target: "mmu", "pid {pid} swap-in skipped, could not allocate");
                mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["skip", pid]);
            }
        }
        Ok(())
    }

    pub fn handle_read(&mut self, mailbox: &Mailbox, pid: Pid, address: usize, final_: bool) {
        match self.locate(pid, address).and_then(|offset| self.memory[offset].clone()) {
            Some(value) => {
                mailbox.put(Recipient::Mmu, Recipient::Process(pid), cmd!["data", value, final_]);
                if final_ {
                    mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["unblock", pid]);
                }
            }
            None => {
                log::warn!(target: "mmu", "pid {pid} read unmapped/empty address {address}");
                mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["drop", pid]);
            }
        }
    }

    pub fn handle_write(&mut self, mailbox: &Mailbox, pid: Pid, address: usize, data: String, final_: bool) {
        match self.locate(pid, address) {
            Some(offset) => {
                self.memory[offset] = Some(data);
                if final_ {
                    mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["unblock", pid]);
                }
            }
            None => {
                log::warn!(target: "mmu", "pid {pid} write to unmapped address {address}");
                mailbox.put(Recipient::Mmu, Recipient::Scheduler, cmd!["drop", pid]);
            }
        }
    }

    pub fn handle_drop(&mut self, pid: Pid) {
        self.drop_process(pid);
        log::debug!(target: "mmu", "pid {pid} dropped, pages reclaimed");
    }
}

enum MmuRequest {
    Allocate { pid: Pid, blocks: usize, loading: bool },
    Free { pid: Pid, blocks: usize },
    SwapIn { pid: Pid },
    Read { pid: Pid, address: usize, final_: bool },
    Write { pid: Pid, address: usize, data: String, final_: bool },
    Drop { pid: Pid },
}

fn parse_request(message: &crate::mailbox::Message) -> Option<MmuRequest> {
    let pid_at = |i: usize| message.arg(i)?.parse::<Pid>().ok();
    match message.verb() {
        "allocate" => Some(MmuRequest::Allocate {
            pid: pid_at(1)?,
            blocks: message.arg(2)?.parse().ok()?,
            loading: message.arg(3)? == "true",
        }),
        "free" => Some(MmuRequest::Free { pid: pid_at(1)?, blocks: message.arg(2)?.parse().ok()? }),
        "swapIn" => Some(MmuRequest::SwapIn { pid: pid_at(1)? }),
        "read" => Some(MmuRequest::Read {
            pid: pid_at(1)?,
            address: message.arg(2)?.parse().ok()?,
            final_: message.arg(3)? == "true",
        }),
        "write" => Some(MmuRequest::Write {
            pid: pid_at(1)?,
            address: message.arg(2)?.parse().ok()?,
            data: message.arg(3)?.to_string(),
            final_: message.arg(4)? == "true",
        }),
        "drop" => Some(MmuRequest::Drop { pid: pid_at(1)? }),
        _ => None,
    }
}

/// Runs the MMU's tick loop until `shutdown` is set. Returns an error only for the SYSTEM_FATAL
/// case (swap file I/O failure), at which point the whole simulator must abort.
pub fn run(
    mut mmu: Mmu,
    mailbox: Arc<Mailbox>,
    coordination: Arc<SwapCoordination>,
    tick_rate_hz: u32,
    shutdown: Arc<AtomicBool>,
) -> Result<(), MmuError> {
    let period = Duration::from_secs_f64(1.0 / tick_rate_hz as f64);
    while !shutdown.load(Ordering::Relaxed) {
        if let Some(message) = mailbox.get(Recipient::Mmu) {
            if let Some(request) = parse_request(&message) {
                match request {
                    MmuRequest::Allocate { pid, blocks, loading } => {
                        mmu.handle_allocate(&mailbox, &coordination, pid, blocks, loading)?
                    }
                    MmuRequest::Free { pid, blocks } => mmu.handle_free(&mailbox, pid, blocks),
                    MmuRequest::SwapIn { pid } => mmu.handle_swap_in(&mailbox, &coordination, pid)?,
                    MmuRequest::Read { pid, address, final_ } => mmu.handle_read(&mailbox, pid, address, final_),
                    MmuRequest::Write { pid, address, data, final_ } => {
                        mmu.handle_write(&mailbox, pid, address, data, final_)
                    }
                    MmuRequest::Drop { pid } => mmu.handle_drop(pid),
                }
            } else {
                log::error!(target: "mmu", "unparseable request: {:?}", message.tokens());
            }
        }
        std::thread::sleep(period);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::SwapCoordination;

    fn fresh(page_size: usize, page_number: usize) -> (Mmu, Mailbox, SwapCoordination) {
        let dir = std::env::temp_dir().join(format!("osim-mmu-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        (Mmu::new(page_size, page_number, dir), Mailbox::new(), SwapCoordination::new())
    }

    #[test]
    fn alloc_zero_is_noop_success() {
        let (mut mmu, mailbox, coord) = fresh(4, 8);
        mmu.handle_allocate(&mailbox, &coord, Pid(1), 0, true).unwrap();
        let reply = mailbox.get(Recipient::Scheduler).unwrap();
        assert_eq!(reply.verb(), "allocated");
        assert_eq!(mmu.pages_held(Pid(1)), 0);
    }

    #[test]
    fn allocate_full_capacity_then_one_more_exceeds() {
        let (mut mmu, mailbox, coord) = fresh(1, 4);
        mmu.handle_allocate(&mailbox, &coord, Pid(1), 4, true).unwrap();
        assert_eq!(mailbox.get(Recipient::Scheduler).unwrap().verb(), "allocated");
        assert_eq!(mmu.free_frame_count(), 0);

        mmu.handle_allocate(&mailbox, &coord, Pid(2), 1, true).unwrap();
        assert_eq!(mailbox.get(Recipient::Scheduler).unwrap().verb(), "drop");
    }

    #[test]
    fn allocate_then_free_round_trips_frame_record() {
        let (mut mmu, mailbox, _coord) = fresh(2, 4);
        let before = mmu.free_frame_count();
        let coord = SwapCoordination::new();
        mmu.handle_allocate(&mailbox, &coord, Pid(1), 3, true).unwrap();
        mailbox.get(Recipient::Scheduler);
        mmu.handle_free(&mailbox, Pid(1), 3);
        assert_eq!(mmu.free_frame_count(), before);
        assert_eq!(mmu.pages_held(Pid(1)), 0);
    }

    #[test]
    fn free_more_than_held_drops_process() {
        let (mut mmu, mailbox, coord) = fresh(4, 8);
        mmu.handle_allocate(&mailbox, &coord, Pid(1), 1, true).unwrap();
        mailbox.get(Recipient::Scheduler);
        mmu.handle_free(&mailbox, Pid(1), 999);
        assert_eq!(mailbox.get(Recipient::Scheduler).unwrap().verb(), "drop");
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mut mmu, mailbox, coord) = fresh(4, 4);
        mmu.handle_allocate(&mailbox, &coord, Pid(1), 4, true).unwrap();
        mailbox.get(Recipient::Scheduler);
        mmu.handle_write(&mailbox, Pid(1), 2, "hello".to_string(), false);
        mmu.handle_read(&mailbox, Pid(1), 2, true);
        let data = mailbox.get(Recipient::Process(Pid(1))).unwrap();
        assert_eq!(data.verb(), "data");
        assert_eq!(data.arg(1), Some("hello"));
        assert_eq!(mailbox.get(Recipient::Scheduler).unwrap().verb(), "unblock");
    }

    #[test]
    fn read_unmapped_address_drops_process() {
        let (mut mmu, mailbox, _coord) = fresh(4, 4);
        mmu.handle_read(&mailbox, Pid(7), 0, true);
        assert_eq!(mailbox.get(Recipient::Scheduler).unwrap().verb(), "drop");
    }

    #[test]
    fn swap_out_then_swap_in_reproduces_cells() {
        let (mut mmu, mailbox, coord) = fresh(2, 4);
        mmu.handle_allocate(&mailbox, &coord, Pid(9), 4, true).unwrap();
        mailbox.get(Recipient::Scheduler);
        mmu.handle_write(&mailbox, Pid(9), 0, "a".to_string(), false);
        mmu.handle_write(&mailbox, Pid(9), 3, "d".to_string(), false);

        mmu.swap_out(Pid(9)).unwrap();
        assert_eq!(mmu.pages_held(Pid(9)), 0);

        mmu.handle_swap_in(&mailbox, &coord, Pid(9)).unwrap();
        assert_eq!(mailbox.get(Recipient::Scheduler).unwrap().verb(), "swappedIn");
        mmu.handle_read(&mailbox, Pid(9), 0, false);
        assert_eq!(mailbox.get(Recipient::Process(Pid(9))).unwrap().arg(1), Some("a"));
        mmu.handle_read(&mailbox, Pid(9), 3, false);
        assert_eq!(mailbox.get(Recipient::Process(Pid(9))).unwrap().arg(1), Some("d"));
    }

    #[test]
    fn no_free_frames_swaps_out_oldest_candidate_then_succeeds() {
        let (mut mmu, mailbox, coord) = fresh(1, 2);
        mmu.handle_allocate(&mailbox, &coord, Pid(1), 1, true).unwrap();
        mailbox.get(Recipient::Scheduler);
        mmu.handle_allocate(&mailbox, &coord, Pid(2), 1, true).unwrap();
        mailbox.get(Recipient::Scheduler);
        coord.publish_swappable(vec![Pid(1)]);

        mmu.handle_allocate(&mailbox, &coord, Pid(3), 1, true).unwrap();
        let swapped_out = mailbox.get(Recipient::Scheduler).unwrap();
        assert_eq!(swapped_out.verb(), "swappedOut");
        assert_eq!(swapped_out.arg(1), Some("1"));
        let allocated = mailbox.get(Recipient::Scheduler).unwrap();
        assert_eq!(allocated.verb(), "allocated");
        assert_eq!(allocated.arg(1), Some("3"));
        assert!(!coord.is_locked());
    }

    #[test]
    fn no_victim_available_skips_requester() {
        let (mut mmu, mailbox, coord) = fresh(1, 1);
        mmu.handle_allocate(&mailbox, &coord, Pid(1), 1, true).unwrap();
        mailbox.get(Recipient::Scheduler);
        mmu.handle_allocate(&mailbox, &coord, Pid(2), 1, true).unwrap();
        assert_eq!(mailbox.get(Recipient::Scheduler).unwrap().verb(), "skip");
        assert!(!coord.is_locked());
    }
}
