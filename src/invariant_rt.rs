//! RT-safe signaling out of the cycle loop.
//!
//! Two tiers, as for setup-phase invariants:
//! - **Tier 1 (RT-safe)**: workers push invariant IDs and [`CycleFault`]s into
//!   lock-free SPSC queues.
//! - **Tier 2 (Non-RT)**: the scheduler drains them and judges.
//!
//! Workers signal facts. The control thread decides what they mean.
//!
//! # Example
//!
//! ```ignore
//! signal_invariant(&mut signals_tx, INV_CYCLE_COMPLETED);
//! let signals = drain_invariant_signals(&mut signals_rx);
//! assert!(signals.contains(&INV_CYCLE_COMPLETED));
//! ```

use rtrb::{Consumer, Producer, RingBuffer};

/// Every GAM of the thread ran and its outputs were written.
pub const INV_CYCLE_COMPLETED: u8 = 1;

/// The timing writer of the thread was flushed.
pub const INV_TIMES_WRITTEN: u8 = 2;

/// The worker left its loop because it was asked to.
pub const INV_WORKER_STOPPED_CLEAN: u8 = 3;

/// Capacity of the signal queue of one worker.
pub const INVARIANT_QUEUE_CAPACITY: usize = 256;

/// Capacity of the fault queue of one worker.
pub const FAULT_QUEUE_CAPACITY: usize = 16;

/// Step of the cycle that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The input broker refused to read.
    InputRead,
    /// The GAM returned an error.
    Execute,
    /// The output broker refused to write.
    OutputWrite,
    /// The timing writer refused to write.
    TimingWrite,
}

/// A failure observed inside the cycle loop.
///
/// Plain data: building and pushing one never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleFault {
    /// Index of the thread in its state record.
    pub thread: usize,
    /// Index of the GAM in its thread, or `usize::MAX` for the timing writer.
    pub gam: usize,
    /// Cycles completed before the fault.
    pub cycle: u64,
    /// What failed.
    pub kind: FaultKind,
}

/// Creates a new invariant signal queue pair.
///
/// Returns (producer for the worker, consumer for the control thread).
pub fn new_invariant_queue() -> (Producer<u8>, Consumer<u8>) {
    RingBuffer::new(INVARIANT_QUEUE_CAPACITY)
}

/// Creates a new fault queue pair.
pub fn new_fault_queue() -> (Producer<CycleFault>, Consumer<CycleFault>) {
    RingBuffer::new(FAULT_QUEUE_CAPACITY)
}

/// Signals an invariant from the cycle loop.
///
/// A full queue drops the signal rather than block.
#[inline]
pub fn signal_invariant(tx: &mut Producer<u8>, id: u8) {
    let _ = tx.push(id);
}

/// Reports a fault from the cycle loop. Dropped when the queue is full.
#[inline]
pub fn signal_fault(tx: &mut Producer<CycleFault>, fault: CycleFault) {
    let _ = tx.push(fault);
}

/// Drains all pending invariant signals from the queue.
pub fn drain_invariant_signals(rx: &mut Consumer<u8>) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Drains all pending faults from the queue.
pub fn drain_faults(rx: &mut Consumer<CycleFault>) -> Vec<CycleFault> {
    let mut faults = Vec::new();
    while let Ok(fault) = rx.pop() {
        faults.push(fault);
    }
    faults
}

/// Counts occurrences of each invariant ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Contract verification: asserts that required invariants were signaled.
///
/// # Panics
/// Panics if any required invariant was not signaled at least once.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts[id as usize] == 0)
        .map(|&id| invariant_name(id))
        .collect();
    if !missing.is_empty() {
        let present: std::collections::BTreeSet<&str> =
            signals.iter().map(|&id| invariant_name(id)).collect();
        panic!(
            "RT Contract '{}' missing invariants: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_CYCLE_COMPLETED => "CYCLE_COMPLETED",
        INV_TIMES_WRITTEN => "TIMES_WRITTEN",
        INV_WORKER_STOPPED_CLEAN => "WORKER_STOPPED_CLEAN",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_queue_roundtrip() {
        let (mut tx, mut rx) = new_invariant_queue();
        signal_invariant(&mut tx, INV_CYCLE_COMPLETED);
        signal_invariant(&mut tx, INV_TIMES_WRITTEN);
        signal_invariant(&mut tx, INV_CYCLE_COMPLETED);
        let signals = drain_invariant_signals(&mut rx);
        assert_eq!(
            signals,
            vec![INV_CYCLE_COMPLETED, INV_TIMES_WRITTEN, INV_CYCLE_COMPLETED]
        );
        let counts = count_invariant_signals(&signals);
        assert_eq!(counts[INV_CYCLE_COMPLETED as usize], 2);
        assert_eq!(counts[INV_WORKER_STOPPED_CLEAN as usize], 0);
    }

    #[test]
    fn test_fault_queue_drops_on_overflow() {
        let (mut tx, mut rx) = new_fault_queue();
        for cycle in 0..FAULT_QUEUE_CAPACITY as u64 + 4 {
            signal_fault(
                &mut tx,
                CycleFault {
                    thread: 0,
                    gam: 1,
                    cycle,
                    kind: FaultKind::Execute,
                },
            );
        }
        let faults = drain_faults(&mut rx);
        assert_eq!(faults.len(), FAULT_QUEUE_CAPACITY);
        assert_eq!(faults[0].cycle, 0);
    }

    #[test]
    #[should_panic(expected = "missing invariants")]
    fn test_contract_fails_when_invariants_missing() {
        contract_test_rt(
            "incomplete contract",
            &[INV_CYCLE_COMPLETED],
            &[INV_CYCLE_COMPLETED, INV_TIMES_WRITTEN],
        );
    }

    #[test]
    fn test_invariant_names() {
        assert_eq!(invariant_name(INV_TIMES_WRITTEN), "TIMES_WRITTEN");
        assert_eq!(invariant_name(255), "UNKNOWN");
    }
}
