//! Switch and interrupt dispatch
//!
//! [`Monitor`] ties process identification to the counter state machine.
//! The naked entry points in `arch::x86` reach it through the global slot
//! below; they never block on it.
//!
//! # Reentrancy
//!
//! Both entry points run with interrupts off on one processor, so the slot
//! is only contended if a PMI lands while the switch hook holds it. The
//! interrupt path then does the minimum that keeps the counters sane (zero
//! and re-arm) and counts the event as missed.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::config::{MonitorConfig, TriggerMode};
use crate::hal::RegisterAccess;
use crate::perf::counters::{self, CounterError, CounterStateMachine, EventOutcome};
use crate::perf::sample::{BufferAllocError, Sample, SampleBuffer};
use crate::profile::StructureLayout;
use crate::ps::identify::{IdentifyError, ProcessIdentifier, ScratchAlloc, SwitchParties};

// ============================================================================
// Statistics
// ============================================================================

/// Per-monitor event counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Thread switches observed
    pub switches: u64,
    /// Switch-ins of the target the counters accepted
    pub target_switch_ins: u64,
    /// Switch-outs of the target the counters accepted
    pub target_switch_outs: u64,
    /// PMIs or polling traps dispatched
    pub counter_events: u64,
    pub samples_recorded: u64,
    pub samples_dropped: u64,
    /// Switches skipped because a thread could not be identified
    pub identify_failures: u64,
    /// Double switch-outs
    pub contract_violations: u64,
    /// Target switches that arrived after teardown
    pub late_switches: u64,
}

/// Counter events that found the monitor busy or gone
static MISSED_COUNTER_EVENTS: AtomicU64 = AtomicU64::new(0);
/// Switches that found the monitor busy
static MISSED_SWITCHES: AtomicU64 = AtomicU64::new(0);

/// Events the global dispatchers could not deliver: (counter events, switches)
pub fn missed_events() -> (u64, u64) {
    (
        MISSED_COUNTER_EVENTS.load(Ordering::Relaxed),
        MISSED_SWITCHES.load(Ordering::Relaxed),
    )
}

// ============================================================================
// Monitor
// ============================================================================

/// Attribution logic behind both hooks
pub struct Monitor {
    counters: CounterStateMachine,
    identifier: ProcessIdentifier,
    stats: MonitorStats,
}

impl Monitor {
    pub fn new(config: &MonitorConfig, layout: StructureLayout) -> Result<Self, BufferAllocError> {
        Ok(Self {
            counters: CounterStateMachine::new(config)?,
            identifier: ProcessIdentifier::new(layout, config.target),
            stats: MonitorStats::default(),
        })
    }

    /// Take image name copies from `scratch` instead of the heap
    pub fn with_scratch(mut self, scratch: ScratchAlloc) -> Self {
        self.identifier = self.identifier.with_scratch(scratch);
        self
    }

    /// Thread switch from `outgoing` to `incoming`
    ///
    /// Both threads are identified first; if either fails, the switch is
    /// skipped and nothing is touched. A switch between two threads of the
    /// target saves and immediately restores, leaving the registers as
    /// they were.
    ///
    /// # Safety
    /// Both pointers must be null or live KTHREADs matching the layout.
    pub unsafe fn on_swap_context<R: RegisterAccess>(
        &mut self,
        regs: &mut R,
        outgoing: *const u8,
        incoming: *const u8,
    ) -> Result<SwitchParties, IdentifyError> {
        self.stats.switches += 1;

        let parties = match self.identifier.classify(outgoing, incoming) {
            Ok(parties) => parties,
            Err(e) => {
                self.stats.identify_failures += 1;
                return Err(e);
            }
        };

        if parties.outgoing {
            let result = self.counters.switch_out_target(regs);
            if self.note(result) {
                self.stats.target_switch_outs += 1;
            }
        }
        if parties.incoming {
            let result = self.counters.switch_in_target(regs);
            if self.note(result) {
                self.stats.target_switch_ins += 1;
            }
        }

        Ok(parties)
    }

    /// Record a refused transition; true if it was applied
    fn note(&mut self, result: Result<(), CounterError>) -> bool {
        match result {
            Ok(()) => true,
            Err(CounterError::CaptureAlreadyPending) => {
                self.stats.contract_violations += 1;
                false
            }
            Err(CounterError::Drained) => {
                self.stats.late_switches += 1;
                false
            }
        }
    }

    /// PMI or polling trap
    pub fn on_counter_event<R: RegisterAccess>(&mut self, regs: &mut R) -> EventOutcome {
        self.stats.counter_events += 1;
        let outcome = self.counters.on_counter_event(regs);
        match outcome {
            EventOutcome::Recorded => self.stats.samples_recorded += 1,
            EventOutcome::Dropped => self.stats.samples_dropped += 1,
            _ => {}
        }
        outcome
    }

    /// Final transition; flushes a pending capture into the samples
    pub fn drain(&mut self) -> Option<Sample> {
        let stored = self.counters.samples().len();
        let flushed = self.counters.drain();
        if flushed.is_some() {
            if self.counters.samples().len() > stored {
                self.stats.samples_recorded += 1;
            } else {
                self.stats.samples_dropped += 1;
            }
        }
        flushed
    }

    pub fn mode(&self) -> TriggerMode {
        self.counters.mode()
    }

    pub fn counters(&self) -> &CounterStateMachine {
        &self.counters
    }

    pub fn samples(&self) -> &SampleBuffer {
        self.counters.samples()
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    pub fn into_samples(self) -> SampleBuffer {
        self.counters.into_samples()
    }
}

impl core::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Monitor")
            .field("counters", &self.counters)
            .field("identifier", &self.identifier)
            .field("stats", &self.stats)
            .finish()
    }
}

// ============================================================================
// Global Slot
// ============================================================================

/// The live monitor, present between install and teardown
static MONITOR: Mutex<Option<Monitor>> = Mutex::new(None);

/// Put a monitor in the global slot
///
/// Hands it back if one is already live.
pub fn publish(monitor: Monitor) -> Result<(), Monitor> {
    let mut slot = MONITOR.lock();
    if slot.is_some() {
        return Err(monitor);
    }
    *slot = Some(monitor);
    Ok(())
}

/// Take the monitor out of the global slot
pub fn retract() -> Option<Monitor> {
    MONITOR.lock().take()
}

/// Switch hook body
///
/// # Safety
/// Same contract as [`Monitor::on_swap_context`].
pub unsafe fn dispatch_swap_context<R: RegisterAccess>(
    regs: &mut R,
    outgoing: *const u8,
    incoming: *const u8,
) {
    match MONITOR.try_lock() {
        Some(mut slot) => {
            if let Some(monitor) = slot.as_mut() {
                let _ = monitor.on_swap_context(regs, outgoing, incoming);
            }
        }
        None => {
            MISSED_SWITCHES.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Vector hook body
///
/// Without the monitor, the counters are still zeroed and re-armed in
/// `fallback` mode so the next overflow comes on schedule.
pub fn dispatch_counter_event<R: RegisterAccess>(regs: &mut R, fallback: TriggerMode) {
    if let Some(mut slot) = MONITOR.try_lock() {
        if let Some(monitor) = slot.as_mut() {
            monitor.on_counter_event(regs);
            return;
        }
    }

    MISSED_COUNTER_EVENTS.fetch_add(1, Ordering::Relaxed);
    counters::rearm(regs, fallback);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BUILD;
    use crate::hal::msreg::{ia32, MsrValue};
    use crate::perf::counters::{threshold_value, CounterState, BANK_SIZE};
    use crate::profile::WIN7_SP1_X86;
    use crate::sim::{FakeProcess, FakeThread, SimMachine};

    const LAYOUT: StructureLayout = WIN7_SP1_X86.layout;
    const BIAS: i32 = -50_000;

    struct Threads {
        target_process: FakeProcess,
        _other_process: FakeProcess,
        target: FakeThread,
        other: FakeThread,
    }

    fn threads() -> Threads {
        let target_process = FakeProcess::new(&LAYOUT, "test.exe");
        let other_process = FakeProcess::new(&LAYOUT, "svchost.exe");
        let target = FakeThread::new(&LAYOUT, &target_process);
        let other = FakeThread::new(&LAYOUT, &other_process);
        Threads {
            target_process,
            _other_process: other_process,
            target,
            other,
        }
    }

    fn monitor(max_samples: usize) -> Monitor {
        let config = MonitorConfig {
            mode: TriggerMode::Threshold { bias: BIAS },
            max_samples,
            ..BUILD
        };
        Monitor::new(&config, LAYOUT).unwrap()
    }

    #[test]
    fn test_scenario_overflow_in_first_window() {
        // Schedule: other, target, other, target; one PMI while the target runs
        let t = threads();
        let mut regs = SimMachine::new();
        let mut mon = monitor(16);

        unsafe {
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();

            regs.set_msr(ia32::FIXED_CTR0, MsrValue::new(12, 0));
            regs.count(&[0, 800, 700, 60, 5, 40, 3]);
            assert_eq!(mon.on_counter_event(&mut regs), EventOutcome::Recorded);

            mon.on_swap_context(&mut regs, t.target.as_ptr(), t.other.as_ptr()).unwrap();
            regs.count(&[3_000; BANK_SIZE]);
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();
        }

        assert_eq!(mon.samples().len(), 1);
        assert_eq!(mon.samples().as_slice()[0], Sample([50_012, 800, 700, 60, 5, 40, 3]));

        // Second switch-in restores the zeroed bank and the re-armed bias
        assert_eq!(regs.msr(ia32::FIXED_CTR0), threshold_value(BIAS));
        for &msr in &counters::BANK[1..] {
            assert_eq!(regs.msr(msr), MsrValue::ZERO);
        }

        let stats = mon.stats();
        assert_eq!(stats.switches, 3);
        assert_eq!(stats.target_switch_ins, 2);
        assert_eq!(stats.target_switch_outs, 1);
        assert_eq!(stats.samples_recorded, 1);
    }

    #[test]
    fn test_scenario_no_event_restores_capture() {
        // Schedule: target, other, target
        let t = threads();
        let mut regs = SimMachine::new();
        let mut mon = monitor(16);

        unsafe {
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();
            regs.count(&[10, 20, 30, 40, 50, 60, 70]);
            mon.on_swap_context(&mut regs, t.target.as_ptr(), t.other.as_ptr()).unwrap();
            let captured = *mon.counters().pending_capture().unwrap();

            regs.count(&[999; BANK_SIZE]);
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();

            assert_eq!(counters::Capture::read(&mut regs), captured);
        }
        assert!(mon.samples().is_empty());
    }

    #[test]
    fn test_switch_between_target_threads() {
        let t = threads();
        let second = FakeThread::new(&LAYOUT, &t.target_process);
        let mut regs = SimMachine::new();
        let mut mon = monitor(16);

        unsafe {
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();
            regs.count(&[5; BANK_SIZE]);
            let before = counters::Capture::read(&mut regs);

            let parties = mon.on_swap_context(&mut regs, t.target.as_ptr(), second.as_ptr()).unwrap();
            assert!(parties.outgoing && parties.incoming);
            assert_eq!(counters::Capture::read(&mut regs), before);
        }
        assert!(mon.counters().is_target_scheduled());
    }

    #[test]
    fn test_identification_failure_touches_nothing() {
        let t = threads();
        let orphan = FakeThread::orphan(&LAYOUT);
        let mut regs = SimMachine::new();
        let mut mon = monitor(16);

        // The incoming side is the target but the outgoing side is broken
        let result = unsafe { mon.on_swap_context(&mut regs, orphan.as_ptr(), t.target.as_ptr()) };
        assert_eq!(result, Err(IdentifyError::NoOwningProcess));
        assert_eq!(*mon.counters().state(), CounterState::Idle);
        assert!(regs.msr_writes().is_empty());
        assert_eq!(mon.stats().identify_failures, 1);
    }

    #[test]
    fn test_scratch_exhaustion_touches_nothing() {
        fn no_memory(_capacity: usize) -> Option<Vec<u8>> {
            None
        }

        let t = threads();
        let mut regs = SimMachine::new();
        let mut mon = monitor(16);
        unsafe {
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();
        }
        regs.count(&[17; BANK_SIZE]);
        let writes = regs.msr_writes().len();

        // The target is being switched out but its name cannot be copied
        let mut mon = mon.with_scratch(no_memory);
        let result = unsafe { mon.on_swap_context(&mut regs, t.target.as_ptr(), t.other.as_ptr()) };
        assert_eq!(result, Err(IdentifyError::OutOfMemory));
        assert_eq!(*mon.counters().state(), CounterState::Running);
        assert_eq!(regs.msr_writes().len(), writes);

        let stats = mon.stats();
        assert_eq!(stats.identify_failures, 1);
        assert_eq!(stats.target_switch_outs, 0);
        assert_eq!(stats.switches, 2);
    }

    #[test]
    fn test_double_switch_out_counted() {
        let t = threads();
        let mut regs = SimMachine::new();
        let mut mon = monitor(16);

        unsafe {
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();
            mon.on_swap_context(&mut regs, t.target.as_ptr(), t.other.as_ptr()).unwrap();
            mon.on_swap_context(&mut regs, t.target.as_ptr(), t.other.as_ptr()).unwrap();
        }
        let stats = mon.stats();
        assert_eq!(stats.contract_violations, 1);
        assert_eq!(stats.target_switch_outs, 1);
    }

    #[test]
    fn test_switches_after_drain_not_counted() {
        let t = threads();
        let mut regs = SimMachine::new();
        let mut mon = monitor(16);

        unsafe {
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();
        }
        mon.drain();
        let writes = regs.msr_writes().len();

        unsafe {
            mon.on_swap_context(&mut regs, t.target.as_ptr(), t.other.as_ptr()).unwrap();
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();
        }
        let stats = mon.stats();
        assert_eq!(stats.target_switch_ins, 1);
        assert_eq!(stats.target_switch_outs, 0);
        assert_eq!(stats.late_switches, 2);
        assert_eq!(regs.msr_writes().len(), writes);
    }

    #[test]
    fn test_drain_counts_flushed_sample() {
        let t = threads();
        let mut regs = SimMachine::new();
        let mut mon = monitor(16);

        unsafe {
            mon.on_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()).unwrap();
            mon.on_swap_context(&mut regs, t.target.as_ptr(), t.other.as_ptr()).unwrap();
        }
        assert!(mon.drain().is_some());
        assert_eq!(mon.samples().len(), 1);
        assert_eq!(mon.stats().samples_recorded, 1);
    }

    #[test]
    fn test_global_dispatch() {
        let _serial = crate::sim::global_slot_guard();
        let t = threads();
        let mut regs = SimMachine::new();
        let mode = TriggerMode::Threshold { bias: BIAS };

        // Nothing published: the event is missed but the counters re-armed
        dispatch_counter_event(&mut regs, mode);
        assert_eq!(regs.msr(ia32::FIXED_CTR0), threshold_value(BIAS));
        let (missed, _) = missed_events();
        assert!(missed >= 1);

        assert!(publish(monitor(16)).is_ok());
        assert!(publish(monitor(16)).is_err());

        unsafe { dispatch_swap_context(&mut regs, t.other.as_ptr(), t.target.as_ptr()) };
        regs.count(&[1; BANK_SIZE]);
        dispatch_counter_event(&mut regs, mode);

        // Busy slot: the event is counted as missed and the bank re-armed
        {
            let _held = MONITOR.lock();
            regs.count(&[7; BANK_SIZE]);
            dispatch_counter_event(&mut regs, mode);
            assert_eq!(regs.msr(ia32::PMC0), MsrValue::ZERO);
        }

        let mon = retract().unwrap();
        assert_eq!(mon.samples().len(), 1);
        assert_eq!(mon.stats().counter_events, 1);
        assert!(retract().is_none());
    }
}
