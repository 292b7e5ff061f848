//! Counter state machine
//!
//! Owns the counter bank on behalf of the target process:
//!
//! ```text
//!            first switch-in                switch-out
//!   Idle ─────────────────────▶ Running ─────────────────▶ Suspended
//!                                  ▲  │ overflow/poll:          │
//!                                  │  └ sample, zero, re-arm    │
//!                                  └────────────────────────────┘
//!                                          switch-in: restore
//!
//!   any state ── teardown ──▶ Drained (pending capture flushed)
//! ```
//!
//! `Running` means the target is the scheduled process and the physical
//! counters hold its counts. `Suspended` carries the capture taken when it
//! was switched out; the physical counters meanwhile count whoever runs and
//! are simply overwritten on restore.
//!
//! The only mutation surface is the transition methods below, called from
//! the switch and interrupt entry points.

use core::fmt;

use super::sample::{BufferAllocError, Sample, SampleBuffer};
use crate::config::{MonitorConfig, TriggerMode};
use crate::hal::msreg::{
    ia32, EventSelector, FixedCtrCtrl, GlobalCtrl, GlobalOvfCtrl, MsrValue, COUNTER_HIGH_MASK,
};
use crate::hal::RegisterAccess;

/// Counters in the bank
pub const BANK_SIZE: usize = 7;

/// Counter MSRs in sample order: three fixed, then four programmable
pub const BANK: [u32; BANK_SIZE] = [
    ia32::FIXED_CTR0,
    ia32::FIXED_CTR1,
    ia32::FIXED_CTR2,
    ia32::PMC0,
    ia32::PMC1,
    ia32::PMC2,
    ia32::PMC3,
];

/// Selector MSRs for the programmable counters
pub const EVENT_SELECT: [u32; 4] = [
    ia32::PERFEVTSEL0,
    ia32::PERFEVTSEL1,
    ia32::PERFEVTSEL2,
    ia32::PERFEVTSEL3,
];

/// Primary (overflow-generating) counter slot
pub const PRIMARY_SLOT: usize = 0;

/// Register value arming fixed counter 0 with a negative bias
#[inline]
pub const fn threshold_value(bias: i32) -> MsrValue {
    MsrValue::new(bias as u32, COUNTER_HIGH_MASK)
}

/// Slot 0 as recorded for a raw counter value
///
/// In threshold mode the counter started at `bias`, so the distance from
/// the bias is the number of events counted.
#[inline]
pub fn primary_count(mode: TriggerMode, raw: u64) -> u64 {
    match mode {
        TriggerMode::Threshold { bias } => (bias as i64 - raw as i64).unsigned_abs(),
        TriggerMode::Polling => raw,
    }
}

/// Zero the bank, re-arm the primary counter and clear its overflow bit
///
/// Needs nothing but the mode, so interrupt paths that cannot reach the
/// state machine can still leave the counters in a clean state.
pub fn rearm<R: RegisterAccess>(regs: &mut R, mode: TriggerMode) {
    let primary = match mode {
        TriggerMode::Threshold { bias } => threshold_value(bias),
        TriggerMode::Polling => MsrValue::ZERO,
    };
    regs.write_msr(BANK[PRIMARY_SLOT], primary);

    for &msr in &BANK[1..] {
        regs.write_msr(msr, MsrValue::ZERO);
    }

    regs.write_msr(
        ia32::PERF_GLOBAL_OVF_CTRL,
        MsrValue::from_u64(GlobalOvfCtrl::CLR_FIXED_CTR0.bits()),
    );
}

// ============================================================================
// Capture
// ============================================================================

/// Raw register halves of the whole bank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capture(pub [MsrValue; BANK_SIZE]);

impl Capture {
    /// Read the bank in sample order
    pub fn read<R: RegisterAccess>(regs: &mut R) -> Self {
        let mut values = [MsrValue::ZERO; BANK_SIZE];
        for (value, &msr) in values.iter_mut().zip(BANK.iter()) {
            *value = regs.read_msr(msr);
        }
        Capture(values)
    }

    /// Load the bank from this capture
    pub fn write_back<R: RegisterAccess>(&self, regs: &mut R) {
        for (value, &msr) in self.0.iter().zip(BANK.iter()) {
            regs.write_msr(msr, *value);
        }
    }

    /// 48-bit values, untransformed
    pub fn counts(&self) -> [u64; BANK_SIZE] {
        let mut counts = [0u64; BANK_SIZE];
        for (count, value) in counts.iter_mut().zip(self.0.iter()) {
            *count = value.counter_value();
        }
        counts
    }

    /// Sample for a completed measurement window
    pub fn to_sample(&self, mode: TriggerMode) -> Sample {
        let mut counts = self.counts();
        counts[PRIMARY_SLOT] = primary_count(mode, counts[PRIMARY_SLOT]);
        Sample(counts)
    }

    /// Sample for a window cut short at teardown: no bias transform
    pub fn to_partial_sample(&self) -> Sample {
        Sample(self.counts())
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Where the target process stands with respect to the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    /// Target not seen yet, counters unconfigured
    Idle,
    /// Target scheduled, counters live
    Running,
    /// Target switched out, its counts parked in the capture
    Suspended(Capture),
    /// Torn down
    Drained,
}

/// Result of an overflow or poll event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// A sample was appended
    Recorded,
    /// The sample was taken but the buffer was full
    Dropped,
    /// First poll event: the measurement window starts now
    WindowOpened,
    /// Target not scheduled, counters re-armed only
    Rearmed,
    /// Drained, nothing touched
    Ignored,
}

/// Contract violations reported by transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    /// Switch-out of the target while a capture is still pending
    CaptureAlreadyPending,
    /// Transition attempted after teardown
    Drained,
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterError::CaptureAlreadyPending => {
                write!(f, "target switched out twice without a switch-in")
            }
            CounterError::Drained => write!(f, "counter state already drained"),
        }
    }
}

/// Save/restore and sampling protocol for the counter bank
pub struct CounterStateMachine {
    mode: TriggerMode,
    events: [EventSelector; 4],
    state: CounterState,
    samples: SampleBuffer,
    poll_start_marker: bool,
    window_open: bool,
}

impl CounterStateMachine {
    /// State machine with its sample table fully allocated
    pub fn new(config: &MonitorConfig) -> Result<Self, BufferAllocError> {
        Ok(Self {
            mode: config.mode,
            events: config.events,
            state: CounterState::Idle,
            samples: SampleBuffer::with_capacity(config.max_samples)?,
            poll_start_marker: config.poll_start_marker,
            window_open: false,
        })
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    pub fn state(&self) -> &CounterState {
        &self.state
    }

    /// Whether the target's counts are live in the registers
    pub fn is_target_scheduled(&self) -> bool {
        matches!(self.state, CounterState::Running)
    }

    pub fn pending_capture(&self) -> Option<&Capture> {
        match &self.state {
            CounterState::Suspended(capture) => Some(capture),
            _ => None,
        }
    }

    pub fn samples(&self) -> &SampleBuffer {
        &self.samples
    }

    pub fn into_samples(self) -> SampleBuffer {
        self.samples
    }

    /// One-time programming of the bank
    fn configure<R: RegisterAccess>(&self, regs: &mut R) {
        let (fixed_ctrl, primary) = match self.mode {
            TriggerMode::Threshold { bias } => (FixedCtrCtrl::USER_ONLY_CTR0_PMI, threshold_value(bias)),
            TriggerMode::Polling => (FixedCtrCtrl::USER_ONLY, MsrValue::ZERO),
        };

        regs.write_msr(ia32::FIXED_CTR_CTRL, MsrValue::new(fixed_ctrl.bits(), 0));
        regs.write_msr(BANK[PRIMARY_SLOT], primary);

        for (&msr, selector) in EVENT_SELECT.iter().zip(self.events.iter()) {
            regs.write_msr(msr, MsrValue::new(selector.raw(), 0));
        }

        for &msr in &BANK[1..] {
            regs.write_msr(msr, MsrValue::ZERO);
        }

        regs.write_msr(ia32::PERF_GLOBAL_CTRL, MsrValue::from_u64(GlobalCtrl::BANK.bits()));
    }

    /// The target process is being switched out
    pub fn switch_out_target<R: RegisterAccess>(&mut self, regs: &mut R) -> Result<(), CounterError> {
        match self.state {
            CounterState::Running => {
                self.state = CounterState::Suspended(Capture::read(regs));
                Ok(())
            }
            // The first capture stays authoritative
            CounterState::Suspended(_) => Err(CounterError::CaptureAlreadyPending),
            // Hooks went live while the target was running; nothing configured yet
            CounterState::Idle => Ok(()),
            CounterState::Drained => Err(CounterError::Drained),
        }
    }

    /// The target process is being switched in
    pub fn switch_in_target<R: RegisterAccess>(&mut self, regs: &mut R) -> Result<(), CounterError> {
        match self.state {
            CounterState::Idle => {
                self.configure(regs);
                self.state = CounterState::Running;
                Ok(())
            }
            CounterState::Suspended(capture) => {
                capture.write_back(regs);
                self.state = CounterState::Running;
                Ok(())
            }
            CounterState::Running => Ok(()),
            CounterState::Drained => Err(CounterError::Drained),
        }
    }

    /// Counter overflow PMI or polling trap
    pub fn on_counter_event<R: RegisterAccess>(&mut self, regs: &mut R) -> EventOutcome {
        let outcome = match self.state {
            CounterState::Drained => return EventOutcome::Ignored,
            CounterState::Running => {
                if self.mode.is_polling() && self.poll_start_marker && !self.window_open {
                    self.window_open = true;
                    EventOutcome::WindowOpened
                } else {
                    let sample = Capture::read(regs).to_sample(self.mode);
                    if self.samples.push(sample) {
                        EventOutcome::Recorded
                    } else {
                        EventOutcome::Dropped
                    }
                }
            }
            CounterState::Idle | CounterState::Suspended(_) => EventOutcome::Rearmed,
        };

        rearm(regs, self.mode);
        outcome
    }

    /// Terminal transition; a pending capture becomes the last sample
    pub fn drain(&mut self) -> Option<Sample> {
        let previous = core::mem::replace(&mut self.state, CounterState::Drained);
        match previous {
            CounterState::Suspended(capture) => {
                let sample = capture.to_partial_sample();
                self.samples.push(sample);
                Some(sample)
            }
            _ => None,
        }
    }
}

impl fmt::Debug for CounterStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterStateMachine")
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("samples", &self.samples)
            .finish()
    }
}
