//! Model Specific Register (MSR) Definitions
//!
//! Addresses and bit layouts of the architectural performance monitoring
//! MSRs (Intel SDM Vol. 3B, chapter 18):
//!
//! - **Counters**: IA32_FIXED_CTR0..2, IA32_PMC0..3
//! - **Selectors**: IA32_PERFEVTSEL0..3
//! - **Control**: IA32_FIXED_CTR_CTRL, IA32_PERF_GLOBAL_CTRL,
//!   IA32_PERF_GLOBAL_OVF_CTRL
//!
//! # Counter width
//!
//! Counters are 48 bits wide. `rdmsr` returns them in EDX:EAX; only the low
//! 16 bits of EDX are meaningful, the rest is masked off when the halves
//! are combined.

use bitflags::bitflags;

// ============================================================================
// Well-Known MSR Addresses
// ============================================================================

/// Architectural MSRs (IA32_)
pub mod ia32 {
    /// PMC 0
    pub const PMC0: u32 = 0xC1;
    /// PMC 1
    pub const PMC1: u32 = 0xC2;
    /// PMC 2
    pub const PMC2: u32 = 0xC3;
    /// PMC 3
    pub const PMC3: u32 = 0xC4;
    /// Performance Event Select 0
    pub const PERFEVTSEL0: u32 = 0x186;
    /// Performance Event Select 1
    pub const PERFEVTSEL1: u32 = 0x187;
    /// Performance Event Select 2
    pub const PERFEVTSEL2: u32 = 0x188;
    /// Performance Event Select 3
    pub const PERFEVTSEL3: u32 = 0x189;
    /// Fixed Counter 0 (instructions retired)
    pub const FIXED_CTR0: u32 = 0x309;
    /// Fixed Counter 1 (unhalted core cycles)
    pub const FIXED_CTR1: u32 = 0x30A;
    /// Fixed Counter 2 (unhalted reference cycles)
    pub const FIXED_CTR2: u32 = 0x30B;
    /// Fixed Counter Control
    pub const FIXED_CTR_CTRL: u32 = 0x38D;
    /// Perf Global Control
    pub const PERF_GLOBAL_CTRL: u32 = 0x38F;
    /// Perf Global OVF Control
    pub const PERF_GLOBAL_OVF_CTRL: u32 = 0x390;
}

/// Mask applied to the high half of a counter read
pub const COUNTER_HIGH_MASK: u32 = 0xFFFF;

// ============================================================================
// Register Value
// ============================================================================

/// An MSR value as the EDX:EAX pair `rdmsr`/`wrmsr` work with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MsrValue {
    /// EAX half
    pub low: u32,
    /// EDX half
    pub high: u32,
}

impl MsrValue {
    pub const ZERO: MsrValue = MsrValue { low: 0, high: 0 };

    #[inline]
    pub const fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    /// Split a 64-bit value into halves
    #[inline]
    pub const fn from_u64(value: u64) -> Self {
        Self {
            low: value as u32,
            high: (value >> 32) as u32,
        }
    }

    /// Full 64-bit value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        ((self.high as u64) << 32) | self.low as u64
    }

    /// 48-bit counter value: `(high & 0xFFFF) << 32 | low`
    #[inline]
    pub const fn counter_value(self) -> u64 {
        (((self.high & COUNTER_HIGH_MASK) as u64) << 32) | self.low as u64
    }
}

// ============================================================================
// Control Register Layouts
// ============================================================================

bitflags! {
    /// IA32_FIXED_CTR_CTRL: four bits per fixed counter
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FixedCtrCtrl: u32 {
        const CTR0_OS = 1 << 0;
        const CTR0_USR = 1 << 1;
        const CTR0_ANY = 1 << 2;
        const CTR0_PMI = 1 << 3;
        const CTR1_OS = 1 << 4;
        const CTR1_USR = 1 << 5;
        const CTR1_ANY = 1 << 6;
        const CTR1_PMI = 1 << 7;
        const CTR2_OS = 1 << 8;
        const CTR2_USR = 1 << 9;
        const CTR2_ANY = 1 << 10;
        const CTR2_PMI = 1 << 11;
    }
}

impl FixedCtrCtrl {
    /// All three fixed counters count user mode only (0x222)
    pub const USER_ONLY: FixedCtrCtrl = FixedCtrCtrl::CTR0_USR
        .union(FixedCtrCtrl::CTR1_USR)
        .union(FixedCtrCtrl::CTR2_USR);

    /// User mode only, fixed counter 0 raises a PMI on overflow (0x22A)
    pub const USER_ONLY_CTR0_PMI: FixedCtrCtrl =
        FixedCtrCtrl::USER_ONLY.union(FixedCtrCtrl::CTR0_PMI);
}

bitflags! {
    /// IA32_PERF_GLOBAL_CTRL enable bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalCtrl: u64 {
        const PMC0 = 1 << 0;
        const PMC1 = 1 << 1;
        const PMC2 = 1 << 2;
        const PMC3 = 1 << 3;
        const FIXED_CTR0 = 1 << 32;
        const FIXED_CTR1 = 1 << 33;
        const FIXED_CTR2 = 1 << 34;
    }
}

impl GlobalCtrl {
    /// The full 3 fixed + 4 programmable bank
    pub const BANK: GlobalCtrl = GlobalCtrl::PMC0
        .union(GlobalCtrl::PMC1)
        .union(GlobalCtrl::PMC2)
        .union(GlobalCtrl::PMC3)
        .union(GlobalCtrl::FIXED_CTR0)
        .union(GlobalCtrl::FIXED_CTR1)
        .union(GlobalCtrl::FIXED_CTR2);
}

bitflags! {
    /// IA32_PERF_GLOBAL_OVF_CTRL clear bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalOvfCtrl: u64 {
        const CLR_PMC0 = 1 << 0;
        const CLR_PMC1 = 1 << 1;
        const CLR_PMC2 = 1 << 2;
        const CLR_PMC3 = 1 << 3;
        const CLR_FIXED_CTR0 = 1 << 32;
        const CLR_FIXED_CTR1 = 1 << 33;
        const CLR_FIXED_CTR2 = 1 << 34;
    }
}

bitflags! {
    /// IA32_PERFEVTSELx flag bits (event and umask occupy bits 0-15)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PerfEvtSel: u32 {
        const USR = 1 << 16;
        const OS = 1 << 17;
        const EDGE = 1 << 18;
        const PC = 1 << 19;
        const INT = 1 << 20;
        const ANY = 1 << 21;
        const EN = 1 << 22;
        const INV = 1 << 23;
    }
}

/// A programmable counter event selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSelector(u32);

impl EventSelector {
    /// Build a selector from event code, unit mask and flags
    pub const fn new(event: u8, umask: u8, flags: PerfEvtSel) -> Self {
        Self(event as u32 | (umask as u32) << 8 | flags.bits())
    }

    /// Take a raw IA32_PERFEVTSELx value as-is
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn event(self) -> u8 {
        self.0 as u8
    }

    pub const fn umask(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn flags(self) -> PerfEvtSel {
        PerfEvtSel::from_bits_truncate(self.0)
    }

    /// Whether the selector turns its counter on at all
    pub fn is_enabled(self) -> bool {
        self.flags().contains(PerfEvtSel::EN)
    }
}

// ============================================================================
// Common Events
// ============================================================================

/// Architectural events counted in user mode
pub mod events {
    use super::{EventSelector, PerfEvtSel};

    const USER: PerfEvtSel = PerfEvtSel::USR.union(PerfEvtSel::EN);

    /// BR_INST_RETIRED.ALL_BRANCHES
    pub const BRANCHES_RETIRED: EventSelector = EventSelector::new(0xC4, 0x00, USER);
    /// BR_MISP_RETIRED.ALL_BRANCHES
    pub const BRANCH_MISSES_RETIRED: EventSelector = EventSelector::new(0xC5, 0x00, USER);
    /// LONGEST_LAT_CACHE.REFERENCE
    pub const LLC_REFERENCES: EventSelector = EventSelector::new(0x2E, 0x4F, USER);
    /// LONGEST_LAT_CACHE.MISS
    pub const LLC_MISSES: EventSelector = EventSelector::new(0x2E, 0x41, USER);
}
