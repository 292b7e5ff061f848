//! Install and teardown
//!
//! A [`Session`] is the lifetime of the driver's hooks. Installing:
//!
//! 1. Select the kernel profile for the running build
//! 2. Validate the configuration against it
//! 3. Allocate the monitor and its whole sample table
//! 4. Locate and verify the switch routine
//! 5. Publish the monitor, hook the counter vector, detour the switch routine
//!
//! Anything failing in step 5 rolls back what was already done, so a failed
//! install leaves the machine as it was. Teardown runs the other way round
//! and finishes by writing the sample log.

use core::fmt;

use log::{error, info, warn};

use crate::config::{ConfigError, MonitorConfig};
use crate::hal::idt::{HookError, VectorHook};
use crate::hal::{irql, Kirql, PatchAccess, RegisterAccess};
use crate::hook::detour::{DetourError, DetourTargets, SwitchRoutineHook};
use crate::monitor::{self, Monitor, MonitorStats};
use crate::ntstatus::{self, NtStatus};
use crate::perf::csv::{export_samples, OutputError, OutputSink};
use crate::perf::sample::{BufferAllocError, SampleBuffer};
use crate::profile::{self, KernelProfile, OsVersion, ProfileError};

/// The machine a session runs on
pub trait Platform: RegisterAccess + PatchAccess {
    type Output: OutputSink;

    /// Version of the running kernel
    fn kernel_version(&mut self) -> OsVersion;

    /// Address of an exported kernel routine
    fn export_address(&mut self, name: &str) -> Option<usize>;

    fn current_irql(&mut self) -> Kirql;

    /// Create (or truncate) the sample log
    fn create_output(&mut self, path: &str) -> Result<Self::Output, OutputError>;
}

/// The hook entry points and the data they read
///
/// Implemented by the architecture layer, which owns the trampolines and
/// the statics they jump through.
pub trait EntryPoints {
    /// Trampoline installed on the counter vector
    fn counter_event_entry(&self) -> usize;

    /// Trampoline the switch routine is detoured to
    fn swap_context_entry(&self) -> usize;

    /// Store the vector's original handler for the trampoline to chain to
    fn publish_vector_original(&self, original: usize);

    /// Store the detour continuation for the trampoline
    fn publish_detour_targets(&self, targets: DetourTargets);
}

/// Installation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallError {
    Profile(ProfileError),
    Config(ConfigError),
    Buffer(BufferAllocError),
    /// The profile's locator routine is not exported by this kernel
    LocatorNotExported(&'static str),
    Detour(DetourError),
    Hook(HookError),
    /// Another session is live
    AlreadyActive,
}

impl InstallError {
    /// Status returned from driver entry
    pub fn status(&self) -> NtStatus {
        match self {
            InstallError::Profile(_) => ntstatus::STATUS_REVISION_MISMATCH,
            InstallError::Config(_) => ntstatus::STATUS_INVALID_PARAMETER,
            InstallError::Buffer(_) => ntstatus::STATUS_INSUFFICIENT_RESOURCES,
            InstallError::LocatorNotExported(_) => ntstatus::STATUS_PROCEDURE_NOT_FOUND,
            InstallError::Detour(DetourError::AlreadyInstalled) => ntstatus::STATUS_ALREADY_REGISTERED,
            InstallError::Detour(_) => ntstatus::STATUS_NOT_SUPPORTED,
            InstallError::Hook(HookError::AlreadyHooked { .. }) => ntstatus::STATUS_ALREADY_REGISTERED,
            InstallError::Hook(HookError::NoOriginalHandler { .. }) => ntstatus::STATUS_NOT_SUPPORTED,
            InstallError::AlreadyActive => ntstatus::STATUS_ALREADY_REGISTERED,
        }
    }
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallError::Profile(e) => write!(f, "{}", e),
            InstallError::Config(e) => write!(f, "invalid configuration: {}", e),
            InstallError::Buffer(e) => write!(f, "{}", e),
            InstallError::LocatorNotExported(name) => write!(f, "{} is not exported", name),
            InstallError::Detour(e) => write!(f, "switch detour: {}", e),
            InstallError::Hook(e) => write!(f, "vector hook: {}", e),
            InstallError::AlreadyActive => write!(f, "a monitoring session is already active"),
        }
    }
}

impl From<ProfileError> for InstallError {
    fn from(e: ProfileError) -> Self {
        InstallError::Profile(e)
    }
}

impl From<ConfigError> for InstallError {
    fn from(e: ConfigError) -> Self {
        InstallError::Config(e)
    }
}

impl From<BufferAllocError> for InstallError {
    fn from(e: BufferAllocError) -> Self {
        InstallError::Buffer(e)
    }
}

impl From<DetourError> for InstallError {
    fn from(e: DetourError) -> Self {
        InstallError::Detour(e)
    }
}

impl From<HookError> for InstallError {
    fn from(e: HookError) -> Self {
        InstallError::Hook(e)
    }
}

/// What teardown left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub stats: MonitorStats,
    /// Rows written to the log, or why it was not written
    pub export: Result<usize, OutputError>,
}

/// Live hooks on one machine
#[derive(Debug)]
pub struct Session {
    profile: &'static KernelProfile,
    config: MonitorConfig,
    vector: VectorHook,
    detour: SwitchRoutineHook,
}

impl Session {
    /// Install everything, or nothing
    ///
    /// # Safety
    /// `entry` must describe trampolines that stay mapped until
    /// [`teardown`](Self::teardown) returns, and `platform` must be the
    /// machine those trampolines run on.
    pub unsafe fn install<P: Platform, E: EntryPoints>(
        platform: &mut P,
        entry: &E,
        config: MonitorConfig,
    ) -> Result<Self, InstallError> {
        let version = platform.kernel_version();
        let profile = profile::lookup(version)?;
        info!("[HPC] Kernel {} ({})", version, profile.name);

        config.validate(profile.layout.image_name_len)?;
        let monitor = Monitor::new(&config, profile.layout)?;

        let locator = platform
            .export_address(profile.switch.locator)
            .ok_or(InstallError::LocatorNotExported(profile.switch.locator))?;
        let mut detour = SwitchRoutineHook::locate(platform, locator, &profile.switch)?;
        info!("[HPC] Switch routine at {:#x}", detour.routine());

        monitor::publish(monitor).map_err(|_| InstallError::AlreadyActive)?;

        let mut vector = VectorHook::new(config.mode.vector(), entry.counter_event_entry());
        if let Err(e) = vector.install_chained(platform, |original| entry.publish_vector_original(original)) {
            monitor::retract();
            return Err(e.into());
        }

        entry.publish_detour_targets(detour.targets());
        if let Err(e) = detour.install(platform, entry.swap_context_entry()) {
            vector.uninstall(platform);
            monitor::retract();
            return Err(e.into());
        }

        info!(
            "[HPC] Monitoring '{}' on vector {:#x}, {} samples max",
            config.target,
            vector.vector(),
            config.max_samples
        );

        Ok(Self {
            profile,
            config,
            vector,
            detour,
        })
    }

    pub fn profile(&self) -> &'static KernelProfile {
        self.profile
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Remove the hooks, flush the monitor and write the sample log
    ///
    /// Export failures are logged and reported; the hooks are gone either
    /// way.
    ///
    /// # Safety
    /// No thread may still be executing inside the trampolines.
    pub unsafe fn teardown<P: Platform>(mut self, platform: &mut P) -> TeardownReport {
        self.vector.uninstall(platform);
        self.detour.uninstall(platform);

        let Some(mut monitor) = monitor::retract() else {
            warn!("[HPC] Monitor already gone at teardown");
            return TeardownReport {
                stats: MonitorStats::default(),
                export: Ok(0),
            };
        };

        monitor.drain();
        let stats = monitor.stats();
        let (missed_events, missed_switches) = monitor::missed_events();
        info!(
            "[HPC] {} samples, {} dropped, {} switches ({} unidentified), {} missed events, {} missed switches",
            stats.samples_recorded,
            stats.samples_dropped,
            stats.switches,
            stats.identify_failures,
            missed_events,
            missed_switches
        );
        if stats.contract_violations > 0 {
            warn!("[HPC] {} double switch-outs of the target", stats.contract_violations);
        }
        if stats.late_switches > 0 {
            warn!("[HPC] {} target switches after drain", stats.late_switches);
        }

        let samples = monitor.into_samples();
        let export = write_log(platform, self.config.output_path, &samples);
        match export {
            Ok(rows) => info!("[HPC] Wrote {} rows to {}", rows, self.config.output_path),
            Err(e) => error!("[HPC] Sample log not written: {}", e),
        }

        TeardownReport { stats, export }
    }
}

fn write_log<P: Platform>(
    platform: &mut P,
    path: &str,
    samples: &SampleBuffer,
) -> Result<usize, OutputError> {
    let level = platform.current_irql();
    if level != irql::PASSIVE_LEVEL {
        return Err(OutputError::NotPassiveLevel(level));
    }
    let mut output = platform.create_output(path)?;
    export_samples(&mut output, samples)
}
