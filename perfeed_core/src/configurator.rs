use crate::handle::{ControlError, CounterHandle, RingBufferRegion};
use crate::mode::CounterMode;
use crate::monitor::{FillGauge, OverflowMonitor};
use crate::sys::{LinuxPerf, PerfSys};
use log::{debug, error};
use perf_event_open_sys::bindings as sys;
use perf_event_open_sys::bindings::perf_event_attr;
use std::io;
use thiserror::Error;

/// Sample period used for branch-stack sampling unless configured otherwise.
pub const DEFAULT_SAMPLE_PERIOD: u64 = 100_000;

/// Size of the ring buffer's data area, excluding the control page.
pub const DEFAULT_TRACE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Room still free in the data area when the overflow notification fires.
/// Larger than any branch-stack sample record.
pub const OVERFLOW_HEADROOM_BYTES: usize = 4096;

/// Fill level of a `data_bytes` data area at which the kernel notifies the
/// owner, and at which the buffer counts as overflowed.
pub fn overflow_watermark(data_bytes: usize) -> usize {
    data_bytes
        .saturating_sub(OVERFLOW_HEADROOM_BYTES)
        .max(data_bytes / 2)
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unsupported counter mode: '{0}'")]
    UnsupportedMode(String),
    #[error("Trace buffer of {bytes} bytes is not a power-of-two multiple of the {page_size}-byte page")]
    InvalidBufferSize { bytes: usize, page_size: usize },
    #[error("Failed to open {mode} counter for pid {pid}: {source}")]
    Open {
        mode: CounterMode,
        pid: libc::pid_t,
        #[source]
        source: io::Error,
    },
    #[error("Failed to map {len}-byte trace buffer: {source}")]
    Map {
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to arm overflow notification: {0}")]
    Monitor(#[source] io::Error),
    #[error("All overflow monitor slots are in use")]
    MonitorUnavailable,
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Per-process knobs shared by every counter a worker opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSettings {
    pub sample_period: u64,
    pub trace_buffer_bytes: usize,
    pub overflow_signal: libc::c_int,
}

impl Default for CounterSettings {
    fn default() -> Self {
        Self {
            sample_period: DEFAULT_SAMPLE_PERIOD,
            trace_buffer_bytes: DEFAULT_TRACE_BUFFER_BYTES,
            overflow_signal: libc::SIGIO,
        }
    }
}

impl CounterSettings {
    /// The kernel only maps ring buffers of one control page plus 2^n data pages.
    pub fn check_trace_buffer(&self, page_size: usize) -> Result<(), ConfigError> {
        let bytes = self.trace_buffer_bytes;
        if bytes == 0 || bytes % page_size != 0 || !(bytes / page_size).is_power_of_two() {
            return Err(ConfigError::InvalidBufferSize { bytes, page_size });
        }
        Ok(())
    }
}

/// Builds the attribute block for `mode`. Pure; never touches the OS.
pub fn build_attr(
    mode: CounterMode,
    settings: &CounterSettings,
) -> Result<perf_event_attr, ConfigError> {
    let mut attr = perf_event_attr::default();
    attr.size = std::mem::size_of::<perf_event_attr>() as u32;
    attr.set_disabled(1);
    attr.set_exclude_kernel(1);
    attr.set_exclude_hv(1);
    attr.set_exclude_callchain_kernel(1);
    attr.set_pinned(1);
    attr.type_ = sys::PERF_TYPE_HARDWARE as u32;

    match mode {
        CounterMode::Disabled => {
            return Err(ConfigError::UnsupportedMode(mode.to_string()));
        }
        CounterMode::InstructionCount => {
            attr.config = sys::PERF_COUNT_HW_INSTRUCTIONS as u64;
        }
        CounterMode::BranchCount => {
            attr.config = sys::PERF_COUNT_HW_BRANCH_INSTRUCTIONS as u64;
        }
        CounterMode::BranchTrace => {
            attr.config = sys::PERF_COUNT_HW_INSTRUCTIONS as u64;
            attr.sample_type = sys::PERF_SAMPLE_BRANCH_STACK as u64;
            attr.__bindgen_anon_1.sample_period = settings.sample_period;
            attr.branch_sample_type = sys::PERF_SAMPLE_BRANCH_ANY as u64;
            attr.read_format = (sys::PERF_FORMAT_GROUP | sys::PERF_FORMAT_ID) as u64;
            // Notify by fill level, not at the kernel's default of half the buffer.
            attr.set_watermark(1);
            attr.__bindgen_anon_2.wakeup_watermark =
                u32::try_from(overflow_watermark(settings.trace_buffer_bytes)).unwrap_or(u32::MAX);
        }
    }
    Ok(attr)
}

/// Opens, resets and enables a counter of `mode` on `pid` using the real kernel.
///
/// `pid == 0` instruments the calling thread.
pub fn configure(mode: CounterMode, pid: libc::pid_t) -> Result<CounterHandle, ConfigError> {
    configure_with(LinuxPerf, &CounterSettings::default(), mode, pid)
}

/// Like [`configure`], with explicit settings and OS interface.
///
/// Anything allocated before a failing step is released before the error is
/// returned; an unsupported mode or bad buffer size fails before any OS call.
pub fn configure_with<S: PerfSys>(
    sys: S,
    settings: &CounterSettings,
    mode: CounterMode,
    pid: libc::pid_t,
) -> Result<CounterHandle<S>, ConfigError> {
    let mut attr = build_attr(mode, settings)?;
    if mode.uses_ring_buffer() {
        settings.check_trace_buffer(sys.page_size())?;
    }

    debug!("Using {mode} counter for pid {pid}");
    let fd = sys.open(&mut attr, pid).map_err(|source| {
        error!("perf_event_open({mode}, pid={pid}) failed: {source}");
        ConfigError::Open { mode, pid, source }
    })?;

    // From here on, dropping the handle on an early return releases what it owns.
    let mut handle = CounterHandle::new(sys, fd, mode);

    if mode.uses_ring_buffer() {
        let region = RingBufferRegion::map(&handle.sys, fd, settings.trace_buffer_bytes)?;
        let gauge = FillGauge {
            head: region.head_ptr(),
            threshold: overflow_watermark(region.data_len()) as u64,
        };
        handle.region = Some(region);
        let monitor = OverflowMonitor::arm(&handle.sys, fd, settings.overflow_signal, Some(gauge))?;
        handle.monitor = Some(monitor);
    }

    handle.reset()?;
    handle.enable()?;
    Ok(handle)
}
