//! Overflow notification for branch-trace counters.
//!
//! The kernel raises the configured signal on the thread that armed the counter
//! once the ring buffer has filled to its wakeup watermark. It also raises it
//! for other wakeups, such as the target exiting, so the handler only records an
//! overflow after checking that the buffer's `data_head` has reached the slot's
//! threshold. All of it is atomic loads and one store; nothing else is safe in
//! signal context. Slots live in a fixed static table; a handle claims one when
//! armed and gives it back when released.

use crate::configurator::ConfigError;
use crate::sys::PerfSys;
use log::debug;
use std::fmt;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering};

/// Upper bound on trace counters armed at the same time in one process.
pub const MAX_ARMED_MONITORS: usize = 256;

const VACANT: RawFd = -1;
// Held while a claim fills in the slot, so the handler never sees it half set.
const CLAIMING: RawFd = -2;

/// Where the kernel publishes how much it has written, and how much counts as full.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FillGauge {
    /// The control page's `data_head`. Must stay mapped while the monitor lives.
    pub head: NonNull<u64>,
    pub threshold: u64,
}

struct OverflowSlot {
    fd: AtomicI32,
    signal: AtomicI32,
    head: AtomicPtr<u64>,
    threshold: AtomicU64,
    triggered: AtomicBool,
}

impl OverflowSlot {
    const fn vacant() -> Self {
        Self {
            fd: AtomicI32::new(VACANT),
            signal: AtomicI32::new(0),
            head: AtomicPtr::new(ptr::null_mut()),
            threshold: AtomicU64::new(0),
            triggered: AtomicBool::new(false),
        }
    }

    /// Whether the watched buffer has reached its threshold. Without a gauge
    /// every notification counts.
    fn is_full(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            return true;
        }
        // SAFETY: the gauge points at an 8-aligned `data_head` that stays mapped
        // until the slot is vacated, and vacating clears `fd` first.
        let written = unsafe { AtomicU64::from_ptr(head) }.load(Ordering::Acquire);
        written >= self.threshold.load(Ordering::Acquire)
    }
}

pub(crate) struct SlotTable([OverflowSlot; MAX_ARMED_MONITORS]);

impl SlotTable {
    pub(crate) const fn new() -> Self {
        Self([const { OverflowSlot::vacant() }; MAX_ARMED_MONITORS])
    }

    fn claim(
        &'static self,
        fd: RawFd,
        signal: libc::c_int,
        gauge: Option<FillGauge>,
    ) -> Option<OverflowMonitor> {
        self.0.iter().find_map(|slot| {
            slot.fd
                .compare_exchange(VACANT, CLAIMING, Ordering::AcqRel, Ordering::Acquire)
                .ok()?;
            slot.triggered.store(false, Ordering::Release);
            slot.signal.store(signal, Ordering::Release);
            let (head, threshold) = match gauge {
                Some(g) => (g.head.as_ptr(), g.threshold),
                None => (ptr::null_mut(), 0),
            };
            slot.head.store(head, Ordering::Release);
            slot.threshold.store(threshold, Ordering::Release);
            slot.fd.store(fd, Ordering::Release);
            Some(OverflowMonitor { slot, fd, signal })
        })
    }
}

static SLOTS: SlotTable = SlotTable::new();

/// Leading fields of `siginfo_t` for `SIGPOLL`-style signals.
#[repr(C)]
struct SigPollInfo {
    si_signo: libc::c_int,
    si_errno: libc::c_int,
    si_code: libc::c_int,
    si_band: libc::c_long,
    si_fd: libc::c_int,
}

pub(crate) extern "C" fn on_overflow(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    if info.is_null() {
        return;
    }
    // SAFETY: the kernel fills the SIGPOLL layout for signals routed with F_SETSIG.
    let fd = unsafe { (*info.cast::<SigPollInfo>()).si_fd };
    for slot in &SLOTS.0 {
        if slot.fd.load(Ordering::Acquire) == fd && slot.signal.load(Ordering::Acquire) == signum
        {
            if slot.is_full() {
                slot.triggered.store(true, Ordering::Release);
            }
            return;
        }
    }
}

/// The overflow flag of one armed counter. `Armed` until a notification finds
/// the buffer full, then `Triggered` until the handle is released.
pub struct OverflowMonitor {
    slot: &'static OverflowSlot,
    fd: RawFd,
    signal: libc::c_int,
}

impl OverflowMonitor {
    pub(crate) fn arm<S: PerfSys>(
        sys: &S,
        fd: RawFd,
        signal: libc::c_int,
        gauge: Option<FillGauge>,
    ) -> Result<Self, ConfigError> {
        Self::arm_in(&SLOTS, sys, fd, signal, gauge)
    }

    fn arm_in<S: PerfSys>(
        table: &'static SlotTable,
        sys: &S,
        fd: RawFd,
        signal: libc::c_int,
        gauge: Option<FillGauge>,
    ) -> Result<Self, ConfigError> {
        let monitor = table
            .claim(fd, signal, gauge)
            .ok_or(ConfigError::MonitorUnavailable)?;
        sys.install_overflow_handler(signal, on_overflow)
            .map_err(ConfigError::Monitor)?;
        sys.route_overflow_signal(fd, signal)
            .map_err(ConfigError::Monitor)?;
        debug!("Armed overflow notification for fd {fd} on signal {signal}");
        Ok(monitor)
    }

    pub fn has_overflowed(&self) -> bool {
        self.slot.triggered.load(Ordering::Acquire)
    }

    /// Marks the buffer as overflowed, exactly as the signal handler would.
    pub fn trigger(&self) {
        self.slot.triggered.store(true, Ordering::Release);
    }

    pub fn signal(&self) -> libc::c_int {
        self.signal
    }
}

impl Drop for OverflowMonitor {
    fn drop(&mut self) {
        // Unmatchable first; the gauge may be unmapped right after this.
        self.slot.fd.store(CLAIMING, Ordering::Release);
        self.slot.head.store(ptr::null_mut(), Ordering::Release);
        self.slot.signal.store(0, Ordering::Release);
        self.slot.triggered.store(false, Ordering::Release);
        self.slot.fd.store(VACANT, Ordering::Release);
    }
}

impl fmt::Debug for OverflowMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverflowMonitor")
            .field("fd", &self.fd)
            .field("signal", &self.signal)
            .field("overflowed", &self.has_overflowed())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::deliver;
    use super::*;
    use crate::sys::mock::{MockCall, MockPerf};

    // Descriptors here never collide with the mock's, which start at 10_000.

    #[test]
    fn handler_sets_only_the_matching_flag() {
        let sys = MockPerf::new();
        let watched = OverflowMonitor::arm(&sys, 501, libc::SIGIO, None).unwrap();
        let other = OverflowMonitor::arm(&sys, 502, libc::SIGIO, None).unwrap();

        deliver(libc::SIGIO, 501);
        assert!(watched.has_overflowed(), "matching fd should trigger");
        assert!(!other.has_overflowed(), "other fd must stay armed");
    }

    #[test]
    fn handler_ignores_other_signals() {
        let sys = MockPerf::new();
        let monitor = OverflowMonitor::arm(&sys, 511, libc::SIGIO, None).unwrap();
        deliver(libc::SIGUSR1, 511);
        assert!(!monitor.has_overflowed());
    }

    #[test]
    fn handler_tolerates_null_info() {
        on_overflow(libc::SIGIO, std::ptr::null_mut(), std::ptr::null_mut());
    }

    #[test]
    fn arming_installs_and_routes_the_signal() {
        let sys = MockPerf::new();
        let monitor = OverflowMonitor::arm(&sys, 521, libc::SIGUSR2, None).unwrap();
        assert_eq!(monitor.signal(), libc::SIGUSR2);
        assert_eq!(
            sys.calls(),
            vec![
                MockCall::InstallHandler(libc::SIGUSR2),
                MockCall::Route(libc::SIGUSR2)
            ]
        );
    }

    #[test]
    fn released_slot_is_rearmed_clean() {
        let sys = MockPerf::new();
        let first = OverflowMonitor::arm(&sys, 531, libc::SIGIO, None).unwrap();
        first.trigger();
        assert!(first.has_overflowed());
        drop(first);

        deliver(libc::SIGIO, 531);
        let second = OverflowMonitor::arm(&sys, 531, libc::SIGIO, None).unwrap();
        assert!(
            !second.has_overflowed(),
            "a fresh arm must start in the Armed state"
        );
    }

    #[test]
    fn wakeup_below_threshold_is_not_an_overflow() {
        let sys = MockPerf::new();
        let mut head: u64 = 100;
        let gauge = FillGauge {
            head: NonNull::from(&mut head),
            threshold: 4096,
        };
        let monitor = OverflowMonitor::arm(&sys, 541, libc::SIGIO, Some(gauge)).unwrap();

        deliver(libc::SIGIO, 541);
        assert!(
            !monitor.has_overflowed(),
            "a wakeup with room left in the buffer must not count as overflow"
        );

        // SAFETY: the handler only reads `head` from this thread.
        unsafe { gauge.head.as_ptr().write(4096) };
        deliver(libc::SIGIO, 541);
        assert!(monitor.has_overflowed(), "a full buffer must trigger");
        drop(monitor);
    }

    #[test]
    fn exhausted_table_reports_monitor_unavailable() {
        static TABLE: SlotTable = SlotTable::new();
        let sys = MockPerf::new();
        let mut armed: Vec<OverflowMonitor> = (0..MAX_ARMED_MONITORS as RawFd)
            .map(|i| OverflowMonitor::arm_in(&TABLE, &sys, 600 + i, libc::SIGIO, None).unwrap())
            .collect();

        let overflow_fd = 600 + MAX_ARMED_MONITORS as RawFd;
        assert!(matches!(
            OverflowMonitor::arm_in(&TABLE, &sys, overflow_fd, libc::SIGIO, None),
            Err(ConfigError::MonitorUnavailable)
        ));
        let installs_before = sys.state.borrow().count(|c| matches!(c, MockCall::InstallHandler(_)));
        assert_eq!(
            installs_before, MAX_ARMED_MONITORS,
            "a failed claim must not touch the OS"
        );

        armed.pop();
        let reused = OverflowMonitor::arm_in(&TABLE, &sys, overflow_fd, libc::SIGIO, None)
            .expect("a released slot should be claimable again");
        assert!(!reused.has_overflowed());
    }
}
