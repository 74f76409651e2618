//! Thin wrappers over the kernel primitives a counter needs.
//!
//! Everything the counter lifecycle asks of the OS goes through [`PerfSys`], so the
//! lifecycle can run against [`LinuxPerf`] in production and against a recording
//! mock in tests. The arguments mirror `perf_event_open(2)`, `ioctl(2)`, `mmap(2)`
//! and `fcntl(2)` directly; no attempt is made to hide their behaviour.

use log::info;
use perf_event_open_sys::bindings::perf_event_attr;
use perf_event_open_sys::ioctls;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

/// Signature of a `SA_SIGINFO` signal handler.
pub type SignalHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

// Not exported by the libc crate.
const F_SETSIG: libc::c_int = 10;
const F_SETOWN_EX: libc::c_int = 15;
const F_OWNER_TID: libc::c_int = 0;

#[repr(C)]
struct FOwnerEx {
    type_: libc::c_int,
    pid: libc::pid_t,
}

/// The device-control requests issued against an open counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Reset,
    Enable,
    Disable,
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlRequest::Reset => "PERF_EVENT_IOC_RESET",
            ControlRequest::Enable => "PERF_EVENT_IOC_ENABLE",
            ControlRequest::Disable => "PERF_EVENT_IOC_DISABLE",
        })
    }
}

pub trait PerfSys {
    /// Opens a counter for `pid` on any CPU, with no group leader and no flags.
    fn open(&self, attr: &mut perf_event_attr, pid: libc::pid_t) -> io::Result<RawFd>;

    fn control(&self, fd: RawFd, request: ControlRequest) -> io::Result<()>;

    /// One `read(2)` call. Returns the number of bytes actually read.
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Maps `len` bytes of the counter's shared buffer, read-write and shared.
    fn map(&self, fd: RawFd, len: usize) -> io::Result<NonNull<u8>>;

    /// # Safety
    /// `base` and `len` must come from a successful [`PerfSys::map`] on this
    /// implementation that has not been unmapped yet. No reference into the
    /// mapping may outlive this call.
    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Installs `handler` for `signal` with `SA_SIGINFO`.
    fn install_overflow_handler(&self, signal: libc::c_int, handler: SignalHandler)
    -> io::Result<()>;

    /// Routes the descriptor's async notifications to the calling thread as `signal`.
    fn route_overflow_signal(&self, fd: RawFd, signal: libc::c_int) -> io::Result<()>;

    fn close(&self, fd: RawFd) -> io::Result<()>;

    fn page_size(&self) -> usize;
}

fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// The real kernel interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxPerf;

impl PerfSys for LinuxPerf {
    fn open(&self, attr: &mut perf_event_attr, pid: libc::pid_t) -> io::Result<RawFd> {
        check(unsafe { perf_event_open_sys::perf_event_open(attr, pid, -1, -1, 0) })
    }

    fn control(&self, fd: RawFd, request: ControlRequest) -> io::Result<()> {
        let rc = unsafe {
            match request {
                ControlRequest::Reset => ioctls::RESET(fd, 0),
                ControlRequest::Enable => ioctls::ENABLE(fd, 0),
                ControlRequest::Disable => ioctls::DISABLE(fd, 0),
            }
        };
        check(rc).map(|_| ())
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn map(&self, fd: RawFd, len: usize) -> io::Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast()).ok_or_else(|| io::Error::other("mmap returned a null mapping"))
    }

    unsafe fn unmap(&self, base: NonNull<u8>, len: usize) -> io::Result<()> {
        check(unsafe { libc::munmap(base.as_ptr().cast(), len) }).map(|_| ())
    }

    fn install_overflow_handler(
        &self,
        signal: libc::c_int,
        handler: SignalHandler,
    ) -> io::Result<()> {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            check(libc::sigaction(signal, &action, ptr::null_mut())).map(|_| ())
        }
    }

    fn route_overflow_signal(&self, fd: RawFd, signal: libc::c_int) -> io::Result<()> {
        let owner = FOwnerEx {
            type_: F_OWNER_TID,
            pid: unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t,
        };
        unsafe {
            check(libc::fcntl(fd, F_SETOWN_EX, &owner as *const FOwnerEx))?;
            check(libc::fcntl(fd, F_SETSIG, signal))?;
            let flags = check(libc::fcntl(fd, libc::F_GETFL))?;
            check(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_ASYNC))?;
        }
        Ok(())
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        check(unsafe { libc::close(fd) }).map(|_| ())
    }

    fn page_size(&self) -> usize {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        }
    }
}

fn probe_perf_support() -> bool {
    let settings = crate::configurator::CounterSettings::default();
    let mut attr =
        match crate::configurator::build_attr(crate::CounterMode::InstructionCount, &settings) {
            Ok(attr) => attr,
            Err(_) => return false,
        };
    // Pinning and the disabled start are irrelevant to the probe.
    attr.set_pinned(0);
    match LinuxPerf.open(&mut attr, 0) {
        Ok(fd) => {
            let _ = LinuxPerf.close(fd);
            true
        }
        Err(e) => {
            info!("Hardware counters unavailable: {e}");
            false
        }
    }
}

/// Whether this machine lets the calling process open user-space hardware counters.
/// The probe runs once per process.
pub fn is_perf_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(probe_perf_support)
}
