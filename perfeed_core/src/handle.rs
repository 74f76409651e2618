use crate::configurator::ConfigError;
use crate::mode::CounterMode;
use crate::monitor::OverflowMonitor;
use crate::sys::{ControlRequest, LinuxPerf, PerfSys};
use log::{debug, error};
use perf_event_open_sys::bindings::perf_event_mmap_page;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};
use thiserror::Error;

/// Byte offset of `data_head` inside the control page.
pub(crate) const DATA_HEAD_OFFSET: usize = std::mem::offset_of!(perf_event_mmap_page, data_head);

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("{request} failed: {source}")]
    Request {
        request: ControlRequest,
        #[source]
        source: io::Error,
    },
    #[error("Counter has already been released")]
    Released,
}

/// Where a handle is in its per-run lifecycle. `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    Configured,
    Enabled,
    Disabled,
    Analyzed,
    Released,
}

/// The counter's shared buffer: one control page followed by the data area.
pub struct RingBufferRegion {
    base: NonNull<u8>,
    len: usize,
    page_size: usize,
}

impl RingBufferRegion {
    pub(crate) fn map<S: PerfSys>(
        sys: &S,
        fd: RawFd,
        data_bytes: usize,
    ) -> Result<Self, ConfigError> {
        let page_size = sys.page_size();
        let len = page_size + data_bytes.div_ceil(page_size) * page_size;
        let base = sys.map(fd, len).map_err(|source| {
            error!("mmap(fd={fd}, len={len}) failed: {source}");
            ConfigError::Map { len, source }
        })?;
        debug!("Mapped {len}-byte trace buffer for fd {fd}");
        Ok(Self {
            base,
            len,
            page_size,
        })
    }

    /// Total mapped length, control page included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data_len(&self) -> usize {
        self.len - self.page_size
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: `base..base+len` stays mapped until `unmap` consumes `self`.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    /// The whole data area, whether or not the kernel has written to it.
    pub fn data(&self) -> &[u8] {
        &self.bytes()[self.page_size..]
    }

    /// How many bytes the kernel has produced into the data area so far.
    pub fn data_head(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes()[DATA_HEAD_OFFSET..DATA_HEAD_OFFSET + 8]);
        // Pairs with the kernel's store of data_head after writing records.
        fence(Ordering::Acquire);
        u64::from_ne_bytes(raw)
    }

    /// Where the kernel publishes `data_head`, for readers outside this region.
    pub(crate) fn head_ptr(&self) -> NonNull<u64> {
        // SAFETY: the control page is at least `DATA_HEAD_OFFSET + 8` bytes long
        // and page aligned, so the field is in bounds and 8-aligned.
        unsafe { self.base.add(DATA_HEAD_OFFSET).cast::<u64>() }
    }

    /// The written part of the data area, or `None` when `data_head` claims more
    /// than the data area holds.
    ///
    /// The mapping is writable, so the kernel runs the buffer in non-overwrite
    /// mode and stops writing when it is full; a head past the end means the
    /// control page is corrupt, not that records were overwritten.
    pub fn records(&self) -> Option<&[u8]> {
        let head = usize::try_from(self.data_head()).ok()?;
        self.data().get(..head)
    }

    /// # Safety
    /// `sys` must be the implementation that produced this mapping.
    pub(crate) unsafe fn unmap<S: PerfSys>(self, sys: &S) -> io::Result<()> {
        unsafe { sys.unmap(self.base, self.len) }
    }
}

impl fmt::Debug for RingBufferRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBufferRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

/// One open counter for one target run.
///
/// A handle is confined to the worker thread that configured it; the trace
/// buffer and the overflow notification are both bound to that thread.
/// Dropping a handle releases it.
pub struct CounterHandle<S: PerfSys = LinuxPerf> {
    pub(crate) sys: S,
    pub(crate) fd: Option<RawFd>,
    pub(crate) mode: CounterMode,
    pub(crate) region: Option<RingBufferRegion>,
    pub(crate) monitor: Option<OverflowMonitor>,
    pub(crate) state: CounterState,
    _not_send: PhantomData<*const ()>,
}

impl<S: PerfSys> CounterHandle<S> {
    pub(crate) fn new(sys: S, fd: RawFd, mode: CounterMode) -> Self {
        Self {
            sys,
            fd: Some(fd),
            mode,
            region: None,
            monitor: None,
            state: CounterState::Configured,
            _not_send: PhantomData,
        }
    }

    pub fn mode(&self) -> CounterMode {
        self.mode
    }

    pub fn state(&self) -> CounterState {
        self.state
    }

    /// The OS descriptor, until the handle is released.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn region(&self) -> Option<&RingBufferRegion> {
        self.region.as_ref()
    }

    /// Whether the trace buffer overflow notification has fired since configure.
    pub fn has_overflowed(&self) -> bool {
        self.monitor.as_ref().is_some_and(OverflowMonitor::has_overflowed)
    }

    pub fn overflow_monitor(&self) -> Option<&OverflowMonitor> {
        self.monitor.as_ref()
    }

    fn control(&mut self, request: ControlRequest) -> Result<(), ControlError> {
        let fd = self.fd.ok_or(ControlError::Released)?;
        self.sys.control(fd, request).map_err(|source| {
            error!("ioctl(fd={fd}, {request}) failed: {source}");
            ControlError::Request { request, source }
        })
    }

    pub fn reset(&mut self) -> Result<(), ControlError> {
        self.control(ControlRequest::Reset)
    }

    pub fn enable(&mut self) -> Result<(), ControlError> {
        self.control(ControlRequest::Enable)?;
        self.state = CounterState::Enabled;
        Ok(())
    }

    /// Stops counting. On failure the counter may still be running and any
    /// value read afterwards should not be trusted.
    pub fn disable(&mut self) -> Result<(), ControlError> {
        self.control(ControlRequest::Disable)?;
        self.state = CounterState::Disabled;
        Ok(())
    }

    /// Frees the overflow slot, the mapping and the descriptor, in that order.
    /// Calling it again is a no-op.
    pub fn release(&mut self) {
        if self.state == CounterState::Released {
            return;
        }
        // Vacate the slot first so a late signal cannot match a reused descriptor.
        drop(self.monitor.take());
        if let Some(region) = self.region.take() {
            let len = region.len();
            // SAFETY: the region was mapped through `self.sys` and nothing borrows it here.
            if let Err(e) = unsafe { region.unmap(&self.sys) } {
                error!("munmap(len={len}) failed: {e}");
            }
        }
        if let Some(fd) = self.fd.take() {
            if let Err(e) = self.sys.close(fd) {
                error!("close(fd={fd}) failed: {e}");
            }
        }
        self.state = CounterState::Released;
    }
}

impl<S: PerfSys> Drop for CounterHandle<S> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<S: PerfSys> fmt::Debug for CounterHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterHandle")
            .field("fd", &self.fd)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("region", &self.region)
            .field("overflowed", &self.has_overflowed())
            .finish()
    }
}
