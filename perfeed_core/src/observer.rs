use crate::aggregator::{AnalysisError, ExecutionMetric};
use crate::configurator::{CounterSettings, configure_with};
use crate::executor::ExecutionStatus;
use crate::handle::CounterHandle;
use crate::mode::CounterMode;
use crate::sys::{LinuxPerf, PerfSys};
use anyhow::Context;
use log::warn;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// An `Observer` is a component that monitors the execution of a target program
/// and collects data about that execution.
///
/// Executors call `pre_exec` before the target exists, `on_target` once its pid is
/// known and before it runs, and `post_exec` after it has finished. The data an
/// observer publishes through `serialize_data` is consumed by the engine.
///
/// Observers are driven by a single worker thread and are not required to be
/// `Send`: the counters they own are bound to that thread.
pub trait Observer {
    /// Returns a static string name identifying the observer.
    fn name(&self) -> &'static str;

    /// Called before the target is spawned. Clears leftovers from the previous run.
    fn pre_exec(&mut self) -> Result<(), anyhow::Error>;

    /// Called with the target's pid while it is stopped, before it executes.
    /// `0` means the target runs on the calling thread.
    fn on_target(&mut self, _pid: libc::pid_t) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Called after the target has finished.
    ///
    /// # Arguments
    /// * `status`: how the run ended.
    /// * `target_output`: optional executor-specific data, such as the exit code.
    fn post_exec(
        &mut self,
        status: &ExecutionStatus,
        target_output: Option<&dyn Any>,
    ) -> Result<(), anyhow::Error>;

    /// Resets the internal state of the observer.
    fn reset(&mut self) -> Result<(), anyhow::Error>;

    /// Serializes the data collected during the last execution cycle, if any.
    fn serialize_data(&self) -> Option<Vec<u8>>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An observer that performs no actions and collects no data.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpObserver;

impl Observer for NoOpObserver {
    fn name(&self) -> &'static str {
        "NoOpObserver"
    }

    fn pre_exec(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn post_exec(
        &mut self,
        _status: &ExecutionStatus,
        _target_output: Option<&dyn Any>,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn serialize_data(&self) -> Option<Vec<u8>> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// What `PerfObserver` publishes for one run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct PerfReading {
    pub mode: CounterMode,
    pub metric: ExecutionMetric,
    /// The count is a partial sum from a trace walk that hit a bad record.
    pub suspect: bool,
}

impl PerfReading {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(bytes, bincode::config::standard()).map(|(reading, _)| reading)
    }
}

/// Counts hardware events of one target run with a performance counter.
///
/// The counter is opened in `on_target`, analyzed in `post_exec` when the run
/// finished or crashed, and released without analysis otherwise.
pub struct PerfObserver<S: PerfSys + Clone = LinuxPerf> {
    sys: S,
    mode: CounterMode,
    settings: CounterSettings,
    handle: Option<CounterHandle<S>>,
    last_reading: Option<PerfReading>,
}

impl PerfObserver<LinuxPerf> {
    pub fn new(mode: CounterMode, settings: CounterSettings) -> Self {
        Self::with_sys(LinuxPerf, mode, settings)
    }
}

impl<S: PerfSys + Clone> PerfObserver<S> {
    pub fn with_sys(sys: S, mode: CounterMode, settings: CounterSettings) -> Self {
        Self {
            sys,
            mode,
            settings,
            handle: None,
            last_reading: None,
        }
    }

    pub fn mode(&self) -> CounterMode {
        self.mode
    }

    pub fn last_reading(&self) -> Option<PerfReading> {
        self.last_reading
    }

    fn reading(&self, metric: ExecutionMetric, suspect: bool) -> PerfReading {
        PerfReading {
            mode: self.mode,
            metric,
            suspect,
        }
    }
}

impl<S: PerfSys + Clone + 'static> Observer for PerfObserver<S> {
    fn name(&self) -> &'static str {
        "PerfObserver"
    }

    fn pre_exec(&mut self) -> Result<(), anyhow::Error> {
        self.reset()
    }

    fn on_target(&mut self, pid: libc::pid_t) -> Result<(), anyhow::Error> {
        if !self.mode.is_enabled() {
            return Ok(());
        }
        if let Some(mut stale) = self.handle.take() {
            stale.release();
        }
        let handle = configure_with(self.sys.clone(), &self.settings, self.mode, pid)
            .with_context(|| format!("Failed to set up {} counter for pid {pid}", self.mode))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn post_exec(
        &mut self,
        status: &ExecutionStatus,
        _target_output: Option<&dyn Any>,
    ) -> Result<(), anyhow::Error> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        if !matches!(status, ExecutionStatus::Ok | ExecutionStatus::Crash(_)) {
            // The run never completed; there is nothing worth measuring.
            handle.release();
            return Ok(());
        }

        match handle.analyze() {
            Ok(metric) => {
                self.last_reading = Some(self.reading(metric, false));
                Ok(())
            }
            Err(AnalysisError::ParseError { partial, reason }) => {
                warn!("Keeping suspect partial count {partial}: {reason}");
                self.last_reading = Some(self.reading(ExecutionMetric::Count(partial), true));
                Ok(())
            }
            Err(e) => Err(e).context("Failed to analyze counter"),
        }
    }

    fn reset(&mut self) -> Result<(), anyhow::Error> {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }
        self.last_reading = None;
        Ok(())
    }

    fn serialize_data(&self) -> Option<Vec<u8>> {
        self.last_reading.as_ref().and_then(|r| r.encode().ok())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
