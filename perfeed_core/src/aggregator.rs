use crate::handle::{ControlError, CounterHandle, CounterState};
use crate::mode::CounterMode;
use crate::reader::{self, RecordError};
use crate::sys::PerfSys;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// The result of one analyzed run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMetric {
    Count(u64),
    /// The trace buffer overflowed; no count is available. This is not zero.
    Overflowed,
}

impl ExecutionMetric {
    pub fn count(&self) -> Option<u64> {
        match self {
            ExecutionMetric::Count(n) => Some(*n),
            ExecutionMetric::Overflowed => None,
        }
    }
}

impl fmt::Display for ExecutionMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMetric::Count(n) => write!(f, "{n}"),
            ExecutionMetric::Overflowed => f.write_str("overflowed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Failed to read counter value: {0}")]
    ReadError(#[source] io::Error),
    #[error("Branch trace parse stopped after {partial} branches: {reason}")]
    ParseError {
        /// Branches summed before the bad record. Suspect, but not discarded.
        partial: u64,
        #[source]
        reason: RecordError,
    },
    #[error("Failed to stop counter before reading it: {0}")]
    Control(#[from] ControlError),
    #[error("Counter has already been released")]
    Released,
}

impl AnalysisError {
    /// The partial count gathered before a parse stopped, if any.
    pub fn partial_count(&self) -> Option<u64> {
        match self {
            AnalysisError::ParseError { partial, .. } => Some(*partial),
            _ => None,
        }
    }
}

impl<S: PerfSys> CounterHandle<S> {
    /// Disables the counter, produces the run's metric and releases the handle.
    ///
    /// The descriptor and any mapping are released before this returns, whatever
    /// the outcome.
    pub fn analyze(&mut self) -> Result<ExecutionMetric, AnalysisError> {
        if self.state == CounterState::Released {
            return Err(AnalysisError::Released);
        }
        let outcome = self.collect();
        if outcome.is_ok() {
            self.state = CounterState::Analyzed;
        }
        self.release();

        if let Ok(metric) = &outcome {
            info!("Executed {metric} {} ({})", self.unit(), self.mode);
        }
        outcome
    }

    fn unit(&self) -> &'static str {
        match self.mode {
            CounterMode::InstructionCount => "instructions",
            _ => "branch instructions",
        }
    }

    fn collect(&mut self) -> Result<ExecutionMetric, AnalysisError> {
        self.disable()?;
        match self.mode {
            CounterMode::InstructionCount | CounterMode::BranchCount => {
                self.read_scalar().map(ExecutionMetric::Count)
            }
            CounterMode::BranchTrace => self.collect_trace(),
            // Never opened; nothing was counted.
            CounterMode::Disabled => Ok(ExecutionMetric::Count(0)),
        }
    }

    fn read_scalar(&mut self) -> Result<u64, AnalysisError> {
        let fd = self.fd.ok_or(AnalysisError::Released)?;
        let mut raw = [0u8; 8];
        let n = self.sys.read(fd, &mut raw).map_err(|e| {
            error!("read(fd={fd}) failed: {e}");
            AnalysisError::ReadError(e)
        })?;
        if n != raw.len() {
            error!("read(fd={fd}) returned {n} of {} bytes", raw.len());
            return Err(AnalysisError::ReadError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: {n} of {} bytes", raw.len()),
            )));
        }
        Ok(u64::from_ne_bytes(raw))
    }

    fn collect_trace(&mut self) -> Result<ExecutionMetric, AnalysisError> {
        if self.has_overflowed() {
            warn!("Branch trace buffer has overflowed");
            return Ok(ExecutionMetric::Overflowed);
        }
        let region = self.region.as_ref().ok_or(AnalysisError::Released)?;
        let Some(records) = region.records() else {
            warn!(
                "Branch trace control page is corrupt (data_head {} > {} data bytes)",
                region.data_head(),
                region.data_len()
            );
            return Ok(ExecutionMetric::Overflowed);
        };

        let summary = reader::parse_branch_trace(records);
        match summary.stopped {
            None => Ok(ExecutionMetric::Count(summary.branches)),
            Some(reason) => Err(AnalysisError::ParseError {
                partial: summary.branches,
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurator::{CounterSettings, DEFAULT_TRACE_BUFFER_BYTES, configure_with};
    use crate::monitor::testing::deliver;
    use crate::reader::testing::{record, user_sample};
    use crate::sys::ControlRequest;
    use crate::sys::mock::{MockCall, MockPerf};

    fn configured(sys: &MockPerf, mode: CounterMode) -> CounterHandle<MockPerf> {
        configure_with(sys.clone(), &CounterSettings::default(), mode, 99).unwrap()
    }

    fn assert_fully_released(sys: &MockPerf) {
        let st = sys.state.borrow();
        assert_eq!(
            st.count(|c| matches!(c, MockCall::Close(_))),
            1,
            "descriptor must be closed exactly once"
        );
        assert_eq!(st.live_mappings(), 0, "no mapping may outlive analyze");
    }

    #[test]
    fn immediate_analyze_yields_zero_for_every_mode() {
        for mode in [
            CounterMode::InstructionCount,
            CounterMode::BranchCount,
            CounterMode::BranchTrace,
        ] {
            let sys = MockPerf::new();
            let mut handle = configured(&sys, mode);
            assert_eq!(
                handle.analyze().unwrap(),
                ExecutionMetric::Count(0),
                "{mode} should report zero with nothing executed"
            );
            assert_eq!(handle.state(), CounterState::Released);
            assert_fully_released(&sys);
        }
    }

    #[test]
    fn counting_mode_reads_the_scalar_after_disabling() {
        let sys = MockPerf::new();
        sys.state.borrow_mut().read_bytes = 1234u64.to_ne_bytes().to_vec();
        let mut handle = configured(&sys, CounterMode::BranchCount);
        handle.disable().unwrap();
        assert_eq!(handle.analyze().unwrap(), ExecutionMetric::Count(1234));

        let calls = sys.calls();
        let disable_at = calls
            .iter()
            .rposition(|c| *c == MockCall::Control(ControlRequest::Disable))
            .unwrap();
        let read_at = calls.iter().position(|c| *c == MockCall::Read).unwrap();
        assert!(disable_at < read_at, "analyze must disable before reading");
    }

    #[test]
    fn short_read_is_a_read_error_and_still_releases() {
        let sys = MockPerf::new();
        sys.state.borrow_mut().read_bytes = vec![1, 2, 3, 4];
        let mut handle = configured(&sys, CounterMode::InstructionCount);
        match handle.analyze() {
            Err(AnalysisError::ReadError(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof)
            }
            other => panic!("Expected ReadError, got {other:?}"),
        }
        assert_eq!(handle.state(), CounterState::Released);
        assert_fully_released(&sys);
    }

    #[test]
    fn trace_mode_sums_sample_records() {
        let sys = MockPerf::new();
        let counts = [5u64, 8, 2];
        sys.state.borrow_mut().trace_data = counts.iter().flat_map(|n| user_sample(*n)).collect();
        let mut handle = configured(&sys, CounterMode::BranchTrace);
        assert_eq!(handle.analyze().unwrap(), ExecutionMetric::Count(15));
        assert_fully_released(&sys);
    }

    #[test]
    fn overflow_flag_wins_over_valid_records() {
        let sys = MockPerf::new();
        sys.state.borrow_mut().trace_data = user_sample(10);
        let mut handle = configured(&sys, CounterMode::BranchTrace);
        handle.overflow_monitor().unwrap().trigger();
        assert!(handle.has_overflowed());
        assert_eq!(handle.analyze().unwrap(), ExecutionMetric::Overflowed);
        assert_eq!(ExecutionMetric::Overflowed.count(), None);
        assert_fully_released(&sys);
    }

    #[test]
    fn wakeup_at_target_exit_still_yields_a_count() {
        let sys = MockPerf::new();
        sys.state.borrow_mut().trace_data = user_sample(9);
        let mut handle = configured(&sys, CounterMode::BranchTrace);
        deliver(libc::SIGIO, handle.raw_fd().unwrap());
        assert!(
            !handle.has_overflowed(),
            "a wakeup with most of the buffer free is not an overflow"
        );
        assert_eq!(handle.analyze().unwrap(), ExecutionMetric::Count(9));
    }

    #[test]
    fn notification_on_a_full_buffer_is_an_overflow() {
        let sys = MockPerf::new();
        sys.state.borrow_mut().data_head = Some((DEFAULT_TRACE_BUFFER_BYTES - 100) as u64);
        let mut handle = configured(&sys, CounterMode::BranchTrace);
        deliver(libc::SIGIO, handle.raw_fd().unwrap());
        assert!(handle.has_overflowed());
        assert_eq!(handle.analyze().unwrap(), ExecutionMetric::Overflowed);
        assert_fully_released(&sys);
    }

    #[test]
    fn corrupt_data_head_yields_no_count() {
        let sys = MockPerf::new();
        sys.state.borrow_mut().data_head = Some(u64::MAX);
        let mut handle = configured(&sys, CounterMode::BranchTrace);
        assert_eq!(handle.analyze().unwrap(), ExecutionMetric::Overflowed);
    }

    #[test]
    fn bad_record_returns_partial_sum_as_parse_error() {
        let sys = MockPerf::new();
        let mut data = user_sample(3);
        data.extend(user_sample(4));
        data.extend(record(99, 2, 50));
        sys.state.borrow_mut().trace_data = data;
        let mut handle = configured(&sys, CounterMode::BranchTrace);

        let err = handle.analyze().unwrap_err();
        assert_eq!(err.partial_count(), Some(7));
        assert!(matches!(
            err,
            AnalysisError::ParseError {
                reason: RecordError::UnexpectedType { record_type: 99, .. },
                ..
            }
        ));
        assert_fully_released(&sys);
    }

    #[test]
    fn failed_disable_is_reported_after_cleanup() {
        let sys = MockPerf::new();
        let mut handle = configured(&sys, CounterMode::BranchCount);
        sys.state.borrow_mut().fail_control = Some((ControlRequest::Disable, libc::EIO));
        assert!(matches!(
            handle.analyze(),
            Err(AnalysisError::Control(ControlError::Request { .. }))
        ));
        assert_eq!(sys.state.borrow().count(|c| *c == MockCall::Read), 0);
        assert_fully_released(&sys);
    }

    #[test]
    fn analyze_after_release_is_rejected() {
        let sys = MockPerf::new();
        let mut handle = configured(&sys, CounterMode::BranchCount);
        handle.release();
        assert!(matches!(handle.analyze(), Err(AnalysisError::Released)));
        assert_fully_released(&sys);
    }

    #[test]
    fn second_analyze_is_rejected_without_os_calls() {
        let sys = MockPerf::new();
        let mut handle = configured(&sys, CounterMode::InstructionCount);
        handle.analyze().unwrap();
        let before = sys.calls().len();
        assert!(matches!(handle.analyze(), Err(AnalysisError::Released)));
        assert_eq!(sys.calls().len(), before);
    }
}
