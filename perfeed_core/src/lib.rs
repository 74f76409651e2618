pub mod aggregator;
pub mod config;
pub mod configurator;
pub mod executor;
pub mod handle;
pub mod mode;
pub mod monitor;
pub mod observer;
pub mod reader;
pub mod sys;

pub use aggregator::{AnalysisError, ExecutionMetric};
pub use config::PerfeedConfig;
pub use configurator::{ConfigError, CounterSettings, configure, configure_with};
pub use executor::{CommandExecutor, ExecutionStatus, Executor, InProcessExecutor};
pub use handle::{ControlError, CounterHandle, CounterState};
pub use mode::CounterMode;
pub use monitor::OverflowMonitor;
pub use observer::{NoOpObserver, Observer, PerfObserver, PerfReading};
pub use reader::{RecordError, TraceSummary, parse_branch_trace};
pub use sys::{LinuxPerf, PerfSys, is_perf_supported};
