use crate::configurator::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which hardware event a counter follows for one target run.
///
/// `Disabled` exists so a run can carry "no counter" through configuration;
/// it is never handed to the OS and `configure` rejects it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum CounterMode {
    #[default]
    Disabled,
    /// Retired instructions, read back as a single scalar.
    InstructionCount,
    /// Retired branch instructions, read back as a single scalar.
    BranchCount,
    /// Sampled branch stacks collected in the counter's ring buffer.
    BranchTrace,
}

impl CounterMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CounterMode::Disabled)
    }

    pub fn uses_ring_buffer(&self) -> bool {
        matches!(self, CounterMode::BranchTrace)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CounterMode::Disabled => "disabled",
            CounterMode::InstructionCount => "instruction-count",
            CounterMode::BranchCount => "branch-count",
            CounterMode::BranchTrace => "branch-trace",
        }
    }
}

impl fmt::Display for CounterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the kebab-case names as well as the short selectors `i`, `b` and `e`.
impl FromStr for CounterMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" | "none" => Ok(CounterMode::Disabled),
            "i" | "instruction-count" | "instructions" => Ok(CounterMode::InstructionCount),
            "b" | "branch-count" | "branches" => Ok(CounterMode::BranchCount),
            "e" | "branch-trace" => Ok(CounterMode::BranchTrace),
            other => Err(ConfigError::UnsupportedMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for CounterMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_selectors_map_to_modes() {
        assert_eq!("i".parse::<CounterMode>().unwrap(), CounterMode::InstructionCount);
        assert_eq!("b".parse::<CounterMode>().unwrap(), CounterMode::BranchCount);
        assert_eq!("e".parse::<CounterMode>().unwrap(), CounterMode::BranchTrace);
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for mode in [
            CounterMode::Disabled,
            CounterMode::InstructionCount,
            CounterMode::BranchCount,
            CounterMode::BranchTrace,
        ] {
            assert_eq!(
                mode.to_string().parse::<CounterMode>().unwrap(),
                mode,
                "{mode} should parse back to itself"
            );
        }
    }

    #[test]
    fn unknown_selector_is_unsupported() {
        match "x".parse::<CounterMode>() {
            Err(ConfigError::UnsupportedMode(sel)) => assert_eq!(sel, "x"),
            other => panic!("Expected UnsupportedMode, got {other:?}"),
        }
    }

    #[test]
    fn only_trace_mode_needs_a_ring_buffer() {
        assert!(CounterMode::BranchTrace.uses_ring_buffer());
        assert!(!CounterMode::BranchCount.uses_ring_buffer());
        assert!(!CounterMode::Disabled.is_enabled());
    }
}
