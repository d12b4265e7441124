//! Observable events of a log unit

use std::fmt;

use super::logger::Severity;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    LogFormatted,
    LogMounted,
    LogUnmounted,

    // Recovery
    RecoveryStart,
    RecoveryComplete,

    // Commit path
    /// A commit record landed
    CommitComplete,
    /// An empty commit was started to release reservation
    ForcedCommitDispatched,

    // Roll engine
    RollEngineStart,
    RollEngineStop,
    RollPass,
    LogTrimmed,

    /// The unit entered the error state (FATAL)
    LogError,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::LogFormatted => "LOG_FORMATTED",
            Event::LogMounted => "LOG_MOUNTED",
            Event::LogUnmounted => "LOG_UNMOUNTED",
            Event::RecoveryStart => "RECOVERY_BEGIN",
            Event::RecoveryComplete => "RECOVERY_COMPLETE",
            Event::CommitComplete => "COMMIT_COMPLETE",
            Event::ForcedCommitDispatched => "FORCED_COMMIT_DISPATCHED",
            Event::RollEngineStart => "ROLL_ENGINE_START",
            Event::RollEngineStop => "ROLL_ENGINE_STOP",
            Event::RollPass => "ROLL_PASS",
            Event::LogTrimmed => "LOG_TRIMMED",
            Event::LogError => "LOG_ERROR",
        }
    }

    /// Severity the event is logged at.
    pub fn severity(&self) -> Severity {
        match self {
            Event::CommitComplete
            | Event::ForcedCommitDispatched
            | Event::RollPass
            | Event::LogTrimmed => Severity::Trace,
            Event::LogError => Severity::Fatal,
            _ => Severity::Info,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
