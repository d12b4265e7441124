//! State shared by the coordinator, the roll engine and the unit handle

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{IoEngine, MasterSet};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};

use super::config::LogConfig;
use super::delta_map::DeltaMap;
use super::errors::{LogError, LogResult};
use super::log_map::LogMap;
use super::writer::LogWriter;

type ErrorListener = Box<dyn Fn() + Send + Sync>;

/// Sticky error flag. Once set it stays set until the unit is dropped.
#[derive(Default)]
pub struct ErrorState {
    errored: AtomicBool,
    reason: Mutex<Option<String>>,
    listeners: Mutex<Vec<ErrorListener>>,
}

impl ErrorState {
    pub fn is_set(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record `reason`; returns false if the flag was already set.
    fn set(&self, reason: &str) -> bool {
        let mut stored = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if stored.is_some() {
            return false;
        }
        *stored = Some(reason.to_string());
        self.errored.store(true, Ordering::Release);
        true
    }

    fn notify(&self) {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener();
        }
    }

    /// Run `listener` every time the flag is set.
    pub fn subscribe(&self, listener: ErrorListener) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }
}

impl fmt::Debug for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorState")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Everything one mounted log unit owns.
#[derive(Debug)]
pub struct UnitState {
    pub config: LogConfig,
    pub delta_map: DeltaMap,
    pub log_map: LogMap,
    writer: Mutex<LogWriter>,
    pub masters: MasterSet,
    pub io: Arc<IoEngine>,
    pub metrics: MetricsRegistry,
    error: ErrorState,
}

impl UnitState {
    pub fn new(config: LogConfig, writer: LogWriter, masters: MasterSet, io: Arc<IoEngine>) -> Self {
        let committed_tid = writer.header().next_tid.saturating_sub(1);
        Self {
            delta_map: DeltaMap::new(config.map_block_size),
            log_map: LogMap::new(config.map_block_size, committed_tid),
            writer: Mutex::new(writer),
            masters,
            io,
            metrics: MetricsRegistry::new(),
            error: ErrorState::default(),
            config,
        }
    }

    pub fn writer(&self) -> MutexGuard<'_, LogWriter> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_errored(&self) -> bool {
        self.error.is_set()
    }

    pub fn error_reason(&self) -> Option<String> {
        self.error.reason()
    }

    /// Fail with `SAMWAL_LOG_UNUSABLE` if the unit is in the error state.
    pub fn check(&self) -> LogResult<()> {
        if self.error.is_set() {
            return Err(LogError::unusable(
                self.error.reason().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    /// Put the unit into the error state. Only the first reason is kept.
    pub fn set_error(&self, reason: &str) {
        if self.error.set(reason) {
            log_event_with_fields(Event::LogError, &[("reason", reason)]);
        }
        self.error.notify();
    }

    /// Enter the error state because of `err` and hand it back.
    pub fn fail(&self, err: LogError) -> LogError {
        self.set_error(&err.to_string());
        err
    }

    pub fn on_error(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.error.subscribe(Box::new(listener));
    }
}
