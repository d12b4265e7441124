//! Begin/complete bracketing for mount and unmount
//!
//! - `{name}_BEGIN` on creation
//! - `{name}_COMPLETE` with `elapsed_ms` when finished
//! - `{name}_FAILED` at ERROR, or FATAL when the error leaves the unit unusable
//! - `{name}_INCOMPLETE` if dropped unfinished (a panic mid-mount)

use std::time::Instant;

use crate::log::LogError;

use super::logger::{Logger, Severity};

/// Brackets one lifecycle step of a log unit.
///
/// ```ignore
/// let scope = ObservationScope::new("MOUNT");
/// match mount_inner() {
///     Ok(unit) => scope.complete_with_fields(&[("next_tid", "7")]),
///     Err(err) => scope.fail(&err),
/// }
/// ```
pub struct ObservationScope<'a> {
    name: &'a str,
    started: Instant,
    finished: bool,
}

impl<'a> ObservationScope<'a> {
    /// Logs `{name}_BEGIN` immediately.
    pub fn new(name: &'a str) -> Self {
        Logger::info(&format!("{}_BEGIN", name), &[]);
        Self {
            name,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Milliseconds since the scope opened.
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    pub fn complete_with_fields(mut self, fields: &[(&str, &str)]) {
        self.finished = true;
        let elapsed = self.elapsed_ms().to_string();
        let mut all: Vec<(&str, &str)> = Vec::with_capacity(fields.len() + 1);
        all.push(("elapsed_ms", &elapsed));
        all.extend(fields.iter().copied());
        Logger::info(&format!("{}_COMPLETE", self.name), &all);
    }

    pub fn fail(mut self, err: &LogError) {
        self.finished = true;
        let severity = if err.is_fatal() {
            Severity::Fatal
        } else {
            Severity::Error
        };
        let elapsed = self.elapsed_ms().to_string();
        let reason = err.to_string();
        Logger::log(
            severity,
            &format!("{}_FAILED", self.name),
            &[
                ("code", err.code().code()),
                ("elapsed_ms", &elapsed),
                ("reason", &reason),
            ],
        );
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for ObservationScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            Logger::warn(
                &format!("{}_INCOMPLETE", self.name),
                &[("reason", "scope dropped without completion")],
            );
        }
    }
}
