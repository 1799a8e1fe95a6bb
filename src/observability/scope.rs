//! Timed observation scopes
//!
//! - `{name}_BEGIN` at TRACE on creation
//! - `{name}_COMPLETE` at INFO with `duration_ms` on `complete`
//! - `{name}_FAILED` at ERROR on `fail`
//! - `{name}_INCOMPLETE` at WARN when dropped without either

use std::time::Instant;

use super::logger::{Logger, Severity};

pub struct ObservationScope {
    name: &'static str,
    fields: Vec<(&'static str, String)>,
    timer: Timer,
    finished: bool,
}

impl ObservationScope {
    pub fn new(name: &'static str) -> Self {
        Self::with_fields(name, &[])
    }

    pub fn with_fields(name: &'static str, fields: &[(&'static str, String)]) -> Self {
        let refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Logger::trace(&format!("{}_BEGIN", name), &refs);
        Self {
            name,
            fields: fields.to_vec(),
            timer: Timer::new(),
            finished: false,
        }
    }

    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    pub fn complete_with_fields(mut self, extra: &[(&str, &str)]) {
        self.finished = true;
        let elapsed = self.timer.elapsed_ms();
        self.emit(Severity::Info, "COMPLETE", extra, &elapsed);
    }

    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        let elapsed = self.timer.elapsed_ms();
        self.emit(Severity::Error, "FAILED", &[("reason", reason)], &elapsed);
    }

    fn emit(&self, severity: Severity, suffix: &str, extra: &[(&str, &str)], elapsed: &str) {
        let mut fields: Vec<(&str, &str)> = self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        fields.extend_from_slice(extra);
        fields.push(("duration_ms", elapsed));
        Logger::log(severity, &format!("{}_{}", self.name, suffix), &fields);
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.finished {
            Logger::warn(
                &format!("{}_INCOMPLETE", self.name),
                &[("reason", "scope dropped without completion")],
            );
        }
    }
}

/// Wall-clock stopwatch.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> String {
        self.start.elapsed().as_millis().to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_lifecycle() {
        let scope = ObservationScope::with_fields("TEST_SCOPE", &[("key", "value".to_string())]);
        scope.complete_with_fields(&[("result", "ok")]);

        ObservationScope::new("TEST_SCOPE").fail("boom");
        drop(ObservationScope::new("TEST_SCOPE"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let ms: u64 = timer.elapsed_ms().parse().unwrap();
        assert!(ms >= 5);
    }
}
