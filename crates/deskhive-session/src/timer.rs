//! Session countdown timers.
//!
//! A timer is created alongside the session record but only starts counting
//! when the user first looks at their session. All arithmetic is
//! parameterized on a caller-supplied `now_ms` so expiry and extension math
//! can be tested without a clock.

use serde::Serialize;

/// Result of an extension attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended,
    NotStarted,
    LimitReached,
}

/// Countdown state for one session.
#[derive(Debug, Clone)]
pub struct SessionTimer {
    started: bool,
    start_unix_ms: Option<u64>,
    duration_ms: u64,
    extensions_used: u32,
    max_extensions: u32,
}

impl SessionTimer {
    /// A timer that has not started counting yet.
    pub fn fresh(max_extensions: u32) -> Self {
        Self {
            started: false,
            start_unix_ms: None,
            duration_ms: 0,
            extensions_used: 0,
            max_extensions,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn extensions_used(&self) -> u32 {
        self.extensions_used
    }

    pub fn max_extensions(&self) -> u32 {
        self.max_extensions
    }

    /// Starts the countdown. Returns false without touching state when the
    /// timer is already running.
    pub fn start(&mut self, now_ms: u64, duration_ms: u64) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        self.start_unix_ms = Some(now_ms);
        self.duration_ms = duration_ms;
        self.extensions_used = 0;
        true
    }

    /// Clears the countdown without consuming an extension.
    pub fn stop(&mut self) {
        self.started = false;
        self.start_unix_ms = None;
        self.duration_ms = 0;
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        if !self.started {
            return 0;
        }
        let Some(start) = self.start_unix_ms else {
            return 0;
        };
        self.duration_ms
            .saturating_sub(now_ms.saturating_sub(start))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.started && self.remaining_ms(now_ms) == 0
    }

    /// Adds `extension_ms` on top of whatever is left right now. Time already
    /// spent is never handed back: the window is rebased to `now_ms` with the
    /// current remainder plus the increment.
    pub fn extend(&mut self, now_ms: u64, extension_ms: u64) -> ExtendOutcome {
        if !self.started {
            return ExtendOutcome::NotStarted;
        }
        if self.extensions_used >= self.max_extensions {
            return ExtendOutcome::LimitReached;
        }
        let remaining = self.remaining_ms(now_ms);
        self.start_unix_ms = Some(now_ms);
        self.duration_ms = remaining.saturating_add(extension_ms);
        self.extensions_used += 1;
        ExtendOutcome::Extended
    }

    /// Serializable snapshot for status responses.
    pub fn view(&self, now_ms: u64) -> TimerView {
        let remaining_ms = self.remaining_ms(now_ms);
        TimerView {
            active: self.started && remaining_ms > 0,
            expired: self.is_expired(now_ms),
            time_remaining_seconds: remaining_ms / 1_000,
            extensions_used: self.extensions_used,
            max_extensions: self.max_extensions,
        }
    }
}

/// Timer snapshot embedded in session status payloads.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TimerView {
    pub active: bool,
    pub expired: bool,
    pub time_remaining_seconds: u64,
    pub extensions_used: u32,
    pub max_extensions: u32,
}
