//! Reconnect scheduling: exponential backoff with jitter.
//!
//! The connection core arms at most one timer at a time; this module only
//! computes delays and carries the configuration and retry context.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a reconnect was (or would be) scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    SocketClose,
    SocketError,
    ConnectError,
    OpenSocketThrow,
    ManualClose,
}

impl ReconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconnectReason::SocketClose => "socket_close",
            ReconnectReason::SocketError => "socket_error",
            ReconnectReason::ConnectError => "connect_error",
            ReconnectReason::OpenSocketThrow => "open_socket_throw",
            ReconnectReason::ManualClose => "manual_close",
        }
    }
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context handed to the `should_retry` predicate before arming a timer.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-based attempt number the timer would carry.
    pub attempt: u32,
    pub reason: ReconnectReason,
    pub error: Option<String>,
}

/// Predicate deciding whether a reconnect timer may be armed.
pub type RetryPredicate = Arc<dyn Fn(&RetryContext) -> bool + Send + Sync>;

/// Reconnect configuration.
#[derive(Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fractional spread applied symmetrically around the base delay, in [0, 1].
    pub jitter_ratio: f64,
    pub should_retry: Option<RetryPredicate>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_ratio: 0.2,
            should_retry: None,
        }
    }
}

impl fmt::Debug for ReconnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectConfig")
            .field("enabled", &self.enabled)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl ReconnectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn with_should_retry(mut self, predicate: RetryPredicate) -> Self {
        self.should_retry = Some(predicate);
        self
    }

    /// Computes the delay for the given 1-based attempt, drawing jitter from
    /// the thread RNG.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let draw = if self.jitter_ratio == 0.0 {
            0.0
        } else {
            rand::thread_rng().gen_range(-1.0..1.0)
        };
        compute_delay(self, attempt, draw)
    }
}

/// Deterministic core of the delay formula; `draw` is the uniform jitter
/// sample in [-1, 1).
pub(crate) fn compute_delay(config: &ReconnectConfig, attempt: u32, draw: f64) -> Duration {
    let initial = config.initial_delay.as_millis() as f64;
    let max = (config.max_delay.as_millis() as f64).max(initial);
    let multiplier = config.multiplier.max(1.0);
    let jitter_ratio = config.jitter_ratio.clamp(0.0, 1.0);

    let exponent = attempt.saturating_sub(1) as i32;
    let base = (initial * multiplier.powi(exponent)).min(max);

    let millis = if jitter_ratio == 0.0 {
        base.floor()
    } else {
        (base * (1.0 + draw * jitter_ratio)).clamp(0.0, max).floor()
    };
    Duration::from_millis(millis as u64)
}
