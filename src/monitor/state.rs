use std::fmt;
use std::time::{Duration, Instant};

use crate::backend::BackendError;

/// Failures inside this window count toward the threshold
pub const ERROR_WINDOW: Duration = Duration::from_secs(5);
/// Failures within the window that make the monitor give up
pub const ERROR_THRESHOLD: u32 = 3;
/// Delay before reopening a failed transport
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Connection state of one monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorState {
    Disconnected,
    Connecting,
    Connected,
    Paused,
    Error(String),
}

impl MonitorState {
    pub fn is_error(&self) -> bool {
        matches!(self, MonitorState::Error(_))
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Disconnected => write!(f, "Disconnected"),
            MonitorState::Connecting => write!(f, "Connecting..."),
            MonitorState::Connected => write!(f, "Connected"),
            MonitorState::Paused => write!(f, "Paused"),
            MonitorState::Error(reason) => write!(f, "Error: {}", reason),
        }
    }
}

/// Consecutive transport failures inside a sliding window
#[derive(Debug, Default)]
pub struct ErrorTracker {
    count: u32,
    window_start: Option<Instant>,
}

impl ErrorTracker {
    /// Count one failure; returns true once the threshold is reached.
    pub fn record_error(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.duration_since(start) <= ERROR_WINDOW => self.count += 1,
            _ => {
                self.window_start = Some(now);
                self.count = 1;
            }
        }
        self.count >= ERROR_THRESHOLD
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = None;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// What the driver has to do after a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Reopen the transport after the delay
    Retry(Duration),
    /// A retry is already scheduled
    AlreadyRetrying,
    /// Stop monitoring; the caller must restart explicitly
    Halt,
}

/// Reconnect state machine, independent of any transport.
#[derive(Debug)]
pub struct ReconnectMachine {
    state: MonitorState,
    sticky: bool,
    tracker: ErrorTracker,
    retry_pending: bool,
}

impl Default for ReconnectMachine {
    fn default() -> Self {
        Self {
            state: MonitorState::Disconnected,
            sticky: false,
            tracker: ErrorTracker::default(),
            retry_pending: false,
        }
    }
}

impl ReconnectMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Apply a state update. A sticky error only yields to `Connecting`.
    pub fn set_state(&mut self, next: MonitorState) -> bool {
        if self.sticky && self.state.is_error() && next != MonitorState::Connecting {
            tracing::debug!(ignored = %next, "keeping sticky error state");
            return false;
        }
        if next == MonitorState::Connecting {
            self.sticky = false;
        }
        let changed = self.state != next;
        self.state = next;
        changed
    }

    pub fn on_connecting(&mut self) -> bool {
        self.set_state(MonitorState::Connecting)
    }

    /// A snapshot arrived over the transport.
    pub fn on_receive(&mut self) -> bool {
        self.tracker.reset();
        self.set_state(MonitorState::Connected)
    }

    /// Classify a failed transport and decide the next step.
    pub fn on_failure(&mut self, error: &BackendError, now: Instant) -> FailureAction {
        if error.is_fatal() {
            tracing::error!(%error, "monitor stopped on fatal error");
            self.retry_pending = false;
            self.sticky = false;
            self.set_state(MonitorState::Error(error.to_string()));
            self.sticky = error.is_sticky();
            return FailureAction::Halt;
        }

        if self.tracker.record_error(now) {
            tracing::error!(
                %error,
                failures = self.tracker.count(),
                "too many transport failures, giving up"
            );
            self.retry_pending = false;
            self.sticky = false;
            self.set_state(MonitorState::Error(format!(
                "{} failures within {}s: {}",
                self.tracker.count(),
                ERROR_WINDOW.as_secs(),
                error
            )));
            return FailureAction::Halt;
        }

        if self.retry_pending {
            return FailureAction::AlreadyRetrying;
        }
        tracing::warn!(%error, failures = self.tracker.count(), "transport failed, retrying");
        self.retry_pending = true;
        self.set_state(MonitorState::Disconnected);
        FailureAction::Retry(RETRY_BACKOFF)
    }

    /// The scheduled retry fired.
    pub fn on_retry_due(&mut self) -> bool {
        self.retry_pending = false;
        self.on_connecting()
    }

    pub fn on_stop(&mut self) {
        self.retry_pending = false;
        self.tracker.reset();
        self.sticky = false;
        self.state = MonitorState::Paused;
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }
}
