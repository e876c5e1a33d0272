//! Connected/disconnected status of the prediction endpoint
//!
//! A failure only flips the status once the last success is older than the
//! grace window, so a single dropped probe does not make the UI flicker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Caption for the tagging button
    pub fn action_label(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "Generate Tags",
            ConnectionStatus::Disconnected => "Connect",
        }
    }

    /// Warning shown next to the button
    pub fn notice(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "Manually review tags",
            ConnectionStatus::Disconnected => "Not connected to AI endpoint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    last_success: Option<Instant>,
    last_success_at: Option<DateTime<Utc>>,
}

/// Tracks endpoint health from probe and predict outcomes.
///
/// Driven by the AI client; hosts only read it or subscribe to transitions.
#[derive(Debug)]
pub struct ConnectionTracker {
    grace: Duration,
    inner: Mutex<Inner>,
    status: watch::Sender<ConnectionStatus>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_WINDOW)
    }
}

impl ConnectionTracker {
    pub fn new(grace: Duration) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            grace,
            inner: Mutex::new(Inner::default()),
            status,
        }
    }

    pub fn grace_window(&self) -> Duration {
        self.grace
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.last_success = Some(now);
        inner.last_success_at = Some(Utc::now());
        self.status.send_if_modified(|status| {
            if status.is_connected() {
                false
            } else {
                debug!("Endpoint connected");
                *status = ConnectionStatus::Connected;
                true
            }
        });
    }

    /// Record a failed attempt and return the resulting status
    pub fn record_failure(&self) -> ConnectionStatus {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> ConnectionStatus {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match inner.last_success {
            Some(last) => now.saturating_duration_since(last) > self.grace,
            None => true,
        };

        if expired {
            self.status.send_if_modified(|status| {
                if status.is_connected() {
                    debug!("Endpoint disconnected");
                    *status = ConnectionStatus::Disconnected;
                    true
                } else {
                    false
                }
            });
        }

        *self.status.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        ConnectionState {
            status: self.status(),
            last_success_at: inner.last_success_at,
        }
    }

    /// Receiver that wakes on every connect/disconnect transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn label(&self) -> &'static str {
        self.status().action_label()
    }
}
