//! Environment signals that nudge the manager into recovering early.
//!
//! A desktop or mobile shell forwards "the app is visible again" and "the app
//! has input focus again" into a `tokio::sync::mpsc` channel; see
//! [`ConnectionManager::listen_for_signals`](crate::ConnectionManager::listen_for_signals).

use std::fmt;

/// The application came back to the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentSignal {
    /// The application window or page became visible.
    Visible,
    /// The application regained input focus.
    Focused,
}

impl fmt::Display for EnvironmentSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Visible => f.write_str("visible"),
            Self::Focused => f.write_str("focused"),
        }
    }
}
