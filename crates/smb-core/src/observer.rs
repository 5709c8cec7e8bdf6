//! Connection lifecycle observation.

use std::fmt;
use std::sync::Arc;

const OBSERVER_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::connection");

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local side closed the connection.
    Closed,
    /// The peer closed the stream between frames.
    EndOfStream,
    /// The stream failed or delivered a malformed frame.
    Transport(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => formatter.write_str("closed locally"),
            Self::EndOfStream => formatter.write_str("peer closed the stream"),
            Self::Transport(detail) => write!(formatter, "transport failure: {detail}"),
        }
    }
}

/// Collaborator notified about connection state changes.
///
/// Each router reports `connected` once when its dispatch loop starts and
/// `disconnected` once when it stops, however many paths race to close it.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionObserver: Send + Sync {
    /// Invoked once the dispatch loop is running.
    fn connected(&self, peer: &str);

    /// Invoked once when the connection ends.
    fn disconnected(&self, peer: &str, reason: &DisconnectReason);
}

impl<T> ConnectionObserver for Arc<T>
where
    T: ConnectionObserver + ?Sized,
{
    fn connected(&self, peer: &str) {
        (**self).connected(peer);
    }

    fn disconnected(&self, peer: &str, reason: &DisconnectReason) {
        (**self).disconnected(peer, reason);
    }
}

/// Default observer that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredConnectionReporter;

impl StructuredConnectionReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ConnectionObserver for StructuredConnectionReporter {
    fn connected(&self, peer: &str) {
        tracing::info!(
            target: OBSERVER_TARGET,
            event = "connected",
            peer,
            "connection established"
        );
    }

    fn disconnected(&self, peer: &str, reason: &DisconnectReason) {
        match reason {
            DisconnectReason::Transport(_) => tracing::warn!(
                target: OBSERVER_TARGET,
                event = "disconnected",
                peer,
                reason = %reason,
                "connection lost"
            ),
            DisconnectReason::Closed | DisconnectReason::EndOfStream => tracing::info!(
                target: OBSERVER_TARGET,
                event = "disconnected",
                peer,
                reason = %reason,
                "connection closed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn arc_wrapped_observers_forward_events() {
        let mut mock = MockConnectionObserver::new();
        mock.expect_connected()
            .withf(|peer| peer == "127.0.0.1:9780")
            .times(1)
            .return_const(());
        mock.expect_disconnected()
            .withf(|peer, reason| peer == "127.0.0.1:9780" && *reason == DisconnectReason::Closed)
            .times(1)
            .return_const(());

        let observer = Arc::new(mock);
        observer.connected("127.0.0.1:9780");
        observer.disconnected("127.0.0.1:9780", &DisconnectReason::Closed);
    }

    #[rstest]
    #[case(DisconnectReason::Closed, "closed locally")]
    #[case(DisconnectReason::EndOfStream, "peer closed the stream")]
    #[case(DisconnectReason::Transport("reset".to_owned()), "transport failure: reset")]
    fn reasons_render_for_logs(#[case] reason: DisconnectReason, #[case] expected: &str) {
        assert_eq!(reason.to_string(), expected);
    }

    #[rstest]
    fn structured_reporter_accepts_every_reason() {
        let reporter = StructuredConnectionReporter::new();
        reporter.connected("peer");
        reporter.disconnected("peer", &DisconnectReason::Transport("reset".to_owned()));
        reporter.disconnected("peer", &DisconnectReason::EndOfStream);
    }
}
