//! The discovery source capability and the events sources report.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::error::Result;

/// Which kind of source produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Active gateway/subnet scanner.
    ActiveScan,
    /// Passive trigger listener.
    Trigger,
    /// mDNS service directory listener.
    Directory,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::ActiveScan => "active-scan",
            SourceKind::Trigger => "trigger",
            SourceKind::Directory => "directory",
        };
        f.write_str(name)
    }
}

/// Events reported by discovery sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A candidate headunit endpoint was found.
    Found {
        /// Source that found it.
        source: SourceKind,
        /// The candidate endpoint.
        endpoint: Endpoint,
    },
    /// A source finished one pass (only the active scanner has passes).
    PassComplete {
        /// Source that completed.
        source: SourceKind,
    },
}

/// Channel end sources deliver their events to.
pub type EventSink = mpsc::UnboundedSender<DiscoveryEvent>;

/// A component that observes the network and reports candidate endpoints.
///
/// `start` spawns the source's work on the current tokio runtime and returns
/// once it is running. `stop` may be called from any task, returns without
/// waiting for network timeouts, and guarantees no further events.
pub trait DiscoverySource: Send {
    /// The kind of this source.
    fn kind(&self) -> SourceKind;

    /// Starts the source. Starting a running source is a no-op.
    fn start(&mut self) -> Result<()>;

    /// Stops the source. Idempotent.
    fn stop(&mut self);

    /// Whether the source is currently running.
    fn is_running(&self) -> bool;
}

/// Sends `event` unless the owning source has been cancelled.
pub(crate) fn emit(sink: &EventSink, token: &CancellationToken, event: DiscoveryEvent) {
    if token.is_cancelled() {
        return;
    }
    // A closed receiver means nobody wants discoveries anymore.
    let _ = sink.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_display() {
        assert_eq!(SourceKind::ActiveScan.to_string(), "active-scan");
        assert_eq!(SourceKind::Trigger.to_string(), "trigger");
        assert_eq!(SourceKind::Directory.to_string(), "directory");
    }

    #[test]
    fn test_emit_suppressed_after_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        emit(&tx, &token, DiscoveryEvent::PassComplete { source: SourceKind::ActiveScan });
        token.cancel();
        emit(&tx, &token, DiscoveryEvent::PassComplete { source: SourceKind::ActiveScan });

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
