//! Hand-off of decoded captures to the consumer queue

use tokio::sync::{mpsc, watch};

/// How a hand-off ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Forward {
    Sent,
    /// The receiver is gone
    Closed,
    /// Shutdown was signalled while the queue was full
    Shutdown,
}

/// Send `item` to the consumer, waiting for queue space only until shutdown
/// is signalled. A dropped shutdown sender counts as a signal.
pub(crate) async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    shutdown: &mut watch::Receiver<bool>,
) -> Forward {
    tokio::select! {
        sent = tx.send(item) => match sent {
            Ok(()) => Forward::Sent,
            Err(_) => Forward::Closed,
        },
        _ = shutdown.wait_for(|stop| *stop) => Forward::Shutdown,
    }
}
