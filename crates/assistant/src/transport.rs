use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

/// Lifecycle and inbound traffic reported by one physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Error(String),
    /// The remote side or the network ended the connection.
    ///
    /// Never reported for a close requested through [`TransportChannel::close`].
    Closed { reason: Option<String> },
}

pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type OutboundSender = mpsc::UnboundedSender<String>;

/// Caller side of one connection attempt.
///
/// Dropping the channel requests an orderly close, same as [`TransportChannel::close`].
pub struct TransportChannel {
    endpoint: String,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: OutboundSender,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct TransportHandle {
    pub channel: TransportChannel,
    pub worker: TransportWorker,
}

impl TransportChannel {
    pub(crate) fn new(
        endpoint: impl Into<String>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        outbound: OutboundSender,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            events,
            outbound,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    pub fn sender(&self) -> OutboundSender {
        self.outbound.clone()
    }

    pub fn close(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Opens physical connections. One call is one attempt; nothing is reused.
pub trait Connector: Send + Sync {
    fn open(&self, endpoint: &str) -> TransportHandle;
}

/// Worker side of a freshly created channel.
pub struct TransportWorkerSide {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub outbound: mpsc::UnboundedReceiver<String>,
    pub cancel: oneshot::Receiver<()>,
}

pub fn make_transport_channel(endpoint: &str) -> (TransportChannel, TransportWorkerSide) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        TransportChannel::new(endpoint, event_rx, outbound_tx, cancel_tx),
        TransportWorkerSide {
            events: event_tx,
            outbound: outbound_rx,
            cancel: cancel_rx,
        },
    )
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_signals_worker_once() {
        let (mut channel, mut worker_side) = make_transport_channel("ws://localhost/ws/lexai");
        assert_eq!(channel.endpoint(), "ws://localhost/ws/lexai");

        assert!(channel.close());
        assert!(!channel.close());
        assert_eq!(worker_side.cancel.try_recv(), Ok(()));
    }

    #[test]
    fn dropping_channel_cancels_worker() {
        let (channel, mut worker_side) = make_transport_channel("ws://localhost/ws/lexai");
        drop(channel);
        assert_eq!(worker_side.cancel.try_recv(), Ok(()));
    }

    #[test]
    fn outbound_sender_reaches_worker() {
        let (mut channel, mut worker_side) = make_transport_channel("ws://localhost/ws/lexai");
        channel.sender().send("frame".to_string()).unwrap();
        assert_eq!(worker_side.outbound.try_recv().unwrap(), "frame");

        worker_side.events.send(TransportEvent::Opened).unwrap();
        assert_eq!(channel.try_recv(), Some(TransportEvent::Opened));
    }
}
