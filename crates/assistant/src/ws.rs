use futures::{SinkExt, StreamExt};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{AssistantError, ConnectSnafu, SocketSnafu};
use crate::transport::{
    Connector, TransportEvent, TransportHandle, TransportWorker, TransportWorkerSide,
    make_transport_channel,
};

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    debug: bool,
}

impl WsConnector {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn emit_error(events: &mpsc::UnboundedSender<TransportEvent>, error: &AssistantError) {
        let _ = events.send(TransportEvent::Error(error.to_string()));
    }

    async fn run_socket_worker(endpoint: String, side: TransportWorkerSide, debug: bool) {
        let TransportWorkerSide {
            events,
            mut outbound,
            mut cancel,
        } = side;

        let connected = tokio::select! {
            biased;
            _ = &mut cancel => {
                tracing::debug!(endpoint = %endpoint, "connection attempt cancelled");
                return;
            }
            result = connect_async(endpoint.as_str()) => result,
        };

        let socket = match connected.context(ConnectSnafu {
            stage: "ws-connect",
            endpoint: endpoint.clone(),
        }) {
            Ok((socket, _response)) => socket,
            Err(error) => {
                tracing::warn!(endpoint = %endpoint, error = ?error, "failed to open websocket");
                Self::emit_error(&events, &error);
                let _ = events.send(TransportEvent::Closed {
                    reason: Some(error.to_string()),
                });
                return;
            }
        };

        tracing::info!(endpoint = %endpoint, "websocket open");
        if events.send(TransportEvent::Opened).is_err() {
            return;
        }

        let (mut sink, mut stream) = socket.split();
        let mut close_reason = None;

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    // Requested close: the owner already dropped interest, report nothing.
                    let _ = sink.send(Message::Close(None)).await;
                    tracing::debug!(endpoint = %endpoint, "websocket closed by client");
                    return;
                }
                outgoing = outbound.recv() => {
                    let Some(text) = outgoing else {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    };
                    if debug {
                        tracing::debug!(endpoint = %endpoint, bytes = text.len(), "sending frame");
                    }
                    let sent = sink
                        .send(Message::text(text))
                        .await
                        .context(SocketSnafu { stage: "ws-send" });
                    if let Err(error) = sent {
                        tracing::warn!(
                            endpoint = %endpoint,
                            error = ?error,
                            "websocket send failed"
                        );
                        Self::emit_error(&events, &error);
                        close_reason = Some(error.to_string());
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let frame = TransportEvent::Frame(text.as_str().to_owned());
                            if events.send(frame).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if events.send(TransportEvent::Frame(text)).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            close_reason = frame.map(|frame| {
                                format!("{} {}", u16::from(frame.code), frame.reason.as_str())
                                    .trim()
                                    .to_string()
                            });
                            tracing::info!(
                                endpoint = %endpoint,
                                reason = ?close_reason,
                                "server closed websocket"
                            );
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(source)) => {
                            let error = AssistantError::Socket {
                                stage: "ws-receive",
                                source,
                            };
                            tracing::warn!(
                                endpoint = %endpoint,
                                error = ?error,
                                "websocket receive failed"
                            );
                            Self::emit_error(&events, &error);
                            close_reason = Some(error.to_string());
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = events.send(TransportEvent::Closed {
            reason: close_reason,
        });
    }
}

impl Connector for WsConnector {
    fn open(&self, endpoint: &str) -> TransportHandle {
        let (channel, side) = make_transport_channel(endpoint);
        let worker: TransportWorker = Box::pin(Self::run_socket_worker(
            endpoint.to_string(),
            side,
            self.debug,
        ));
        TransportHandle { channel, worker }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_url_fails_without_network() {
        let connector = WsConnector::new(true);
        let TransportHandle {
            mut channel,
            worker,
        } = connector.open("not a url");
        tokio::spawn(worker);

        assert_eq!(
            channel.recv().await,
            Some(TransportEvent::Error("WebSocket connection error".to_string()))
        );
        assert!(matches!(
            channel.recv().await,
            Some(TransportEvent::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_before_connect_emits_nothing() {
        let connector = WsConnector::default();
        let TransportHandle {
            mut channel,
            worker,
        } = connector.open("ws://127.0.0.1:9/ws/lexai");
        assert!(channel.close());
        worker.await;

        assert_eq!(channel.try_recv(), None);
    }
}
