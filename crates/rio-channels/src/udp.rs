//! UDP channel.
//!
//! Receive-only (bound port with a recv loop), send-only (remote
//! endpoint), or both. Payloads are raw datagrams; an empty payload is a
//! no-op that reports `Ok`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{Channel, ChannelMetrics, MetricsHandle, Payload, ReceivedBus, SendResult};

const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpChannel {
    name: String,
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
    received: ReceivedBus,
    metrics: MetricsHandle,
    recv_task: Option<JoinHandle<()>>,
}

impl UdpChannel {
    /// Open a channel. `local` binds a port for receiving (starting the
    /// recv loop); `remote` is the destination for sends. At least one of
    /// the two must be given.
    pub async fn open(
        name: impl Into<String>,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> std::io::Result<Self> {
        let bind_addr = local.unwrap_or_else(|| "0.0.0.0:0".parse().expect("static addr"));
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let received = ReceivedBus::new();
        let metrics = MetricsHandle::new();

        let recv_task = if local.is_some() {
            let socket = socket.clone();
            let received = received.clone();
            let metrics = metrics.clone();
            Some(tokio::spawn(async move {
                let mut buffer = vec![0u8; MAX_DATAGRAM];
                loop {
                    match socket.recv_from(&mut buffer).await {
                        Ok((len, _peer)) => {
                            metrics.record_received(len);
                            received.emit(Payload::Bytes(buffer[..len].to_vec()));
                        }
                        Err(err) => {
                            warn!(error = %err, "udp receive failed");
                            break;
                        }
                    }
                }
            }))
        } else {
            None
        };

        Ok(Self {
            name: name.into(),
            socket,
            remote,
            received,
            metrics,
            recv_task,
        })
    }
}

#[async_trait::async_trait]
impl Channel for UdpChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: Payload) -> SendResult {
        if payload.is_empty() {
            return SendResult::Ok;
        }
        let remote = match self.remote {
            Some(remote) => remote,
            None => {
                self.metrics.record_failed("receive-only channel");
                return SendResult::Failed;
            }
        };
        match self.socket.send_to(payload.as_bytes(), remote).await {
            Ok(sent) => {
                self.metrics.record_sent(sent);
                SendResult::Ok
            }
            Err(err) => {
                self.metrics.record_failed(err.to_string());
                SendResult::Failed
            }
        }
    }

    fn received(&self) -> broadcast::Receiver<Payload> {
        self.received.subscribe()
    }

    fn metrics(&self) -> ChannelMetrics {
        self.metrics.snapshot()
    }

    async fn close(&self) {
        if let Some(task) = &self.recv_task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagram_round_trip() {
        let receiver = UdpChannel::open("rx", Some("127.0.0.1:0".parse().unwrap()), None)
            .await
            .unwrap();
        let local = receiver.socket.local_addr().unwrap();
        let sender = UdpChannel::open("tx", None, Some(local)).await.unwrap();

        let mut received = receiver.received();
        assert_eq!(sender.send(Payload::Bytes(vec![1, 2, 3])).await, SendResult::Ok);
        let payload = tokio::time::timeout(std::time::Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Payload::Bytes(vec![1, 2, 3]));
        receiver.close().await;
    }

    #[tokio::test]
    async fn empty_payload_is_a_noop() {
        let sender = UdpChannel::open("tx", None, Some("127.0.0.1:9".parse().unwrap()))
            .await
            .unwrap();
        assert_eq!(sender.send(Payload::Bytes(vec![])).await, SendResult::Ok);
        assert_eq!(sender.metrics().sent, 0);
    }
}
