//! Auto-reconnecting TCP stream channel.
//!
//! Keeps a client connection to a fixed peer alive, reading into a 12 KiB
//! buffer and emitting every read on the received stream. The writer half
//! is shared with `send`; while the connection is down sends report
//! `NoConnection`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Channel, ChannelMetrics, MetricsHandle, Payload, ReceivedBus, SendResult};

const READ_BUFFER: usize = 12 * 1024;

pub struct StreamChannel {
    name: String,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    received: ReceivedBus,
    metrics: MetricsHandle,
    connect_task: JoinHandle<()>,
}

impl StreamChannel {
    /// Start connecting to `addr`; reconnects with `reconnect_delay`
    /// whenever the peer goes away.
    pub fn connect(name: impl Into<String>, addr: String, reconnect_delay: Duration) -> Self {
        let writer: Arc<Mutex<Option<OwnedWriteHalf>>> = Arc::new(Mutex::new(None));
        let received = ReceivedBus::new();
        let metrics = MetricsHandle::new();

        let task_writer = writer.clone();
        let task_received = received.clone();
        let task_metrics = metrics.clone();
        let connect_task = tokio::spawn(async move {
            loop {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        debug!(peer = %addr, "stream connected");
                        let (mut read_half, write_half) = stream.into_split();
                        *task_writer.lock() = Some(write_half);
                        let mut buffer = vec![0u8; READ_BUFFER];
                        loop {
                            match read_half.read(&mut buffer).await {
                                Ok(0) => break,
                                Ok(len) => {
                                    task_metrics.record_received(len);
                                    task_received.emit(Payload::Bytes(buffer[..len].to_vec()));
                                }
                                Err(err) => {
                                    warn!(peer = %addr, error = %err, "stream read failed");
                                    break;
                                }
                            }
                        }
                        task_writer.lock().take();
                    }
                    Err(err) => {
                        debug!(peer = %addr, error = %err, "stream connect failed");
                    }
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        });

        Self {
            name: name.into(),
            writer,
            received,
            metrics,
            connect_task,
        }
    }
}

#[async_trait::async_trait]
impl Channel for StreamChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: Payload) -> SendResult {
        // Take the writer out so the await below holds no lock.
        let mut writer = match self.writer.lock().take() {
            Some(writer) => writer,
            None => {
                self.metrics.record_failed("not connected");
                return SendResult::NoConnection;
            }
        };
        let bytes = payload.as_bytes();
        match writer.write_all(bytes).await {
            Ok(()) => {
                self.metrics.record_sent(bytes.len());
                *self.writer.lock() = Some(writer);
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
        self.connect_task.abort();
        self.writer.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reads_surface_on_received_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let channel = StreamChannel::connect("tap", addr, Duration::from_millis(100));
        let mut received = channel.received();

        let (mut server, _) = listener.accept().await.unwrap();
        server.write_all(b"pong").await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Payload::Bytes(b"pong".to_vec()));
        channel.close().await;
    }

    #[tokio::test]
    async fn send_before_connect_is_no_connection() {
        // Connect to a port nothing listens on; the writer never appears.
        let channel = StreamChannel::connect(
            "tap",
            "127.0.0.1:1".to_string(),
            Duration::from_secs(30),
        );
        assert_eq!(channel.send("x".into()).await, SendResult::NoConnection);
        channel.close().await;
    }
}
