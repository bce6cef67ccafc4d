use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::SinkExt;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info};

use crate::notify::{Broker, NotifyError};

const CHANNEL_CAPACITY: usize = 256;

/// In-process broadcast hub, one channel per topic.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        let sender = self
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a payload. No-op if nobody is listening.
    pub fn send(&self, topic: &str, payload: &str) {
        if let Some(sender) = self.channels.get(topic) {
            let _ = sender.send(payload.to_string());
        }
    }
}

/// Broker backed by a [`NotifyHub`]; always reachable.
pub struct HubBroker {
    hub: Arc<NotifyHub>,
}

impl HubBroker {
    pub fn new(hub: Arc<NotifyHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Broker for HubBroker {
    async fn connect(&mut self) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn send(&mut self, topic: &str, payload: &str) -> Result<(), NotifyError> {
        self.hub.send(topic, payload);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// One line on the TCP broker link.
#[derive(Serialize)]
struct Envelope<'a> {
    topic: &'a str,
    value: &'a str,
}

/// Newline-delimited JSON producer. Connects to the first reachable address.
pub struct TcpBroker {
    addrs: Vec<String>,
    conn: Option<Framed<TcpStream, LinesCodec>>,
}

impl TcpBroker {
    pub fn new(addrs: Vec<String>) -> Self {
        Self { addrs, conn: None }
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn connect(&mut self) -> Result<(), NotifyError> {
        let mut last_err = String::from("no broker addresses configured");
        for addr in &self.addrs {
            match TcpStream::connect(addr.as_str()).await {
                Ok(stream) => {
                    info!(%addr, "connected to broker");
                    self.conn = Some(Framed::new(stream, LinesCodec::new()));
                    return Ok(());
                }
                Err(e) => {
                    debug!(%addr, "broker connect failed: {e}");
                    last_err = format!("{addr}: {e}");
                }
            }
        }
        Err(NotifyError::Unavailable(last_err))
    }

    async fn send(&mut self, topic: &str, payload: &str) -> Result<(), NotifyError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| NotifyError::Unavailable("not connected".into()))?;
        let line = serde_json::to_string(&Envelope { topic, value: payload })
            .map_err(|e| NotifyError::Encode(e.to_string()))?;
        if let Err(e) = conn.send(line).await {
            self.conn = None;
            return Err(NotifyError::Unavailable(e.to_string()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), NotifyError> {
        if let Some(mut conn) = self.conn.take() {
            SinkExt::<String>::close(&mut conn)
                .await
                .map_err(|e| NotifyError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn hub_subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("booking-events");
        hub.send("booking-events", "{}");
        assert_eq!(rx.recv().await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn hub_send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send("nobody", "{}");
    }

    #[tokio::test]
    async fn tcp_broker_writes_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let reader = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = Framed::new(socket, LinesCodec::new());
            lines.next().await.unwrap().unwrap()
        });

        let mut broker = TcpBroker::new(vec!["127.0.0.1:1".into(), addr]);
        broker.connect().await.unwrap();
        broker.send("booking-events", r#"{"owner":"u1"}"#).await.unwrap();
        broker.disconnect().await.unwrap();

        let line = reader.await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["topic"], "booking-events");
        assert_eq!(v["value"], r#"{"owner":"u1"}"#);
    }

    #[tokio::test]
    async fn tcp_broker_send_before_connect_fails() {
        let mut broker = TcpBroker::new(vec![]);
        assert!(matches!(
            broker.send("t", "{}").await,
            Err(NotifyError::Unavailable(_))
        ));
        assert!(matches!(broker.connect().await, Err(NotifyError::Unavailable(_))));
    }
}
