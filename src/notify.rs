//! Booking status-change events and the client that publishes them.
//!
//! The [`Notifier`] owns the broker link and its connection flag. A send on a
//! link believed to be down reconnects first; a failed send marks the link down
//! so the next call retries the handshake. Every publish is bounded by a
//! timeout and callers only ever log the error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::BookingInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    BookingApproved,
    BookingDeclined,
    BookingCancelled,
}

/// JSON payload published for every status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub notification_type: NotificationKind,
    /// `MM-DD HH:MM` in the notifier's configured offset.
    pub event_time: String,
    /// User the event is addressed to.
    pub owner: String,
    pub message: String,
    /// Booking id.
    #[serde(rename = "sourceID")]
    pub source_id: String,
}

impl NotificationEvent {
    pub fn for_booking(kind: NotificationKind, info: &BookingInfo, at: DateTime<FixedOffset>) -> Self {
        let b = &info.booking;
        let what = format!("{} on {} {}-{}", info.room_name, b.slot.date, b.slot.start, b.slot.end);
        let message = match (kind, &info.reason) {
            (NotificationKind::BookingApproved, _) => format!("Your booking for {what} was approved."),
            (NotificationKind::BookingDeclined, _) => format!("Your booking for {what} was declined."),
            (NotificationKind::BookingCancelled, Some(reason)) => {
                format!("Your booking for {what} was cancelled: {reason}")
            }
            (NotificationKind::BookingCancelled, None) => format!("Your booking for {what} was cancelled."),
        };
        Self {
            notification_type: kind,
            event_time: format_event_time(&at),
            owner: b.user_id.clone(),
            message,
            source_id: b.id.to_string(),
        }
    }
}

pub fn format_event_time(at: &DateTime<FixedOffset>) -> String {
    at.format("%m-%d %H:%M").to_string()
}

#[derive(Debug)]
pub enum NotifyError {
    /// Broker unreachable or the link broke mid-send.
    Unavailable(String),
    Timeout(Duration),
    Encode(String),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Unavailable(e) => write!(f, "broker unavailable: {e}"),
            NotifyError::Timeout(d) => write!(f, "broker did not answer within {}ms", d.as_millis()),
            NotifyError::Encode(e) => write!(f, "cannot encode notification: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// The message channel a [`Notifier`] publishes to.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&mut self) -> Result<(), NotifyError>;
    async fn send(&mut self, topic: &str, payload: &str) -> Result<(), NotifyError>;
    async fn disconnect(&mut self) -> Result<(), NotifyError>;
}

struct Link {
    broker: Box<dyn Broker>,
    connected: bool,
}

pub struct Notifier {
    link: Mutex<Link>,
    topic: String,
    send_timeout: Duration,
    utc_offset: FixedOffset,
}

impl Notifier {
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(3);

    pub fn new(broker: Box<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            link: Mutex::new(Link {
                broker,
                connected: false,
            }),
            topic: topic.into(),
            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
            utc_offset: Utc.fix(),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current time in the configured offset, for event timestamps.
    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.utc_offset)
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.connected
    }

    /// One bounded connection attempt.
    pub async fn connect(&self) -> Result<(), NotifyError> {
        let attempt = async {
            let mut link = self.link.lock().await;
            if !link.connected {
                link.broker.connect().await?;
                link.connected = true;
            }
            Ok::<(), NotifyError>(())
        };
        tokio::time::timeout(self.send_timeout, attempt)
            .await
            .map_err(|_| NotifyError::Timeout(self.send_timeout))?
    }

    /// Startup loop: up to `attempts` tries with a fixed `delay` between them.
    /// Returns whether the link came up; giving up is logged, not fatal.
    pub async fn connect_with_retry(&self, attempts: u32, delay: Duration) -> bool {
        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(()) => {
                    info!(topic = %self.topic, attempt, "notifier connected");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, attempts, "notifier connect failed: {e}");
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        warn!("notifier unavailable after {attempts} attempts; bookings continue without notifications");
        false
    }

    /// Reconnect if needed, then send. Bounded by the send timeout.
    pub async fn publish(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(event).map_err(|e| NotifyError::Encode(e.to_string()))?;
        let result = match tokio::time::timeout(self.send_timeout, self.send_payload(&payload)).await {
            Ok(result) => result,
            Err(_) => {
                // The send was abandoned halfway; trust nothing about the link.
                self.link.lock().await.connected = false;
                Err(NotifyError::Timeout(self.send_timeout))
            }
        };
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => status).increment(1);
        if result.is_ok() {
            debug!(topic = %self.topic, source_id = %event.source_id, "notification sent");
        }
        result
    }

    async fn send_payload(&self, payload: &str) -> Result<(), NotifyError> {
        let mut link = self.link.lock().await;
        if !link.connected {
            info!(topic = %self.topic, "notifier not connected, reconnecting");
            link.broker.connect().await?;
            link.connected = true;
        }
        if let Err(e) = link.broker.send(&self.topic, payload).await {
            link.connected = false;
            return Err(e);
        }
        Ok(())
    }

    /// Publish on a background task. Failures are logged and dropped.
    pub fn publish_detached(self: &Arc<Self>, event: NotificationEvent) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = notifier.publish(&event).await {
                warn!(
                    kind = ?event.notification_type,
                    source_id = %event.source_id,
                    "notification dropped: {e}"
                );
            }
        })
    }

    /// Best-effort disconnect.
    pub async fn shutdown(&self) {
        let mut link = self.link.lock().await;
        if !link.connected {
            return;
        }
        match tokio::time::timeout(self.send_timeout, link.broker.disconnect()).await {
            Ok(Ok(())) => info!("notifier disconnected"),
            Ok(Err(e)) => warn!("notifier disconnect failed: {e}"),
            Err(_) => warn!("notifier disconnect timed out"),
        }
        link.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use ulid::Ulid;

    use crate::broker::{HubBroker, NotifyHub};
    use crate::model::{Booking, RoomType, TimeRange};

    /// Broker double: counts calls, fails the first `fail_connects` connects and
    /// the first `fail_sends` sends.
    #[derive(Clone, Default)]
    struct Flaky {
        connects: Arc<AtomicUsize>,
        sends: Arc<AtomicUsize>,
        fail_connects: usize,
        fail_sends: usize,
        hang: bool,
    }

    #[async_trait]
    impl Broker for Flaky {
        async fn connect(&mut self) -> Result<(), NotifyError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_connects {
                return Err(NotifyError::Unavailable("refused".into()));
            }
            Ok(())
        }

        async fn send(&mut self, _topic: &str, _payload: &str) -> Result<(), NotifyError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_sends {
                return Err(NotifyError::Unavailable("broken pipe".into()));
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    fn info() -> BookingInfo {
        BookingInfo {
            room_id: Ulid::new(),
            room_name: "Party Hall".into(),
            room_type: RoomType::Party,
            booking: Booking {
                id: Ulid::new(),
                slot: TimeRange::parse("07-02", "14:00", "15:00").unwrap(),
                user_id: "u2".into(),
                user_name: "Bo".into(),
                confirmed: true,
            },
            reason: None,
        }
    }

    fn event() -> NotificationEvent {
        let at = FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2024, 7, 2, 9, 5, 0).unwrap();
        NotificationEvent::for_booking(NotificationKind::BookingApproved, &info(), at)
    }

    #[test]
    fn event_json_field_names() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["notificationType"], "BookingApproved");
        assert_eq!(json["eventTime"], "07-02 09:05");
        assert_eq!(json["owner"], "u2");
        assert!(json["sourceID"].is_string());
        assert!(json["message"].as_str().unwrap().contains("approved"));
    }

    #[test]
    fn event_time_uses_configured_offset() {
        let utc = Utc.with_ymd_and_hms(2024, 12, 31, 23, 30, 0).unwrap();
        let plus_two = utc.with_timezone(&FixedOffset::east_opt(2 * 3600).unwrap());
        assert_eq!(format_event_time(&plus_two), "01-01 01:30");
    }

    #[test]
    fn cancel_message_carries_reason() {
        let mut i = info();
        i.reason = Some("maintenance".into());
        let e = NotificationEvent::for_booking(NotificationKind::BookingCancelled, &i, Utc::now().fixed_offset());
        assert!(e.message.ends_with("cancelled: maintenance"));
    }

    #[tokio::test]
    async fn publish_connects_lazily() {
        let broker = Flaky::default();
        let notifier = Notifier::new(Box::new(broker.clone()), "t");
        assert!(!notifier.is_connected().await);

        notifier.publish(&event()).await.unwrap();
        assert!(notifier.is_connected().await);
        assert_eq!(broker.connects.load(Ordering::SeqCst), 1);

        notifier.publish(&event()).await.unwrap();
        assert_eq!(broker.connects.load(Ordering::SeqCst), 1);
        assert_eq!(broker.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_send_forces_reconnect_on_next_publish() {
        let broker = Flaky {
            fail_sends: 1,
            ..Default::default()
        };
        let notifier = Notifier::new(Box::new(broker.clone()), "t");

        assert!(matches!(notifier.publish(&event()).await, Err(NotifyError::Unavailable(_))));
        assert!(!notifier.is_connected().await);

        notifier.publish(&event()).await.unwrap();
        assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hung_send_times_out() {
        let broker = Flaky {
            hang: true,
            ..Default::default()
        };
        let notifier = Notifier::new(Box::new(broker), "t").with_send_timeout(Duration::from_millis(50));
        assert!(matches!(notifier.publish(&event()).await, Err(NotifyError::Timeout(_))));
        assert!(!notifier.is_connected().await);
    }

    #[tokio::test]
    async fn connect_with_retry_is_bounded() {
        let broker = Flaky {
            fail_connects: usize::MAX,
            ..Default::default()
        };
        let notifier = Notifier::new(Box::new(broker.clone()), "t");
        assert!(!notifier.connect_with_retry(5, Duration::from_millis(1)).await);
        assert_eq!(broker.connects.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn connect_with_retry_recovers() {
        let broker = Flaky {
            fail_connects: 2,
            ..Default::default()
        };
        let notifier = Notifier::new(Box::new(broker.clone()), "t");
        assert!(notifier.connect_with_retry(5, Duration::from_millis(1)).await);
        assert_eq!(broker.connects.load(Ordering::SeqCst), 3);
        assert!(notifier.is_connected().await);
    }

    #[tokio::test]
    async fn detached_publish_reaches_hub_subscriber() {
        let hub = Arc::new(NotifyHub::new());
        let mut rx = hub.subscribe("booking-events");
        let notifier = Arc::new(Notifier::new(Box::new(HubBroker::new(hub)), "booking-events"));

        notifier.publish_detached(event()).await.unwrap();
        let payload = rx.recv().await.unwrap();
        let received: NotificationEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(received.notification_type, NotificationKind::BookingApproved);
    }

    #[tokio::test]
    async fn shutdown_marks_disconnected() {
        let notifier = Notifier::new(Box::new(Flaky::default()), "t");
        notifier.connect().await.unwrap();
        notifier.shutdown().await;
        assert!(!notifier.is_connected().await);
    }
}
