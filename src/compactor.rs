use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::service::BookingService;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(service: Arc<BookingService>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&service, threshold).await;
    }
}

/// One compactor pass. Returns whether the WAL was rewritten.
pub async fn compact_if_needed(service: &BookingService, threshold: u64) -> bool {
    let appends = service.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not needed");
        return false;
    }
    match service.compact_wal().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::broker::{HubBroker, NotifyHub};
    use crate::model::*;
    use crate::notify::Notifier;
    use crate::wal::Wal;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomdesk_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let hub = Arc::new(NotifyHub::new());
        let notifier = Arc::new(Notifier::new(Box::new(HubBroker::new(hub)), "booking-events"));
        let service = BookingService::new(path.clone(), notifier).unwrap();

        let room = service.create_room("R1".into(), RoomType::Study).await.unwrap();
        for hour in 9..12 {
            let request = BookingRequest {
                user_id: "u1".into(),
                user_name: "Ann".into(),
                slot: TimeRange::parse("07-01", &format!("{hour}:00"), &format!("{hour}:30")).unwrap(),
            };
            service.create_booking(room.id, request).await.unwrap();
        }
        assert_eq!(service.wal_appends_since_compact().await, 4);

        assert!(!compact_if_needed(&service, 5).await);
        assert_eq!(Wal::replay(&path).unwrap().len(), 4);

        assert!(compact_if_needed(&service, 4).await);
        assert_eq!(service.wal_appends_since_compact().await, 0);
        let events = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::RoomSaved { room } if room.bookings.len() == 3));
    }
}
