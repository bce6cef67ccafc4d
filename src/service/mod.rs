mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_ROOMS;
use crate::model::*;
use crate::notify::{NotificationEvent, NotificationKind, Notifier};
use crate::observability::{ROOMS_ACTIVE, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedRoom = Arc<RwLock<Room>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL plus the latest durable document of every room, which is
/// exactly what a compacted log must contain.
struct WalWriter {
    wal: Wal,
    documents: HashMap<Ulid, Room>,
}

impl WalWriter {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::RoomSaved { room } => {
                self.documents.insert(room.id, room.clone());
            }
            Event::RoomDeleted { id } => {
                self.documents.remove(id);
            }
        }
    }

    /// Write a batch with a single fsync and answer every sender.
    fn commit_batch(&mut self, batch: &mut Vec<PendingAppend>) {
        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = Instant::now();
        // All or nothing: a failed batch leaves the log at its pre-batch length.
        let result = self.wal.commit(batch.iter().map(|(event, _)| event));
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        for (event, tx) in batch.drain(..) {
            let r = match &result {
                Ok(()) => {
                    self.apply(&event);
                    Ok(())
                }
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }
    }

    fn handle_non_append(&mut self, cmd: WalCommand) {
        match cmd {
            WalCommand::Compact { response } => {
                let events: Vec<Event> = self
                    .documents
                    .values()
                    .map(|room| Event::RoomSaved { room: room.clone() })
                    .collect();
                let _ = response.send(self.wal.compact(&events));
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
            WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
        }
    }
}

/// Background task that owns the WAL. Appends that queue up while a flush is
/// in progress are written together and share one fsync.
async fn wal_writer_loop(mut writer: WalWriter, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                writer.handle_non_append(other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        writer.commit_batch(&mut batch);
        if let Some(other) = deferred {
            writer.handle_non_append(other);
        }
    }
}

/// Orchestrates every booking operation: locks the room, runs its policy over a
/// ledger, persists the whole room, then hands notifications to the notifier.
pub struct BookingService {
    rooms: DashMap<Ulid, SharedRoom>,
    /// Secondary index: booking id → room id.
    booking_rooms: DashMap<Ulid, Ulid>,
    /// Rooms that exist or are being created. Reserved before the WAL write so
    /// concurrent creates cannot overshoot `max_rooms`.
    room_slots: AtomicUsize,
    max_rooms: usize,
    wal_tx: mpsc::Sender<WalCommand>,
    notifier: Arc<Notifier>,
}

impl BookingService {
    /// Replay the WAL at `wal_path` and start its writer task.
    pub fn new(wal_path: PathBuf, notifier: Arc<Notifier>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let mut writer = WalWriter {
            wal,
            documents: HashMap::new(),
        };
        // Last document per room wins.
        for event in &events {
            writer.apply(event);
        }

        let rooms = DashMap::new();
        let booking_rooms = DashMap::new();
        for (id, room) in &writer.documents {
            for booking in &room.bookings {
                booking_rooms.insert(booking.id, *id);
            }
            rooms.insert(*id, Arc::new(RwLock::new(room.clone())));
        }
        metrics::gauge!(ROOMS_ACTIVE).set(rooms.len() as f64);

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(writer, wal_rx));

        Ok(Self {
            room_slots: AtomicUsize::new(rooms.len()),
            max_rooms: MAX_ROOMS,
            rooms,
            booking_rooms,
            wal_tx,
            notifier,
        })
    }

    /// Cap the number of rooms below the built-in limit.
    pub fn with_max_rooms(mut self, max_rooms: usize) -> Self {
        self.max_rooms = max_rooms.min(MAX_ROOMS);
        self
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Claim a slot for a new room, or fail if the service is full.
    pub(super) fn reserve_room_slot(&self) -> Result<(), EngineError> {
        self.room_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.max_rooms).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| EngineError::LimitExceeded("too many rooms"))
    }

    pub(super) fn release_room_slot(&self) {
        self.room_slots.fetch_sub(1, Ordering::AcqRel);
    }

    pub(super) fn room_handle(&self, id: &Ulid) -> Option<SharedRoom> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Lock a room for writing. Fails if it was deleted while we waited.
    pub(super) async fn lock_room(&self, room_id: Ulid) -> Result<OwnedRwLockWriteGuard<Room>, EngineError> {
        let handle = self.room_handle(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = handle.clone().write_owned().await;
        match self.rooms.get(&room_id) {
            Some(current) if Arc::ptr_eq(current.value(), &handle) => Ok(guard),
            _ => Err(EngineError::NotFound(room_id)),
        }
    }

    /// Booking id → locked room that still holds it.
    pub(super) async fn lock_room_of(&self, booking_id: Ulid) -> Result<OwnedRwLockWriteGuard<Room>, EngineError> {
        let room_id = self
            .booking_rooms
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = self.lock_room(room_id).await?;
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok(guard)
    }

    /// Persist `next` as the room's new document, then install it and update the
    /// booking index. The caller holds the room's write lock.
    pub(super) async fn save_room(&self, current: &mut Room, next: Room) -> Result<(), EngineError> {
        self.wal_append(&Event::RoomSaved { room: next.clone() }).await?;
        for old in &current.bookings {
            if next.booking(old.id).is_none() {
                self.booking_rooms.remove(&old.id);
            }
        }
        for booking in &next.bookings {
            self.booking_rooms.insert(booking.id, next.id);
        }
        *current = next;
        Ok(())
    }

    /// Fire-and-forget notification; never awaited by the caller.
    pub(super) fn notify(&self, kind: NotificationKind, info: &BookingInfo) {
        let event = NotificationEvent::for_booking(kind, info, self.notifier.now());
        self.notifier.publish_detached(event);
    }

    // ── Compaction ──────────────────────────────────────────

    /// Rewrite the WAL as one `RoomSaved` per live room.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
