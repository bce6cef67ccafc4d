use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::ledger::Ledger;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationKind;
use crate::observability::ROOMS_ACTIVE;
use crate::policy::{policy_for, RoomPolicy};

use super::{BookingService, EngineError};

fn validate_request(request: &BookingRequest) -> Result<(), EngineError> {
    if request.user_id.is_empty() {
        return Err(EngineError::InvalidInput("user id must not be empty".into()));
    }
    if request.user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    if request.user_name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("user name too long"));
    }
    Ok(())
}

impl BookingService {
    pub async fn create_room(&self, name: String, room_type: RoomType) -> Result<Room, EngineError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::InvalidInput("room name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        self.reserve_room_slot()?;

        let room = Room::new(Ulid::new(), name, room_type);
        if let Err(e) = self.wal_append(&Event::RoomSaved { room: room.clone() }).await {
            self.release_room_slot();
            return Err(e);
        }
        self.rooms.insert(room.id, Arc::new(RwLock::new(room.clone())));
        metrics::gauge!(ROOMS_ACTIVE).set(self.rooms.len() as f64);
        info!(room_id = %room.id, room_type = %room.room_type, "room created");
        Ok(room)
    }

    /// Delete a room and every booking in it. `Ok(false)` if there was no such room.
    pub async fn delete_room(&self, id: Ulid) -> Result<bool, EngineError> {
        let guard = match self.lock_room(id).await {
            Ok(guard) => guard,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.wal_append(&Event::RoomDeleted { id }).await?;
        self.rooms.remove(&id);
        self.release_room_slot();
        for booking in &guard.bookings {
            self.booking_rooms.remove(&booking.id);
        }
        metrics::gauge!(ROOMS_ACTIVE).set(self.rooms.len() as f64);
        info!(room_id = %id, cascaded = guard.bookings.len(), "room deleted");
        Ok(true)
    }

    /// Run one policy operation over a ledger of the locked room and persist
    /// the room if the ledger changed. Returns the operation's output and
    /// whether anything was written.
    async fn apply_policy<T>(
        &self,
        room: &mut Room,
        op: impl FnOnce(&'static RoomPolicy, &mut Ledger) -> Result<T, EngineError>,
    ) -> Result<(T, bool), EngineError> {
        let policy = policy_for(room.room_type);
        let mut ledger = Ledger::for_room(room);
        let out = op(policy, &mut ledger)?;
        if !ledger.is_dirty() {
            return Ok((out, false));
        }
        let next = Room {
            id: room.id,
            name: room.name.clone(),
            room_type: room.room_type,
            bookings: ledger.into_bookings(),
        };
        self.save_room(room, next).await?;
        Ok((out, true))
    }

    pub async fn create_booking(&self, room_id: Ulid, request: BookingRequest) -> Result<Room, EngineError> {
        validate_request(&request)?;
        let mut guard = self.lock_room(room_id).await?;
        let (booking, _) = self
            .apply_policy(&mut guard, |policy, ledger| (policy.create_booking)(ledger, request))
            .await?;
        info!(
            room_id = %room_id,
            booking_id = %booking.id,
            user_id = %booking.user_id,
            slot = %booking.slot,
            confirmed = booking.confirmed,
            "booking created"
        );
        Ok(guard.clone())
    }

    /// Owner cancellation. Whether it is allowed depends on the room's policy.
    pub async fn cancel_booking(&self, room_id: Ulid, booking_id: Ulid, user_id: &str) -> Result<Room, EngineError> {
        let mut guard = self.lock_room(room_id).await?;
        self.apply_policy(&mut guard, |policy, ledger| {
            (policy.cancel_booking)(ledger, booking_id, user_id)
        })
        .await?;
        info!(room_id = %room_id, booking_id = %booking_id, user_id, "booking cancelled by owner");
        Ok(guard.clone())
    }

    /// Move a booking to a new window inside the same room.
    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        user_id: &str,
        slot: TimeRange,
    ) -> Result<Room, EngineError> {
        let mut guard = self.lock_room_of(booking_id).await?;
        let (booking, _) = self
            .apply_policy(&mut guard, |policy, ledger| {
                (policy.reschedule_booking)(ledger, booking_id, user_id, slot)
            })
            .await?;
        info!(
            room_id = %guard.id,
            booking_id = %booking_id,
            slot = %booking.slot,
            confirmed = booking.confirmed,
            "booking rescheduled"
        );
        Ok(guard.clone())
    }

    /// Manager approval. Approving a confirmed booking is a no-op without an event.
    pub async fn approve_booking(&self, booking_id: Ulid) -> Result<BookingInfo, EngineError> {
        let mut guard = self.lock_room_of(booking_id).await?;
        let (booking, changed) = self
            .apply_policy(&mut guard, |policy, ledger| (policy.approve_booking)(ledger, booking_id))
            .await?;
        let info = BookingInfo::new(&guard, booking);
        drop(guard);

        if changed {
            info!(room_id = %info.room_id, booking_id = %booking_id, "booking approved");
            self.notify(NotificationKind::BookingApproved, &info);
        } else {
            debug!(booking_id = %booking_id, "booking already confirmed");
        }
        Ok(info)
    }

    /// Manager decline. The booking is removed.
    pub async fn decline_booking(&self, booking_id: Ulid) -> Result<BookingInfo, EngineError> {
        let mut guard = self.lock_room_of(booking_id).await?;
        let (booking, _) = self
            .apply_policy(&mut guard, |policy, ledger| (policy.decline_booking)(ledger, booking_id))
            .await?;
        let info = BookingInfo::new(&guard, booking);
        drop(guard);

        info!(room_id = %info.room_id, booking_id = %booking_id, "booking declined");
        self.notify(NotificationKind::BookingDeclined, &info);
        Ok(info)
    }

    /// Manager cancellation on any room type. `reason` is passed through as-is.
    pub async fn cancel_booking_with_reason(&self, booking_id: Ulid, reason: String) -> Result<BookingInfo, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let mut guard = self.lock_room_of(booking_id).await?;
        let (booking, _) = self
            .apply_policy(&mut guard, |policy, ledger| (policy.revoke_booking)(ledger, booking_id))
            .await?;
        let mut info = BookingInfo::new(&guard, booking);
        drop(guard);
        info.reason = Some(reason);

        info!(room_id = %info.room_id, booking_id = %booking_id, "booking cancelled by manager");
        self.notify(NotificationKind::BookingCancelled, &info);
        Ok(info)
    }
}
