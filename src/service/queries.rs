use ulid::Ulid;

use crate::model::*;

use super::{BookingService, EngineError, SharedRoom};

impl BookingService {
    /// Read-lock every room in turn and clone it. Each room is consistent on
    /// its own; the set as a whole is not a point-in-time snapshot.
    async fn snapshot(&self, keep: impl Fn(&Room) -> bool) -> Vec<Room> {
        let handles: Vec<SharedRoom> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let room = handle.read().await;
            if keep(&room) {
                out.push(room.clone());
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get_room(&self, id: Ulid) -> Result<Room, EngineError> {
        let handle = self.room_handle(&id).ok_or(EngineError::NotFound(id))?;
        let room = handle.read().await.clone();
        Ok(room)
    }

    pub async fn all_rooms(&self) -> Vec<Room> {
        self.snapshot(|_| true).await
    }

    pub async fn rooms_by_type(&self, room_type: RoomType) -> Vec<Room> {
        self.snapshot(|room| room.room_type == room_type).await
    }

    /// Rooms of `room_type` where `slot` would not collide with any booking,
    /// pending ones included.
    pub async fn available_rooms(&self, room_type: RoomType, slot: &TimeRange) -> Vec<Room> {
        self.snapshot(|room| room.room_type == room_type && room.is_free(slot))
            .await
    }

    /// Every booking held by `user_id`, ordered by date then start time.
    pub async fn bookings_by_user(&self, user_id: &str) -> Vec<BookingInfo> {
        let mut out: Vec<BookingInfo> = self
            .snapshot(|room| room.bookings.iter().any(|b| b.user_id == user_id))
            .await
            .into_iter()
            .flat_map(|room| {
                room.bookings
                    .iter()
                    .filter(|b| b.user_id == user_id)
                    .map(|b| BookingInfo::new(&room, b.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| {
            let (x, y) = (&a.booking.slot, &b.booking.slot);
            x.date.cmp(&y.date).then(x.start.cmp(&y.start))
        });
        out
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<BookingInfo, EngineError> {
        let room_id = self
            .booking_rooms
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;
        let handle = self.room_handle(&room_id).ok_or(EngineError::NotFound(booking_id))?;
        let room = handle.read().await;
        let booking = room
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        Ok(BookingInfo::new(&room, booking))
    }
}
