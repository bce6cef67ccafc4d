use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_ROOM;
use crate::model::{Booking, Room, TimeRange};
use crate::service::EngineError;

/// Working copy of one room's bookings for the duration of a single operation.
///
/// Mutators are crate-private: only room policies change a ledger. Nothing here
/// touches the stored room; the service swaps the result in after persisting it.
#[derive(Debug, Clone)]
pub struct Ledger {
    room_id: Ulid,
    bookings: Vec<Booking>,
    dirty: bool,
}

impl Ledger {
    pub fn for_room(room: &Room) -> Self {
        Self {
            room_id: room.id,
            bookings: room.bookings.clone(),
            dirty: false,
        }
    }

    pub fn room_id(&self) -> Ulid {
        self.room_id
    }

    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    /// Whether any mutator has changed the ledger.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn into_bookings(self) -> Vec<Booking> {
        self.bookings
    }

    pub fn get(&self, id: Ulid) -> Result<&Booking, EngineError> {
        self.bookings
            .iter()
            .find(|b| b.id == id)
            .ok_or(EngineError::NotFound(id))
    }

    /// Fails with the first booking overlapping `slot`, skipping `exclude`.
    pub fn check_no_conflict(&self, slot: &TimeRange, exclude: Option<Ulid>) -> Result<(), EngineError> {
        match self
            .bookings
            .iter()
            .filter(|b| Some(b.id) != exclude)
            .find(|b| b.slot.overlaps(slot))
        {
            Some(existing) => Err(EngineError::Conflict(existing.id)),
            None => Ok(()),
        }
    }

    /// Index of `id`, provided `user_id` made the booking.
    pub fn owned_position(&self, id: Ulid, user_id: &str) -> Result<usize, EngineError> {
        let pos = self.position(id)?;
        if self.bookings[pos].user_id != user_id {
            return Err(EngineError::Forbidden(id));
        }
        Ok(pos)
    }

    fn position(&self, id: Ulid) -> Result<usize, EngineError> {
        self.bookings
            .iter()
            .position(|b| b.id == id)
            .ok_or(EngineError::NotFound(id))
    }

    pub(crate) fn append(&mut self, booking: Booking) -> Result<&Booking, EngineError> {
        if self.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        self.bookings.push(booking);
        self.dirty = true;
        Ok(&self.bookings[self.bookings.len() - 1])
    }

    pub(crate) fn set_confirmed(&mut self, id: Ulid, confirmed: bool) -> Result<&Booking, EngineError> {
        let pos = self.position(id)?;
        let booking = &mut self.bookings[pos];
        if booking.confirmed != confirmed {
            booking.confirmed = confirmed;
            self.dirty = true;
        }
        Ok(&self.bookings[pos])
    }

    pub(crate) fn set_slot(&mut self, id: Ulid, slot: TimeRange, confirmed: bool) -> Result<&Booking, EngineError> {
        let pos = self.position(id)?;
        let booking = &mut self.bookings[pos];
        booking.slot = slot;
        booking.confirmed = confirmed;
        self.dirty = true;
        Ok(&self.bookings[pos])
    }

    /// Remove a booking, keeping the creation order of the rest.
    pub(crate) fn remove(&mut self, id: Ulid) -> Result<Booking, EngineError> {
        let pos = self.position(id)?;
        self.dirty = true;
        Ok(self.bookings.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RoomType;

    fn booking(user: &str, date: &str, start: &str, end: &str) -> Booking {
        Booking {
            id: Ulid::new(),
            slot: TimeRange::parse(date, start, end).unwrap(),
            user_id: user.into(),
            user_name: user.to_uppercase(),
            confirmed: true,
        }
    }

    fn room_with(bookings: Vec<Booking>) -> Room {
        let mut room = Room::new(Ulid::new(), "Study Room".into(), RoomType::Study);
        room.bookings = bookings;
        room
    }

    #[test]
    fn fresh_ledger_is_clean() {
        let room = room_with(vec![booking("u1", "07-01", "09:00", "10:00")]);
        let ledger = Ledger::for_room(&room);
        assert_eq!(ledger.room_id(), room.id);
        assert_eq!(ledger.bookings(), room.bookings.as_slice());
        assert!(!ledger.is_dirty());
    }

    #[test]
    fn conflict_reports_existing_booking() {
        let existing = booking("u1", "07-01", "09:00", "10:00");
        let existing_id = existing.id;
        let ledger = Ledger::for_room(&room_with(vec![existing]));

        let slot = TimeRange::parse("07-01", "09:30", "10:30").unwrap();
        match ledger.check_no_conflict(&slot, None) {
            Err(EngineError::Conflict(id)) => assert_eq!(id, existing_id),
            other => panic!("expected conflict, got {other:?}"),
        }
        // Excluding the booking itself clears the conflict
        assert!(ledger.check_no_conflict(&slot, Some(existing_id)).is_ok());
    }

    #[test]
    fn adjacent_and_other_dates_do_not_conflict() {
        let ledger = Ledger::for_room(&room_with(vec![booking("u1", "07-01", "09:00", "10:00")]));
        let after = TimeRange::parse("07-01", "10:00", "11:00").unwrap();
        let before = TimeRange::parse("07-01", "08:00", "09:00").unwrap();
        let other_day = TimeRange::parse("07-02", "09:00", "10:00").unwrap();
        assert!(ledger.check_no_conflict(&after, None).is_ok());
        assert!(ledger.check_no_conflict(&before, None).is_ok());
        assert!(ledger.check_no_conflict(&other_day, None).is_ok());
    }

    #[test]
    fn owned_position_distinguishes_missing_from_foreign() {
        let b = booking("u1", "07-01", "09:00", "10:00");
        let id = b.id;
        let ledger = Ledger::for_room(&room_with(vec![b]));
        assert_eq!(ledger.owned_position(id, "u1").unwrap(), 0);
        assert!(matches!(ledger.owned_position(id, "u2"), Err(EngineError::Forbidden(_))));
        assert!(matches!(
            ledger.owned_position(Ulid::new(), "u1"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn remove_keeps_creation_order() {
        let a = booking("u1", "07-01", "15:00", "16:00");
        let b = booking("u1", "07-01", "09:00", "10:00");
        let c = booking("u1", "07-01", "12:00", "13:00");
        let ids = [a.id, b.id, c.id];
        let mut ledger = Ledger::for_room(&room_with(vec![a, b, c]));

        let removed = ledger.remove(ids[1]).unwrap();
        assert_eq!(removed.id, ids[1]);
        assert!(ledger.is_dirty());
        let left: Vec<Ulid> = ledger.bookings().iter().map(|b| b.id).collect();
        assert_eq!(left, vec![ids[0], ids[2]]);
    }

    #[test]
    fn set_confirmed_to_same_value_stays_clean() {
        let b = booking("u1", "07-01", "09:00", "10:00");
        let id = b.id;
        let mut ledger = Ledger::for_room(&room_with(vec![b]));
        ledger.set_confirmed(id, true).unwrap();
        assert!(!ledger.is_dirty());
        ledger.set_confirmed(id, false).unwrap();
        assert!(ledger.is_dirty());
    }
}
