//! Per room-type booking rules.
//!
//! Each variant is a static table of plain functions over a [`Ledger`]. The
//! service picks the table once per operation with [`policy_for`] and never
//! mutates a ledger any other way.
//!
//! | operation           | party                 | default (study, hangout) |
//! |---------------------|-----------------------|--------------------------|
//! | create              | pending               | confirmed                |
//! | cancel (by owner)   | not supported         | owner only               |
//! | approve / decline   | manager               | not supported            |
//! | revoke (manager)    | removes               | removes                  |
//! | reschedule (owner)  | back to pending       | stays confirmed          |

use ulid::Ulid;

use crate::ledger::Ledger;
use crate::model::{Booking, BookingRequest, RoomType, TimeRange};
use crate::service::EngineError;

pub type CreateFn = fn(&mut Ledger, BookingRequest) -> Result<Booking, EngineError>;
pub type CancelFn = fn(&mut Ledger, Ulid, &str) -> Result<Booking, EngineError>;
pub type ReviewFn = fn(&mut Ledger, Ulid) -> Result<Booking, EngineError>;
pub type RescheduleFn = fn(&mut Ledger, Ulid, &str, TimeRange) -> Result<Booking, EngineError>;

pub struct RoomPolicy {
    pub name: &'static str,
    /// New bookings start pending until a manager approves them.
    pub requires_confirmation: bool,
    pub create_booking: CreateFn,
    pub cancel_booking: CancelFn,
    pub approve_booking: ReviewFn,
    pub decline_booking: ReviewFn,
    /// Manager removal with a reason; allowed on every room type.
    pub revoke_booking: ReviewFn,
    pub reschedule_booking: RescheduleFn,
}

pub static PARTY: RoomPolicy = RoomPolicy {
    name: "party",
    requires_confirmation: true,
    create_booking: party::create,
    cancel_booking: party::cancel,
    approve_booking: party::approve,
    decline_booking: party::decline,
    revoke_booking: revoke,
    reschedule_booking: party::reschedule,
};

pub static DEFAULT: RoomPolicy = RoomPolicy {
    name: "default",
    requires_confirmation: false,
    create_booking: default::create,
    cancel_booking: default::cancel,
    approve_booking: default::approve,
    decline_booking: default::decline,
    revoke_booking: revoke,
    reschedule_booking: default::reschedule,
};

pub fn policy_for(room_type: RoomType) -> &'static RoomPolicy {
    match room_type {
        RoomType::Party => &PARTY,
        RoomType::Study | RoomType::Hangout => &DEFAULT,
    }
}

fn insert(ledger: &mut Ledger, request: BookingRequest, confirmed: bool) -> Result<Booking, EngineError> {
    ledger.check_no_conflict(&request.slot, None)?;
    let booking = Booking {
        id: Ulid::new(),
        slot: request.slot,
        user_id: request.user_id,
        user_name: request.user_name,
        confirmed,
    };
    ledger.append(booking).cloned()
}

fn revoke(ledger: &mut Ledger, id: Ulid) -> Result<Booking, EngineError> {
    ledger.remove(id)
}

fn move_owned(
    ledger: &mut Ledger,
    id: Ulid,
    user_id: &str,
    slot: TimeRange,
    confirmed: bool,
) -> Result<Booking, EngineError> {
    let pos = ledger.owned_position(id, user_id)?;
    if ledger.bookings()[pos].slot == slot {
        return Ok(ledger.bookings()[pos].clone());
    }
    ledger.check_no_conflict(&slot, Some(id))?;
    ledger.set_slot(id, slot, confirmed).cloned()
}

mod party {
    use super::*;

    fn unsupported(operation: &'static str) -> EngineError {
        EngineError::NotSupported {
            policy: PARTY.name,
            operation,
        }
    }

    pub(super) fn create(ledger: &mut Ledger, request: BookingRequest) -> Result<Booking, EngineError> {
        insert(ledger, request, false)
    }

    pub(super) fn cancel(_: &mut Ledger, _: Ulid, _: &str) -> Result<Booking, EngineError> {
        Err(unsupported("cancel_booking"))
    }

    pub(super) fn approve(ledger: &mut Ledger, id: Ulid) -> Result<Booking, EngineError> {
        ledger.set_confirmed(id, true).cloned()
    }

    pub(super) fn decline(ledger: &mut Ledger, id: Ulid) -> Result<Booking, EngineError> {
        ledger.remove(id)
    }

    pub(super) fn reschedule(
        ledger: &mut Ledger,
        id: Ulid,
        user_id: &str,
        slot: TimeRange,
    ) -> Result<Booking, EngineError> {
        move_owned(ledger, id, user_id, slot, false)
    }
}

mod default {
    use super::*;

    fn unsupported(operation: &'static str) -> EngineError {
        EngineError::NotSupported {
            policy: DEFAULT.name,
            operation,
        }
    }

    pub(super) fn create(ledger: &mut Ledger, request: BookingRequest) -> Result<Booking, EngineError> {
        insert(ledger, request, true)
    }

    pub(super) fn cancel(ledger: &mut Ledger, id: Ulid, user_id: &str) -> Result<Booking, EngineError> {
        ledger.owned_position(id, user_id)?;
        ledger.remove(id)
    }

    pub(super) fn approve(_: &mut Ledger, _: Ulid) -> Result<Booking, EngineError> {
        Err(unsupported("approve_booking"))
    }

    pub(super) fn decline(_: &mut Ledger, _: Ulid) -> Result<Booking, EngineError> {
        Err(unsupported("decline_booking"))
    }

    pub(super) fn reschedule(
        ledger: &mut Ledger,
        id: Ulid,
        user_id: &str,
        slot: TimeRange,
    ) -> Result<Booking, EngineError> {
        move_owned(ledger, id, user_id, slot, true)
    }
}
