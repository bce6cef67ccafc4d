use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_DATE_LEN;
use crate::service::EngineError;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Time of day as minutes since midnight. Renders as zero-padded `HH:MM`.
///
/// `24:00` is accepted so a booking may run to the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid time of day '{s}': expected HH:MM"))?;
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if h.is_empty() || h.len() > 2 || m.len() != 2 || !digits(h) || !digits(m) {
            return Err(format!("invalid time of day '{s}': expected HH:MM"));
        }
        let hours: u16 = h
            .parse()
            .map_err(|_| format!("invalid hour in '{s}'"))?;
        let minutes: u16 = m
            .parse()
            .map_err(|_| format!("invalid minute in '{s}'"))?;
        if minutes >= 60 {
            return Err(format!("invalid minute in '{s}'"));
        }
        TimeOfDay::from_minutes(hours * 60 + minutes)
            .ok_or_else(|| format!("time of day '{s}' is past 24:00"))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Half-open window `[start, end)` on one calendar date.
///
/// The date is kept exactly as the caller sent it (`MM-DD` or ISO); two ranges
/// only interact when their date strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub date: String,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeRange {
    pub fn new(date: impl Into<String>, start: TimeOfDay, end: TimeOfDay) -> Result<Self, EngineError> {
        let date = date.into();
        if date.trim().is_empty() {
            return Err(EngineError::InvalidInput("date must not be empty".into()));
        }
        if date.len() > MAX_DATE_LEN {
            return Err(EngineError::LimitExceeded("date too long"));
        }
        if start >= end {
            return Err(EngineError::InvalidInput(format!(
                "start {start} must be before end {end}"
            )));
        }
        Ok(Self { date, start, end })
    }

    /// Parse `HH:MM` strings and validate the window.
    pub fn parse(date: &str, start: &str, end: &str) -> Result<Self, EngineError> {
        let start: TimeOfDay = start.parse().map_err(EngineError::InvalidInput)?;
        let end: TimeOfDay = end.parse().map_err(EngineError::InvalidInput)?;
        Self::new(date, start, end)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.date == other.date && self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}-{}", self.date, self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Party,
    Study,
    Hangout,
}

impl RoomType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomType::Party => "party",
            RoomType::Study => "study",
            RoomType::Hangout => "hangout",
        }
    }
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "party" => Ok(RoomType::Party),
            "study" => Ok(RoomType::Study),
            "hangout" => Ok(RoomType::Hangout),
            other => Err(EngineError::InvalidInput(format!("unknown room type '{other}'"))),
        }
    }
}

/// A reserved window embedded in its room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub slot: TimeRange,
    pub user_id: String,
    pub user_name: String,
    pub confirmed: bool,
}

/// A bookable room. Bookings are kept in creation order, not time order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub room_type: RoomType,
    pub bookings: Vec<Booking>,
}

impl Room {
    pub fn new(id: Ulid, name: String, room_type: RoomType) -> Self {
        Self {
            id,
            name,
            room_type,
            bookings: Vec::new(),
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// True when no booking (pending or confirmed) overlaps `slot`.
    pub fn is_free(&self, slot: &TimeRange) -> bool {
        !self.bookings.iter().any(|b| b.slot.overlaps(slot))
    }
}

/// What a caller asks for when creating a booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub user_id: String,
    pub user_name: String,
    pub slot: TimeRange,
}

/// WAL record. Rooms are persisted as whole documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomSaved { room: Room },
    RoomDeleted { id: Ulid },
}

// ── Query result types ───────────────────────────────────────────

/// A booking together with the room that holds (or held) it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingInfo {
    pub room_id: Ulid,
    pub room_name: String,
    pub room_type: RoomType,
    pub booking: Booking,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BookingInfo {
    pub fn new(room: &Room, booking: Booking) -> Self {
        Self {
            room_id: room.id,
            room_name: room.name.clone(),
            room_type: room.room_type,
            booking,
            reason: None,
        }
    }
}
