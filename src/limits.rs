/// Upper bound on live rooms.
pub const MAX_ROOMS: usize = 10_000;

/// Upper bound on bookings embedded in a single room.
pub const MAX_BOOKINGS_PER_ROOM: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_DATE_LEN: usize = 32;
pub const MAX_REASON_LEN: usize = 1024;

/// Largest request line accepted by the wire protocol, in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
