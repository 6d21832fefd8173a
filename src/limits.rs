//! Hard limits. Requests beyond these fail fast with `LimitExceeded`.

pub const MAX_PROPERTIES: usize = 1024;
pub const MAX_PROPERTY_NAME_LEN: usize = 128;
pub const MAX_ROOMS_PER_PROPERTY: usize = 4096;
pub const MAX_ROOM_TITLE_LEN: usize = 255;
pub const MAX_ROOMS_PER_BOOKING: usize = 64;
pub const MAX_GUESTS_PER_BOOKING: usize = 256;
pub const MAX_PERIODS_PER_ITEM: usize = 100_000;

/// Booking text fields; overruns are reported as field violations.
pub const MAX_NOTES_LEN: usize = 500;
pub const MAX_ADJUSTMENT_DESCRIPTION_LEN: usize = 255;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 1 << 20;
