use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::pricing::amount;

/// Days since 1970-01-01 — the only calendar unit.
pub type Day = i32;

/// Unix milliseconds, used for audit timestamps.
pub type Ms = i64;

/// Half-open day interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySpan {
    pub from: Day,
    pub to: Day,
}

impl DaySpan {
    pub fn new(from: Day, to: Day) -> Self {
        debug_assert!(from < to, "DaySpan from must be before to");
        Self { from, to }
    }

    pub fn nights(&self) -> Day {
        self.to - self.from
    }

    /// A stay ending on the day another begins does not overlap it.
    pub fn overlaps(&self, other: &DaySpan) -> bool {
        !(self.to <= other.from || self.from >= other.to)
    }
}

/// What owns a calendar period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// A room held by a booking.
    BookingRoom,
    /// An owner block closing a room.
    BookingBlock,
}

/// A day range attached to an item (`item_type`, `item_id`) and an owning aggregate.
///
/// `from`/`to` are optional only while a request is being validated; every stored
/// period has a well-formed span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarPeriod {
    pub id: Ulid,
    pub from: Option<Day>,
    pub to: Option<Day>,
    pub item_type: ItemType,
    pub item_id: Ulid,
    pub item_root_id: Option<Ulid>,
    pub season_id: Option<Ulid>,
}

impl CalendarPeriod {
    pub fn span(&self) -> Option<DaySpan> {
        match (self.from, self.to) {
            (Some(from), Some(to)) if from < to => Some(DaySpan { from, to }),
            _ => None,
        }
    }

    /// Number of days covered, if both ends are set.
    pub fn length(&self) -> Option<Day> {
        Some(self.to? - self.from?)
    }

    /// Malformed periods overlap nothing.
    pub fn overlaps(&self, other: &CalendarPeriod) -> bool {
        match (self.span(), other.span()) {
            (Some(a), Some(b)) => a.overlaps(&b),
            _ => false,
        }
    }

    /// True when `day` falls within the period, counting both ends.
    pub fn touches_day(&self, day: Day) -> bool {
        matches!((self.from, self.to), (Some(from), Some(to)) if from <= day && day <= to)
    }
}

/// Every period stored for one item, sorted by `from`.
#[derive(Debug, Clone)]
pub struct ItemCalendar {
    pub item_id: Ulid,
    pub periods: Vec<CalendarPeriod>,
}

impl ItemCalendar {
    pub fn new(item_id: Ulid) -> Self {
        Self {
            item_id,
            periods: Vec::new(),
        }
    }

    pub fn insert(&mut self, period: CalendarPeriod) {
        let pos = self.periods.partition_point(|p| p.from <= period.from);
        self.periods.insert(pos, period);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<CalendarPeriod> {
        let pos = self.periods.iter().position(|p| p.id == id)?;
        Some(self.periods.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&CalendarPeriod> {
        self.periods.iter().find(|p| p.id == *id)
    }

    /// Drop every period of `item_type` owned by `root_id`.
    pub fn remove_owned(&mut self, item_type: ItemType, root_id: Ulid) -> Vec<CalendarPeriod> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.periods)
            .into_iter()
            .partition(|p| p.item_type == item_type && p.item_root_id == Some(root_id));
        self.periods = kept;
        removed
    }

    /// Periods whose span overlaps `query`. Binary search skips everything starting at
    /// or after `query.to`.
    pub fn overlapping(&self, query: &DaySpan) -> impl Iterator<Item = &CalendarPeriod> {
        let right_bound = self.periods.partition_point(|p| p.from < Some(query.to));
        self.periods[..right_bound]
            .iter()
            .filter(move |p| p.to.is_some_and(|to| to > query.from))
    }
}

/// Read-only room record, fed by the room catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub title: String,
    pub max_occupancy: u32,
}

/// Reference to a guest. Extra keys are kept opaque and round-trip untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GuestRef {
    #[serde(default)]
    pub guest_id: Option<Ulid>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl GuestRef {
    pub fn new(guest_id: Ulid) -> Self {
        Self {
            guest_id: Some(guest_id),
            details: serde_json::Map::new(),
        }
    }
}

const STATUS_LABELS: &[(i32, &str)] = &[
    (0, "Inquiry"),
    (1, "Tentative"),
    (2, "Confirmed"),
    (3, "Checked in"),
    (4, "Checked out"),
    (5, "Cancelled"),
    (6, "No show"),
];

/// Opaque status code. No transitions are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingStatus(pub i32);

impl BookingStatus {
    pub fn label(self) -> &'static str {
        STATUS_LABELS
            .iter()
            .find(|(code, _)| *code == self.0)
            .map_or("Unknown", |&(_, label)| label)
    }
}

/// Opaque booking source code (booking channel or owner block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingSource(pub i32);

impl BookingSource {
    pub const OWNER_BLOCK: BookingSource = BookingSource(1);

    /// Source to store for a save: the submitted code, else the one already stored, else
    /// owner block. Code `0` counts as unset.
    pub fn resolve(submitted: Option<BookingSource>, stored: Option<BookingSource>) -> Self {
        submitted
            .filter(|s| s.0 != 0)
            .or(stored)
            .unwrap_or(Self::OWNER_BLOCK)
    }
}

/// Stored monetary fields of a booking. `tax` is a percentage; `add_credit` is stored
/// for billing and never priced.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Charges {
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub room_price: f64,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub room_extras: f64,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub adjustment: f64,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub adjustment_rooms: f64,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub adjustment_extras: f64,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub adjustment_pets: f64,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub adjustment_tax: f64,
    #[serde(default, deserialize_with = "amount::deserialize_optional")]
    pub pets_price: Option<f64>,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub tax: f64,
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub add_credit: f64,
}

/// Binding of a room to a booking for one `BookingRoom` period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAllocation {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub room_id: Ulid,
    pub guests_count: u32,
    pub period_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Booking {
    pub id: Ulid,
    pub status: BookingStatus,
    pub source: BookingSource,
    pub charges: Charges,
    pub guests: Vec<GuestRef>,
    pub rooms: Vec<RoomAllocation>,
    pub user_id: Option<Ulid>,
    pub notes: Option<String>,
    pub adjustment_description: Option<String>,
    pub pets_type: Option<String>,
    pub pets_count: Option<String>,
    /// Day index of the last save.
    pub saved_on: Day,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn status_label(&self) -> &'static str {
        self.status.label()
    }

    pub fn first_guest(&self) -> Option<&GuestRef> {
        self.guests.first()
    }

    pub fn room_ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.rooms.iter().map(|r| r.room_id)
    }

    pub fn to_row(&self) -> Result<BookingRow, serde_json::Error> {
        Ok(BookingRow {
            id: self.id,
            status: self.status,
            source: self.source,
            charges: self.charges,
            guests: serde_json::to_string(&self.guests)?,
            user_id: self.user_id,
            notes: self.notes.clone(),
            adjustment_description: self.adjustment_description.clone(),
            pets_type: self.pets_type.clone(),
            pets_count: self.pets_count.clone(),
            saved_on: self.saved_on,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Persisted form of a booking. `guests` holds the JSON-encoded guest list; allocations
/// are stored beside the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRow {
    pub id: Ulid,
    pub status: BookingStatus,
    pub source: BookingSource,
    pub charges: Charges,
    pub guests: String,
    pub user_id: Option<Ulid>,
    pub notes: Option<String>,
    pub adjustment_description: Option<String>,
    pub pets_type: Option<String>,
    pub pets_count: Option<String>,
    pub saved_on: Day,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl BookingRow {
    pub fn into_booking(self, rooms: Vec<RoomAllocation>) -> Result<Booking, serde_json::Error> {
        Ok(Booking {
            id: self.id,
            status: self.status,
            source: self.source,
            charges: self.charges,
            guests: serde_json::from_str(&self.guests)?,
            rooms,
            user_id: self.user_id,
            notes: self.notes,
            adjustment_description: self.adjustment_description,
            pets_type: self.pets_type,
            pets_count: self.pets_count,
            saved_on: self.saved_on,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// A booking submission, used for both create and update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingRequest {
    #[serde(default)]
    pub status: BookingStatus,
    #[serde(default, alias = "status_or_source")]
    pub source: Option<BookingSource>,
    #[serde(default)]
    pub guests: Vec<GuestRef>,
    #[serde(default)]
    pub rooms: Vec<RoomRequest>,
    #[serde(default)]
    pub charges: Charges,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub adjustment_description: Option<String>,
    #[serde(default)]
    pub pets_type: Option<String>,
    #[serde(default)]
    pub pets_count: Option<String>,
}

/// One room entry of a submission: either freshly specified, or an allocation the
/// booking already holds and carries over unchanged.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomRequest {
    New(NewRoom),
    Existing { allocation_id: Ulid },
}

/// Dates are raw strings; an empty string leaves that end unset.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct NewRoom {
    #[serde(default)]
    pub room_id: Option<Ulid>,
    #[serde(default)]
    pub guests_count: Option<u32>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

/// Ledger record format. One record per committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RoomRegistered {
        room: Room,
    },
    BlockAdded {
        period: CalendarPeriod,
    },
    BlockRemoved {
        id: Ulid,
        item_id: Ulid,
    },
    /// Full replace of the booking row and its period/allocation pairs.
    BookingSaved {
        booking: BookingRow,
        rooms: Vec<RoomAllocation>,
        periods: Vec<CalendarPeriod>,
    },
    BookingDeleted {
        id: Ulid,
    },
}
