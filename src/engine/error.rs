use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Room,
    Booking,
    Period,
    Allocation,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Room => "room",
            Entity::Booking => "booking",
            Entity::Period => "period",
            Entity::Allocation => "allocation",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    MissingPeriod,
    InvalidRange,
    InvalidDate { value: String },
    PeriodConflict { with: Ulid },
    RoomRequired,
    GuestsRequired,
    OccupancyExceeded { max_occupancy: u32, requested: u32 },
    GuestRequired,
    TooLong { max: usize },
    DuplicateAllocation { allocation_id: Ulid },
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::MissingPeriod => f.write_str("missing period"),
            ViolationKind::InvalidRange => f.write_str("invalid range"),
            ViolationKind::InvalidDate { value } => write!(f, "invalid date {value:?}"),
            ViolationKind::PeriodConflict { .. } => f.write_str("period conflict"),
            ViolationKind::RoomRequired => f.write_str("room required"),
            ViolationKind::GuestsRequired => f.write_str("guests required"),
            ViolationKind::OccupancyExceeded { .. } => f.write_str("occupancy exceeded"),
            ViolationKind::GuestRequired => f.write_str("guest required"),
            ViolationKind::TooLong { max } => write!(f, "too long (max {max})"),
            ViolationKind::DuplicateAllocation { .. } => f.write_str("duplicate allocation"),
        }
    }
}

/// One failed check. `position` indexes into the submitted list for list fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

/// Field-keyed collection of violations. Validators only ever add to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    fields: BTreeMap<&'static str, Vec<Violation>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &'static str, position: Option<usize>, kind: ViolationKind) {
        self.fields
            .entry(field)
            .or_default()
            .push(Violation { position, kind });
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.values().map(Vec::len).sum()
    }

    pub fn field(&self, name: &str) -> &[Violation] {
        self.fields.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Violation)> {
        self.fields
            .iter()
            .flat_map(|(field, list)| list.iter().map(move |v| (*field, v)))
    }

    pub fn only_conflicts(&self) -> bool {
        !self.is_empty()
            && self
                .iter()
                .all(|(_, v)| matches!(v.kind, ViolationKind::PeriodConflict { .. }))
    }

    /// `Ok` when nothing was reported. A report made up solely of period conflicts is a
    /// `Conflict`; anything else is `Invalid`.
    pub fn into_result(self) -> Result<(), EngineError> {
        if self.is_empty() {
            Ok(())
        } else if self.only_conflicts() {
            Err(EngineError::Conflict(self))
        } else {
            Err(EngineError::Invalid(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            match v.position {
                Some(pos) => write!(f, "{field}[{pos}]: {}", v.kind)?,
                None => write!(f, "{field}: {}", v.kind)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Invalid(ValidationErrors),
    #[error("room already booked for these dates: {0}")]
    Conflict(ValidationErrors),
    #[error("{0} not found: {1}")]
    NotFound(Entity, Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    pub fn violations(&self) -> Option<&ValidationErrors> {
        match self {
            EngineError::Invalid(report) | EngineError::Conflict(report) => Some(report),
            _ => None,
        }
    }

    /// Short machine label, used for metrics and the wire.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Invalid(_) => "invalid",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(..) => "not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Persistence(_) => "persistence",
        }
    }
}
