use ulid::Ulid;

use crate::model::*;
use crate::pricing::{self, PricingContext};

use super::error::{EngineError, Entity, ValidationErrors, ViolationKind};
use super::{Engine, CHECK_TYPES};

const RANGE_FIELD: &str = "range";

impl Engine {
    pub async fn booking(&self, id: &Ulid) -> Result<Booking, EngineError> {
        let slot = self.booking_slot(id)?;
        let guard = slot.lock().await;
        guard.clone().ok_or(EngineError::NotFound(Entity::Booking, *id))
    }

    /// Stored periods of a booking's allocations, in allocation order.
    pub async fn booking_periods(&self, id: &Ulid) -> Result<Vec<CalendarPeriod>, EngineError> {
        let booking = self.booking(id).await?;
        let mut periods = Vec::with_capacity(booking.rooms.len());
        for allocation in &booking.rooms {
            periods.push(self.period(&allocation.period_id).await?);
        }
        Ok(periods)
    }

    pub async fn period(&self, id: &Ulid) -> Result<CalendarPeriod, EngineError> {
        self.periods
            .period(id)
            .await
            .ok_or(EngineError::NotFound(Entity::Period, *id))
    }

    /// Every period stored against an item, sorted by `from`.
    pub async fn periods_for_item(&self, item_id: &Ulid) -> Vec<CalendarPeriod> {
        let Some(calendar) = self.periods.existing_calendar(item_id) else {
            return Vec::new();
        };
        let guard = calendar.read().await;
        guard.periods.clone()
    }

    /// Periods of `item_type` owned by `root_id` across the given items.
    pub async fn periods_owned_by(
        &self,
        item_type: ItemType,
        root_id: Ulid,
        item_ids: impl IntoIterator<Item = Ulid>,
    ) -> Vec<CalendarPeriod> {
        let mut owned = Vec::new();
        for item_id in item_ids {
            owned.extend(
                self.periods_for_item(&item_id)
                    .await
                    .into_iter()
                    .filter(|p| p.item_type == item_type && p.item_root_id == Some(root_id)),
            );
        }
        owned
    }

    pub fn room(&self, id: &Ulid) -> Result<Room, EngineError> {
        self.rooms
            .get(id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(Entity::Room, *id))
    }

    /// All registered rooms, ordered by id.
    pub fn rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.iter().map(|r| r.value().clone()).collect();
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    /// Parse a `[from, to)` date pair for range queries.
    pub fn parse_range(&self, from: &str, to: &str) -> Result<(Day, Day), EngineError> {
        let mut report = ValidationErrors::new();
        let mut day = |raw: &str| match self.days.day_index(raw) {
            Ok(Some(day)) => Some(day),
            Ok(None) => {
                report.add(RANGE_FIELD, None, ViolationKind::MissingPeriod);
                None
            }
            Err(e) => {
                report.add(RANGE_FIELD, None, ViolationKind::InvalidDate { value: e.0 });
                None
            }
        };
        let (from, to) = (day(from), day(to));
        match (from, to) {
            (Some(from), Some(to)) if report.is_empty() => Ok((from, to)),
            _ => Err(EngineError::Invalid(report)),
        }
    }

    /// Rooms with no booking or block overlapping `[from, to)`.
    pub async fn available_rooms(&self, from: Day, to: Day) -> Result<Vec<Room>, EngineError> {
        if from >= to {
            let mut report = ValidationErrors::new();
            report.add(RANGE_FIELD, None, ViolationKind::InvalidRange);
            return Err(EngineError::Invalid(report));
        }
        let span = DaySpan::new(from, to);
        let mut free = Vec::new();
        for room in self.rooms() {
            if let Some(calendar) = self.periods.existing_calendar(&room.id) {
                let guard = calendar.read().await;
                if guard
                    .overlapping(&span)
                    .any(|p| CHECK_TYPES.contains(&p.item_type))
                {
                    continue;
                }
            }
            free.push(room);
        }
        Ok(free)
    }

    /// Nights of the booking's stay that covers `day`, counting both ends of each period.
    /// A booking with no stay on `day` is reported as not found under its own id.
    pub async fn stay_length_on(&self, booking_id: &Ulid, day: Day) -> Result<Day, EngineError> {
        self.booking_periods(booking_id)
            .await?
            .iter()
            .find(|p| p.touches_day(day))
            .and_then(CalendarPeriod::length)
            .ok_or(EngineError::NotFound(Entity::Booking, *booking_id))
    }

    pub async fn period_length(&self, period_id: &Ulid) -> Result<Day, EngineError> {
        self.period(period_id)
            .await?
            .length()
            .ok_or(EngineError::NotFound(Entity::Period, *period_id))
    }

    /// Rate season of the booking's first allocation, if any.
    pub async fn booking_season(&self, booking_id: &Ulid) -> Result<Option<Ulid>, EngineError> {
        let booking = self.booking(booking_id).await?;
        match booking.rooms.first() {
            Some(allocation) => Ok(self.period(&allocation.period_id).await?.season_id),
            None => Ok(None),
        }
    }

    pub async fn subtotal_price(&self, booking_id: &Ulid) -> Result<f64, EngineError> {
        let booking = self.booking(booking_id).await?;
        Ok(pricing::subtotal(&booking.charges))
    }

    pub async fn total_price(&self, booking_id: &Ulid, ctx: &mut PricingContext) -> Result<f64, EngineError> {
        let booking = self.booking(booking_id).await?;
        Ok(pricing::total(&booking.charges, ctx))
    }
}
