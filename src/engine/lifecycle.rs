use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::now_ms;
use crate::directory::AuthContext;
use crate::limits::*;
use crate::model::*;
use crate::observability::{self, BLOCKS_TOTAL, BOOKINGS_DELETED_TOTAL, BOOKINGS_SAVED_TOTAL};
use crate::pricing::PricingContext;

use super::compose::{self, Composer, RoomDraft, ROOMS_FIELD};
use super::error::{EngineError, Entity, ValidationErrors, ViolationKind};
use super::store::LockedCalendars;
use super::validate::{check_conflicts, check_existence, CHECK_TYPES};
use super::{replace_booking_periods, Engine, RoomCatalog, SharedBooking};

const BLOCK_FIELD: &str = "block";

#[derive(Clone, Copy)]
enum SaveOp {
    Create,
    Update,
}

impl SaveOp {
    fn label(self) -> &'static str {
        match self {
            SaveOp::Create => "create",
            SaveOp::Update => "update",
        }
    }
}

/// Request-level checks that need no stored state. Hard limits fail fast.
fn check_request(request: &BookingRequest, report: &mut ValidationErrors) -> Result<(), EngineError> {
    if request.rooms.len() > MAX_ROOMS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many rooms in booking"));
    }
    if request.guests.len() > MAX_GUESTS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many guests in booking"));
    }

    if request.guests.is_empty() {
        report.add("guests", None, ViolationKind::GuestRequired);
    }
    for (position, guest) in request.guests.iter().enumerate() {
        if guest.guest_id.is_none() {
            report.add("guests", Some(position), ViolationKind::GuestRequired);
        }
    }

    let text_fields = [
        ("notes", &request.notes, MAX_NOTES_LEN),
        ("adjustment_description", &request.adjustment_description, MAX_ADJUSTMENT_DESCRIPTION_LEN),
    ];
    for (field, value, max) in text_fields {
        if let Some(text) = value
            && text.chars().count() > max
        {
            report.add(field, None, ViolationKind::TooLong { max });
        }
    }
    Ok(())
}

impl Engine {
    /// Room required, guests required and occupancy, per drafted room. An unknown room
    /// aborts the whole request.
    fn check_occupancy(&self, drafts: &[RoomDraft], report: &mut ValidationErrors) -> Result<(), EngineError> {
        for draft in drafts {
            let Some(room_id) = draft.room_id else {
                report.add(ROOMS_FIELD, Some(draft.position), ViolationKind::RoomRequired);
                continue;
            };
            let max_occupancy = self.max_occupancy(&room_id)?;
            match draft.guests_count {
                None | Some(0) => {
                    report.add(ROOMS_FIELD, Some(draft.position), ViolationKind::GuestsRequired);
                }
                Some(requested) if requested >= max_occupancy => report.add(
                    ROOMS_FIELD,
                    Some(draft.position),
                    ViolationKind::OccupancyExceeded {
                        max_occupancy,
                        requested,
                    },
                ),
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub async fn register_room(&self, room: Room) -> Result<(), EngineError> {
        if room.title.len() > MAX_ROOM_TITLE_LEN {
            return Err(EngineError::LimitExceeded("room title too long"));
        }
        if !self.rooms.contains_key(&room.id) && self.rooms.len() >= MAX_ROOMS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }

        let _gate = self.commit_gate.read().await;
        let event = Event::RoomRegistered { room: room.clone() };
        self.append(&event).await?;
        info!(room = %room.id, title = %room.title, max_occupancy = room.max_occupancy, "room registered");
        self.rooms.insert(room.id, room);
        Ok(())
    }

    pub async fn create_booking(
        &self,
        request: BookingRequest,
        auth: &AuthContext,
        ctx: &mut PricingContext,
    ) -> Result<Booking, EngineError> {
        let slot: SharedBooking = Arc::new(Mutex::new(None));
        self.save_booking(SaveOp::Create, Ulid::new(), slot, request, auth, ctx)
            .await
            .inspect_err(|e| observability::record_rejection("create", e))
    }

    /// Full replace: allocations not resubmitted are gone afterwards.
    pub async fn update_booking(
        &self,
        id: Ulid,
        request: BookingRequest,
        auth: &AuthContext,
        ctx: &mut PricingContext,
    ) -> Result<Booking, EngineError> {
        let slot = self
            .booking_slot(&id)
            .inspect_err(|e| observability::record_rejection("update", e))?;
        self.save_booking(SaveOp::Update, id, slot, request, auth, ctx)
            .await
            .inspect_err(|e| observability::record_rejection("update", e))
    }

    async fn save_booking(
        &self,
        op: SaveOp,
        id: Ulid,
        slot: SharedBooking,
        request: BookingRequest,
        auth: &AuthContext,
        ctx: &mut PricingContext,
    ) -> Result<Booking, EngineError> {
        let mut report = ValidationErrors::new();
        check_request(&request, &mut report)?;

        let _gate = self.commit_gate.read().await;
        let mut guard = slot.lock().await;
        if matches!(op, SaveOp::Update) && guard.is_none() {
            return Err(EngineError::NotFound(Entity::Booking, id));
        }
        let previous = guard.as_ref();

        let composer = Composer::new(self.days.as_ref(), id, ctx);
        let mut drafts = composer.draft(&request.rooms, previous, &mut report)?;
        self.check_occupancy(&drafts, &mut report)?;

        let previous_items: Vec<Ulid> = previous.map(|b| b.room_ids().collect()).unwrap_or_default();
        let replaced: HashSet<Ulid> = previous
            .map(|b| b.rooms.iter().map(|a| a.period_id).collect())
            .unwrap_or_default();
        let created_at = previous.map(|b| b.created_at);
        let source = BookingSource::resolve(request.source, previous.map(|b| b.source));
        let user_id = self.directory.assign(auth, previous.and_then(|b| b.user_id)).await;

        let touched = drafts
            .iter()
            .filter_map(|d| d.room_id)
            .chain(previous_items.iter().copied());
        let mut locked = self.periods.lock_items(touched).await;
        compose::resolve_carried(&mut drafts, &locked)?;

        let candidates = compose::candidates(&drafts);
        check_existence(&candidates, ROOMS_FIELD, &mut report);
        check_conflicts(
            |item_id| locked.get(item_id).map(|g| &**g),
            &candidates,
            CHECK_TYPES,
            &replaced,
            ROOMS_FIELD,
            &mut report,
        );
        if let Err(e) = report.into_result() {
            debug!(booking = %id, op = op.label(), "booking rejected: {e}");
            return Err(e);
        }
        check_calendar_sizes(&locked, &drafts, &replaced, MAX_PERIODS_PER_ITEM)?;

        let (allocations, periods) = compose::finish(drafts, id).ok_or_else(|| {
            EngineError::Persistence(format!("booking {id}: incomplete room draft after validation"))
        })?;

        let now = now_ms();
        let booking = Booking {
            id,
            status: request.status,
            source,
            charges: request.charges,
            guests: request.guests,
            rooms: allocations,
            user_id,
            notes: request.notes,
            adjustment_description: request.adjustment_description,
            pets_type: request.pets_type,
            pets_count: request.pets_count,
            saved_on: self.days.today(),
            created_at: created_at.unwrap_or(now),
            updated_at: now,
        };
        let row = booking
            .to_row()
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let event = Event::BookingSaved {
            booking: row,
            rooms: booking.rooms.clone(),
            periods: periods.clone(),
        };
        self.append(&event).await?;

        replace_booking_periods(&self.periods, &mut locked, id, previous_items, periods);
        *guard = Some(booking.clone());
        if matches!(op, SaveOp::Create) {
            self.bookings.insert(id, slot.clone());
        }

        metrics::counter!(BOOKINGS_SAVED_TOTAL, "op" => op.label()).increment(1);
        info!(booking = %id, op = op.label(), rooms = booking.rooms.len(), user = ?booking.user_id, "booking saved");
        Ok(booking)
    }

    /// Delete a booking and every period it owns. Returns the deleted booking.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let slot = self
            .booking_slot(&id)
            .inspect_err(|e| observability::record_rejection("delete", e))?;

        let _gate = self.commit_gate.read().await;
        let mut guard = slot.lock().await;
        let room_ids: Vec<Ulid> = match guard.as_ref() {
            Some(booking) => booking.room_ids().collect(),
            None => return Err(EngineError::NotFound(Entity::Booking, id)),
        };
        let mut locked = self.periods.lock_items(room_ids.iter().copied()).await;

        self.append(&Event::BookingDeleted { id }).await?;
        let removed = self
            .periods
            .remove_owned(&mut locked, ItemType::BookingRoom, id, room_ids);
        self.bookings.remove(&id);
        let booking = guard.take().ok_or(EngineError::NotFound(Entity::Booking, id))?;

        metrics::counter!(BOOKINGS_DELETED_TOTAL).increment(1);
        info!(booking = %id, periods = removed.len(), "booking deleted");
        Ok(booking)
    }

    /// Close a room for `[from, to)` with an owner block.
    pub async fn add_block(&self, room_id: Ulid, from: &str, to: &str) -> Result<CalendarPeriod, EngineError> {
        if !self.rooms.contains_key(&room_id) {
            return Err(EngineError::NotFound(Entity::Room, room_id));
        }
        let mut report = ValidationErrors::new();
        let mut day = |raw: &str| {
            self.days.day_index(raw).unwrap_or_else(|e| {
                report.add(BLOCK_FIELD, None, ViolationKind::InvalidDate { value: e.0 });
                None
            })
        };
        let period = CalendarPeriod {
            id: Ulid::new(),
            from: day(from),
            to: day(to),
            item_type: ItemType::BookingBlock,
            item_id: room_id,
            item_root_id: None,
            season_id: None,
        };

        let _gate = self.commit_gate.read().await;
        let mut locked = self.periods.lock_items([room_id]).await;
        if report.is_empty() {
            let candidates = [(0, &period)];
            check_existence(&candidates, BLOCK_FIELD, &mut report);
            check_conflicts(
                |item_id| locked.get(item_id).map(|g| &**g),
                &candidates,
                CHECK_TYPES,
                &HashSet::new(),
                BLOCK_FIELD,
                &mut report,
            );
        }
        if let Err(e) = report.into_result() {
            debug!(room = %room_id, "block rejected: {e}");
            observability::record_rejection("add_block", &e);
            return Err(e);
        }
        if locked.get(&room_id).is_some_and(|c| c.periods.len() >= MAX_PERIODS_PER_ITEM) {
            return Err(EngineError::LimitExceeded("too many periods on room"));
        }

        self.append(&Event::BlockAdded { period: period.clone() }).await?;
        self.periods.insert(&mut locked, period.clone());
        metrics::counter!(BLOCKS_TOTAL, "op" => "add").increment(1);
        info!(room = %room_id, block = %period.id, "block added");
        Ok(period)
    }

    /// Remove an owner block. Booking periods are not reachable through this call.
    pub async fn remove_block(&self, id: Ulid) -> Result<CalendarPeriod, EngineError> {
        let item_id = self
            .periods
            .item_of(&id)
            .ok_or(EngineError::NotFound(Entity::Period, id))?;

        let _gate = self.commit_gate.read().await;
        let mut locked = self.periods.lock_items([item_id]).await;
        let is_block = locked
            .get(&item_id)
            .and_then(|c| c.get(&id))
            .is_some_and(|p| p.item_type == ItemType::BookingBlock);
        if !is_block {
            return Err(EngineError::NotFound(Entity::Period, id));
        }

        self.append(&Event::BlockRemoved { id, item_id }).await?;
        let removed = self
            .periods
            .remove(&mut locked, item_id, id)
            .ok_or(EngineError::NotFound(Entity::Period, id))?;
        metrics::counter!(BLOCKS_TOTAL, "op" => "remove").increment(1);
        info!(room = %item_id, block = %id, "block removed");
        Ok(removed)
    }
}

/// The booking's periods, once saved, may not push any room calendar past `cap`. Periods in
/// `replaced` leave their calendars in the same save.
fn check_calendar_sizes(
    locked: &LockedCalendars,
    drafts: &[RoomDraft],
    replaced: &HashSet<Ulid>,
    cap: usize,
) -> Result<(), EngineError> {
    let mut incoming: HashMap<Ulid, usize> = HashMap::new();
    for room_id in drafts.iter().filter_map(|d| d.room_id) {
        *incoming.entry(room_id).or_default() += 1;
    }
    for (room_id, added) in incoming {
        let (current, leaving) = locked.get(&room_id).map_or((0, 0), |c| {
            let leaving = c.periods.iter().filter(|p| replaced.contains(&p.id)).count();
            (c.periods.len(), leaving)
        });
        if current - leaving + added > cap {
            return Err(EngineError::LimitExceeded("too many periods on room"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::calendar::IsoCalendar;
    use crate::engine::PeriodStore;

    use super::*;

    fn booked(room: Ulid, owner: Ulid, from: Day) -> CalendarPeriod {
        CalendarPeriod {
            id: Ulid::new(),
            from: Some(from),
            to: Some(from + 1),
            item_type: ItemType::BookingRoom,
            item_id: room,
            item_root_id: Some(owner),
            season_id: None,
        }
    }

    fn drafts_for(room: Ulid, nights: &[&str]) -> Vec<RoomDraft> {
        let mut ctx = PricingContext::default();
        let composer = Composer::new(&IsoCalendar, Ulid::new(), &mut ctx);
        let requests: Vec<RoomRequest> = nights
            .iter()
            .map(|from| {
                RoomRequest::New(NewRoom {
                    room_id: Some(room),
                    guests_count: Some(1),
                    from: (*from).into(),
                    to: String::new(),
                })
            })
            .collect();
        let mut report = ValidationErrors::new();
        composer.draft(&requests, None, &mut report).unwrap()
    }

    #[tokio::test]
    async fn calendar_cap_counts_every_new_period_of_a_room() {
        let store = PeriodStore::new();
        let room = Ulid::new();
        let mut locked = store.lock_items([room]).await;
        store.insert(&mut locked, booked(room, Ulid::new(), 0));

        let one = drafts_for(room, &["2024-01-01"]);
        assert!(check_calendar_sizes(&locked, &one, &HashSet::new(), 2).is_ok());

        let two = drafts_for(room, &["2024-01-01", "2024-02-01"]);
        let err = check_calendar_sizes(&locked, &two, &HashSet::new(), 2).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }

    #[tokio::test]
    async fn calendar_cap_discounts_replaced_periods() {
        let store = PeriodStore::new();
        let room = Ulid::new();
        let owner = Ulid::new();
        let previous = booked(room, owner, 0);
        let mut locked = store.lock_items([room]).await;
        store.insert(&mut locked, previous.clone());
        store.insert(&mut locked, booked(room, Ulid::new(), 10));

        let two = drafts_for(room, &["2024-01-01", "2024-02-01"]);
        let replaced = HashSet::from([previous.id]);
        assert!(check_calendar_sizes(&locked, &two, &replaced, 3).is_ok());
        assert!(check_calendar_sizes(&locked, &two, &HashSet::new(), 3).is_err());
    }

    #[tokio::test]
    async fn calendar_cap_applies_to_fresh_rooms() {
        let store = PeriodStore::new();
        let room = Ulid::new();
        let locked = store.lock_items([room]).await;
        let three = drafts_for(room, &["2024-01-01", "2024-02-01", "2024-03-01"]);
        assert!(check_calendar_sizes(&locked, &three, &HashSet::new(), 2).is_err());
    }
}
