use std::collections::HashSet;

use ulid::Ulid;

use crate::calendar::DayCalendar;
use crate::model::*;
use crate::pricing::PricingContext;

use super::error::{EngineError, Entity, ValidationErrors, ViolationKind};
use super::store::LockedCalendars;
use super::validate::Candidate;

/// Field that room-level violations are reported under.
pub(super) const ROOMS_FIELD: &str = "rooms";

/// One submitted room entry, turned into a period/allocation pair that is not yet stored.
///
/// Any of `room_id`, `guests_count` and `period` may be missing; those gaps are reported
/// as violations and the draft never reaches the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomDraft {
    pub position: usize,
    pub allocation_id: Ulid,
    pub room_id: Option<Ulid>,
    pub guests_count: Option<u32>,
    pub period: Option<CalendarPeriod>,
    /// Stored period of a carried-over allocation, filled in once calendars are locked.
    carried_period: Option<Ulid>,
}

impl RoomDraft {
    pub fn is_carried(&self) -> bool {
        self.carried_period.is_some()
    }

    fn allocation(&self, booking_id: Ulid) -> Option<RoomAllocation> {
        Some(RoomAllocation {
            id: self.allocation_id,
            booking_id,
            room_id: self.room_id?,
            guests_count: self.guests_count?,
            period_id: self.period.as_ref()?.id,
        })
    }
}

/// Builds drafts for one booking save. Consumes the season override of the context it is
/// created from.
pub(super) struct Composer<'a> {
    days: &'a dyn DayCalendar,
    booking_id: Ulid,
    season: Option<Ulid>,
}

impl<'a> Composer<'a> {
    pub fn new(days: &'a dyn DayCalendar, booking_id: Ulid, ctx: &mut PricingContext) -> Self {
        Self {
            days,
            booking_id,
            season: ctx.season_override.take(),
        }
    }

    /// Draft every room entry. Date problems and repeated `Existing` entries are reported;
    /// an `Existing` entry naming an allocation the booking does not hold is fatal.
    pub fn draft(
        &self,
        requests: &[RoomRequest],
        previous: Option<&Booking>,
        report: &mut ValidationErrors,
    ) -> Result<Vec<RoomDraft>, EngineError> {
        let mut carried = HashSet::new();
        let mut drafts = Vec::with_capacity(requests.len());
        for (position, request) in requests.iter().enumerate() {
            match request {
                RoomRequest::New(room) => drafts.push(self.draft_new(position, room, report)),
                RoomRequest::Existing { allocation_id } => {
                    if !carried.insert(*allocation_id) {
                        report.add(
                            ROOMS_FIELD,
                            Some(position),
                            ViolationKind::DuplicateAllocation {
                                allocation_id: *allocation_id,
                            },
                        );
                        continue;
                    }
                    drafts.push(self.carry(position, *allocation_id, previous)?);
                }
            }
        }
        Ok(drafts)
    }

    fn draft_new(&self, position: usize, room: &NewRoom, report: &mut ValidationErrors) -> RoomDraft {
        let from = self.day(position, &room.from, report);
        let to = self.day(position, &room.to, report);

        let period = match (room.room_id, from, to) {
            (Some(item_id), Ok(from), Ok(to)) => Some(CalendarPeriod {
                id: Ulid::new(),
                from,
                to,
                item_type: ItemType::BookingRoom,
                item_id,
                item_root_id: Some(self.booking_id),
                season_id: self.season,
            }),
            _ => None,
        };

        RoomDraft {
            position,
            allocation_id: Ulid::new(),
            room_id: room.room_id,
            guests_count: room.guests_count,
            period,
            carried_period: None,
        }
    }

    fn day(&self, position: usize, raw: &str, report: &mut ValidationErrors) -> Result<Option<Day>, ()> {
        self.days.day_index(raw).map_err(|e| {
            report.add(ROOMS_FIELD, Some(position), ViolationKind::InvalidDate { value: e.0 });
        })
    }

    fn carry(
        &self,
        position: usize,
        allocation_id: Ulid,
        previous: Option<&Booking>,
    ) -> Result<RoomDraft, EngineError> {
        let allocation = previous
            .and_then(|b| b.rooms.iter().find(|a| a.id == allocation_id))
            .ok_or(EngineError::NotFound(Entity::Allocation, allocation_id))?;
        Ok(RoomDraft {
            position,
            allocation_id,
            room_id: Some(allocation.room_id),
            guests_count: Some(allocation.guests_count),
            period: None,
            carried_period: Some(allocation.period_id),
        })
    }
}

/// Copy the stored periods of carried-over allocations out of the locked calendars.
pub(super) fn resolve_carried(drafts: &mut [RoomDraft], locked: &LockedCalendars) -> Result<(), EngineError> {
    for draft in drafts.iter_mut() {
        let (Some(period_id), Some(room_id)) = (draft.carried_period, draft.room_id) else {
            continue;
        };
        let period = locked
            .get(&room_id)
            .and_then(|calendar| calendar.get(&period_id))
            .ok_or(EngineError::NotFound(Entity::Period, period_id))?;
        draft.period = Some(period.clone());
    }
    Ok(())
}

/// Periods ready for the validators, tagged with their request position.
pub(super) fn candidates(drafts: &[RoomDraft]) -> Vec<Candidate<'_>> {
    drafts
        .iter()
        .filter_map(|d| d.period.as_ref().map(|p| (d.position, p)))
        .collect()
}

/// Split validated drafts into the allocation and period sets of the booking. Returns
/// `None` if any draft is incomplete.
pub(super) fn finish(
    drafts: Vec<RoomDraft>,
    booking_id: Ulid,
) -> Option<(Vec<RoomAllocation>, Vec<CalendarPeriod>)> {
    let mut allocations = Vec::with_capacity(drafts.len());
    let mut periods = Vec::with_capacity(drafts.len());
    for draft in drafts {
        allocations.push(draft.allocation(booking_id)?);
        periods.push(draft.period?);
    }
    Some((allocations, periods))
}

#[cfg(test)]
mod tests {
    use crate::calendar::IsoCalendar;

    use super::*;

    fn new_room(room_id: Option<Ulid>, guests: Option<u32>, from: &str, to: &str) -> RoomRequest {
        RoomRequest::New(NewRoom {
            room_id,
            guests_count: guests,
            from: from.into(),
            to: to.into(),
        })
    }

    #[test]
    fn new_rooms_become_owned_periods() {
        let booking = Ulid::new();
        let room = Ulid::new();
        let mut ctx = PricingContext::default();
        let composer = Composer::new(&IsoCalendar, booking, &mut ctx);
        let mut report = ValidationErrors::new();

        let drafts = composer
            .draft(&[new_room(Some(room), Some(2), "1970-01-02", "1970-01-05")], None, &mut report)
            .unwrap();
        assert!(report.is_empty());
        let period = drafts[0].period.as_ref().unwrap();
        assert_eq!((period.from, period.to), (Some(1), Some(4)));
        assert_eq!(period.item_id, room);
        assert_eq!(period.item_root_id, Some(booking));
        assert_eq!(period.item_type, ItemType::BookingRoom);
    }

    #[test]
    fn season_override_is_taken_once() {
        let season = Ulid::new();
        let mut ctx = PricingContext {
            season_override: Some(season),
            ..PricingContext::default()
        };
        let composer = Composer::new(&IsoCalendar, Ulid::new(), &mut ctx);
        assert_eq!(ctx.season_override, None);

        let mut report = ValidationErrors::new();
        let requests = [
            new_room(Some(Ulid::new()), Some(1), "2024-01-01", "2024-01-03"),
            new_room(Some(Ulid::new()), Some(1), "2024-01-01", "2024-01-03"),
        ];
        let drafts = composer.draft(&requests, None, &mut report).unwrap();
        assert!(drafts.iter().all(|d| d.period.as_ref().unwrap().season_id == Some(season)));
    }

    #[test]
    fn empty_date_leaves_end_unset() {
        let mut ctx = PricingContext::default();
        let composer = Composer::new(&IsoCalendar, Ulid::new(), &mut ctx);
        let mut report = ValidationErrors::new();
        let drafts = composer
            .draft(&[new_room(Some(Ulid::new()), Some(1), "", "2024-01-03")], None, &mut report)
            .unwrap();
        assert!(report.is_empty());
        assert_eq!(drafts[0].period.as_ref().unwrap().from, None);
    }

    #[test]
    fn unparseable_date_is_reported_without_period() {
        let mut ctx = PricingContext::default();
        let composer = Composer::new(&IsoCalendar, Ulid::new(), &mut ctx);
        let mut report = ValidationErrors::new();
        let drafts = composer
            .draft(&[new_room(Some(Ulid::new()), Some(1), "soon", "2024-01-03")], None, &mut report)
            .unwrap();
        assert!(drafts[0].period.is_none());
        assert_eq!(
            report.field(ROOMS_FIELD)[0].kind,
            ViolationKind::InvalidDate { value: "soon".into() }
        );
    }

    #[test]
    fn unknown_existing_allocation_is_not_found() {
        let mut ctx = PricingContext::default();
        let composer = Composer::new(&IsoCalendar, Ulid::new(), &mut ctx);
        let mut report = ValidationErrors::new();
        let missing = Ulid::new();
        let err = composer
            .draft(&[RoomRequest::Existing { allocation_id: missing }], None, &mut report)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(Entity::Allocation, id) if id == missing));
    }

    #[test]
    fn repeated_existing_allocation_is_reported_once() {
        let booking_id = Ulid::new();
        let allocation = RoomAllocation {
            id: Ulid::new(),
            booking_id,
            room_id: Ulid::new(),
            guests_count: 1,
            period_id: Ulid::new(),
        };
        let previous = Booking {
            id: booking_id,
            status: BookingStatus::default(),
            source: BookingSource::OWNER_BLOCK,
            charges: Charges::default(),
            guests: vec![GuestRef::new(Ulid::new())],
            rooms: vec![allocation.clone()],
            user_id: None,
            notes: None,
            adjustment_description: None,
            pets_type: None,
            pets_count: None,
            saved_on: 0,
            created_at: 0,
            updated_at: 0,
        };
        let mut ctx = PricingContext::default();
        let composer = Composer::new(&IsoCalendar, booking_id, &mut ctx);
        let mut report = ValidationErrors::new();

        let repeated = RoomRequest::Existing { allocation_id: allocation.id };
        let drafts = composer
            .draft(&[repeated.clone(), repeated], Some(&previous), &mut report)
            .unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].position, 0);
        let violations = report.field(ROOMS_FIELD);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].position, Some(1));
        assert_eq!(
            violations[0].kind,
            ViolationKind::DuplicateAllocation { allocation_id: allocation.id }
        );
    }

    #[test]
    fn finish_requires_complete_drafts() {
        let booking = Ulid::new();
        let mut ctx = PricingContext::default();
        let composer = Composer::new(&IsoCalendar, booking, &mut ctx);
        let mut report = ValidationErrors::new();

        let complete = composer
            .draft(&[new_room(Some(Ulid::new()), Some(1), "2024-01-01", "2024-01-02")], None, &mut report)
            .unwrap();
        let (allocations, periods) = finish(complete, booking).unwrap();
        assert_eq!(allocations[0].period_id, periods[0].id);
        assert_eq!(allocations[0].booking_id, booking);

        let missing_guests = composer
            .draft(&[new_room(Some(Ulid::new()), None, "2024-01-01", "2024-01-02")], None, &mut report)
            .unwrap();
        assert!(finish(missing_guests, booking).is_none());
    }
}
