use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedCalendar = Arc<RwLock<ItemCalendar>>;

/// Write guards over a set of item calendars, keyed (and acquired) in ascending id order.
pub type LockedCalendars = BTreeMap<Ulid, OwnedRwLockWriteGuard<ItemCalendar>>;

/// Mutable access to item calendars: write guards while serving, plain maps during replay.
pub(crate) trait CalendarsMut {
    fn calendar_mut(&mut self, item_id: Ulid) -> Option<&mut ItemCalendar>;
}

impl CalendarsMut for LockedCalendars {
    fn calendar_mut(&mut self, item_id: Ulid) -> Option<&mut ItemCalendar> {
        self.get_mut(&item_id).map(|guard| &mut **guard)
    }
}

impl CalendarsMut for HashMap<Ulid, ItemCalendar> {
    fn calendar_mut(&mut self, item_id: Ulid) -> Option<&mut ItemCalendar> {
        Some(
            self.entry(item_id)
                .or_insert_with(|| ItemCalendar::new(item_id)),
        )
    }
}

/// Calendar periods grouped per item, plus a reverse index from period id to item.
pub struct PeriodStore {
    calendars: DashMap<Ulid, SharedCalendar>,
    period_items: DashMap<Ulid, Ulid>,
}

impl Default for PeriodStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodStore {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            period_items: DashMap::new(),
        }
    }

    /// Replace the whole store with calendars rebuilt from the ledger.
    pub(crate) fn install(&self, calendars: HashMap<Ulid, ItemCalendar>) {
        self.calendars.clear();
        self.period_items.clear();
        for (item_id, calendar) in calendars {
            for period in &calendar.periods {
                self.period_items.insert(period.id, item_id);
            }
            self.calendars
                .insert(item_id, Arc::new(RwLock::new(calendar)));
        }
    }

    /// Get or create the calendar for an item.
    pub fn calendar(&self, item_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(item_id)
            .or_insert_with(|| Arc::new(RwLock::new(ItemCalendar::new(item_id))))
            .clone()
    }

    pub fn existing_calendar(&self, item_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(item_id).map(|e| e.value().clone())
    }

    pub fn item_ids(&self) -> Vec<Ulid> {
        self.calendars.iter().map(|e| *e.key()).collect()
    }

    /// Item a stored period belongs to.
    pub fn item_of(&self, period_id: &Ulid) -> Option<Ulid> {
        self.period_items.get(period_id).map(|e| *e.value())
    }

    pub async fn period(&self, period_id: &Ulid) -> Option<CalendarPeriod> {
        let item_id = self.item_of(period_id)?;
        let calendar = self.existing_calendar(&item_id)?;
        let guard = calendar.read().await;
        guard.get(period_id).cloned()
    }

    /// Write-lock the calendars of `item_ids` in ascending order.
    pub async fn lock_items(&self, item_ids: impl IntoIterator<Item = Ulid>) -> LockedCalendars {
        let ordered: BTreeSet<Ulid> = item_ids.into_iter().collect();
        let mut locked = LockedCalendars::new();
        for item_id in ordered {
            let guard = self.calendar(item_id).write_owned().await;
            locked.insert(item_id, guard);
        }
        locked
    }

    // ── Writes: callers pass the calendars they hold ─────────

    pub(crate) fn insert(&self, calendars: &mut impl CalendarsMut, period: CalendarPeriod) {
        let item_id = period.item_id;
        let Some(calendar) = calendars.calendar_mut(item_id) else {
            tracing::error!(%item_id, period = %period.id, "insert into unlocked calendar skipped");
            return;
        };
        self.period_items.insert(period.id, item_id);
        calendar.insert(period);
    }

    pub(crate) fn remove(
        &self,
        calendars: &mut impl CalendarsMut,
        item_id: Ulid,
        period_id: Ulid,
    ) -> Option<CalendarPeriod> {
        let removed = calendars.calendar_mut(item_id)?.remove(period_id)?;
        self.period_items.remove(&period_id);
        Some(removed)
    }

    /// Delete-by-owner across the given items.
    pub(crate) fn remove_owned(
        &self,
        calendars: &mut impl CalendarsMut,
        item_type: ItemType,
        root_id: Ulid,
        item_ids: impl IntoIterator<Item = Ulid>,
    ) -> Vec<CalendarPeriod> {
        let mut removed = Vec::new();
        for item_id in item_ids {
            if let Some(calendar) = calendars.calendar_mut(item_id) {
                removed.extend(calendar.remove_owned(item_type, root_id));
            }
        }
        for period in &removed {
            self.period_items.remove(&period.id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_period(item_id: Ulid, root: Ulid, from: Day, to: Day) -> CalendarPeriod {
        CalendarPeriod {
            id: Ulid::new(),
            from: Some(from),
            to: Some(to),
            item_type: ItemType::BookingRoom,
            item_id,
            item_root_id: Some(root),
            season_id: None,
        }
    }

    #[tokio::test]
    async fn insert_indexes_period() {
        let store = PeriodStore::new();
        let room = Ulid::new();
        let period = room_period(room, Ulid::new(), 0, 3);
        let mut locked = store.lock_items([room]).await;
        store.insert(&mut locked, period.clone());
        drop(locked);

        assert_eq!(store.item_of(&period.id), Some(room));
        assert_eq!(store.period(&period.id).await, Some(period));
    }

    #[tokio::test]
    async fn insert_into_unlocked_calendar_is_skipped() {
        let store = PeriodStore::new();
        let room = Ulid::new();
        let mut locked = store.lock_items([Ulid::new()]).await;
        let period = room_period(room, Ulid::new(), 0, 3);
        store.insert(&mut locked, period.clone());
        assert_eq!(store.item_of(&period.id), None);
    }

    #[tokio::test]
    async fn remove_owned_clears_index() {
        let store = PeriodStore::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let booking = Ulid::new();
        let p1 = room_period(a, booking, 0, 3);
        let p2 = room_period(b, booking, 5, 9);
        let keep = room_period(b, Ulid::new(), 0, 2);

        let mut locked = store.lock_items([a, b]).await;
        store.insert(&mut locked, p1.clone());
        store.insert(&mut locked, p2.clone());
        store.insert(&mut locked, keep.clone());
        let removed = store.remove_owned(&mut locked, ItemType::BookingRoom, booking, [a, b]);
        drop(locked);

        assert_eq!(removed.len(), 2);
        assert_eq!(store.item_of(&p1.id), None);
        assert_eq!(store.item_of(&p2.id), None);
        assert_eq!(store.period(&keep.id).await, Some(keep));
    }

    #[tokio::test]
    async fn lock_items_dedups() {
        let store = PeriodStore::new();
        let room = Ulid::new();
        let locked = store.lock_items([room, room, room]).await;
        assert_eq!(locked.len(), 1);
    }

    #[test]
    fn install_rebuilds_index() {
        let store = PeriodStore::new();
        let room = Ulid::new();
        let mut calendars: HashMap<Ulid, ItemCalendar> = HashMap::new();
        let period = room_period(room, Ulid::new(), 1, 2);
        store.insert(&mut calendars, period.clone());
        store.install(calendars);
        assert_eq!(store.item_of(&period.id), Some(room));
        assert_eq!(store.item_ids(), vec![room]);
    }
}
