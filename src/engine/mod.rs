mod compose;
mod error;
mod lifecycle;
mod queries;
mod store;
mod validate;

pub use compose::RoomDraft;
pub use error::{EngineError, Entity, ValidationErrors, Violation, ViolationKind};
pub use store::{LockedCalendars, PeriodStore, SharedCalendar};
pub use validate::{check_conflicts, check_existence, Candidate, CHECK_TYPES};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::{DayCalendar, IsoCalendar};
use crate::directory::{RoleDirectory, UserDirectory};
use crate::model::*;
use crate::wal::Wal;

/// `None` once the booking has been deleted; waiters re-check after locking.
pub type SharedBooking = Arc<Mutex<Option<Booking>>>;

// ── Group-commit ledger writer ──────────────────────────

pub(super) enum LedgerCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the ledger file. Appends that arrive while a batch is open share one fsync;
/// any other command first flushes the open batch.
async fn ledger_writer(mut wal: Wal, mut rx: mpsc::Receiver<LedgerCommand>) {
    while let Some(first) = rx.recv().await {
        let mut batch: Vec<PendingAppend> = Vec::new();
        let mut deferred = None;

        match first {
            LedgerCommand::Append { event, response } => batch.push((event, response)),
            other => deferred = Some(other),
        }
        while deferred.is_none() {
            match rx.try_recv() {
                Ok(LedgerCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => deferred = Some(other),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            commit_batch(&mut wal, batch);
        }
        if let Some(cmd) = deferred {
            run_maintenance(&mut wal, cmd);
        }
    }
}

/// Events that cannot be framed are refused on their own; the rest commit or fail together.
fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::LEDGER_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut frames = Vec::new();
    let mut waiting = Vec::with_capacity(batch.len());
    for (event, response) in batch {
        match crate::wal::encode_frame(&mut frames, &event) {
            Ok(()) => waiting.push(response),
            Err(e) => {
                tracing::error!("ledger event refused: {e}");
                let _ = response.send(Err(e));
            }
        }
    }
    if waiting.is_empty() {
        return;
    }

    let result = wal.commit(&frames, waiting.len() as u64);
    metrics::histogram!(crate::observability::LEDGER_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(events = waiting.len(), "ledger commit failed: {e}");
    }
    for response in waiting {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

fn run_maintenance(wal: &mut Wal, cmd: LedgerCommand) {
    match cmd {
        LedgerCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        LedgerCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        LedgerCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Engine ──────────────────────────────────────────────

/// External collaborators the engine calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn UserDirectory>,
    pub days: Arc<dyn DayCalendar>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            directory: Arc::new(RoleDirectory::default()),
            days: Arc::new(IsoCalendar),
        }
    }
}

/// Resolves a room to its occupancy limit.
pub trait RoomCatalog {
    fn max_occupancy(&self, room_id: &Ulid) -> Result<u32, EngineError>;
}

/// Booking state for one property.
///
/// Lock order: commit gate (read) → booking mutex → item calendars ascending → ledger.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, Room>,
    pub(super) periods: PeriodStore,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    pub(super) ledger_tx: mpsc::Sender<LedgerCommand>,
    /// Writers hold it shared from validation through apply; compaction holds it exclusively.
    pub(super) commit_gate: RwLock<()>,
    pub(super) directory: Arc<dyn UserDirectory>,
    pub(super) days: Arc<dyn DayCalendar>,
}

/// State rebuilt from the ledger before anything is shared.
#[derive(Default)]
struct Replay {
    rooms: HashMap<Ulid, Room>,
    calendars: HashMap<Ulid, ItemCalendar>,
    bookings: HashMap<Ulid, Booking>,
}

impl Replay {
    fn apply(&mut self, periods: &PeriodStore, event: Event) -> io::Result<()> {
        match event {
            Event::RoomRegistered { room } => {
                self.rooms.insert(room.id, room);
            }
            Event::BlockAdded { period } => periods.insert(&mut self.calendars, period),
            Event::BlockRemoved { id, item_id } => {
                periods.remove(&mut self.calendars, item_id, id);
            }
            Event::BookingSaved {
                booking,
                rooms,
                periods: new_periods,
            } => {
                let id = booking.id;
                let previous_items: Vec<Ulid> = self
                    .bookings
                    .get(&id)
                    .map(|b| b.room_ids().collect())
                    .unwrap_or_default();
                replace_booking_periods(periods, &mut self.calendars, id, previous_items, new_periods);
                let booking = booking
                    .into_booking(rooms)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                self.bookings.insert(id, booking);
            }
            Event::BookingDeleted { id } => {
                if let Some(previous) = self.bookings.remove(&id) {
                    periods.remove_owned(
                        &mut self.calendars,
                        ItemType::BookingRoom,
                        id,
                        previous.room_ids(),
                    );
                }
            }
        }
        Ok(())
    }
}

/// Drop the booking's current `BookingRoom` periods and insert the new set.
pub(super) fn replace_booking_periods(
    store: &PeriodStore,
    calendars: &mut impl store::CalendarsMut,
    booking_id: Ulid,
    previous_items: impl IntoIterator<Item = Ulid>,
    new_periods: Vec<CalendarPeriod>,
) {
    store.remove_owned(calendars, ItemType::BookingRoom, booking_id, previous_items);
    for period in new_periods {
        store.insert(calendars, period);
    }
}

impl Engine {
    /// Open (or create) the ledger at `path` and rebuild state from it.
    pub fn open(path: PathBuf, collaborators: Collaborators) -> io::Result<Self> {
        let (wal, events) = Wal::open(&path)?;
        let periods = PeriodStore::new();
        let mut replay = Replay::default();
        let replayed = events.len();
        for event in events {
            replay.apply(&periods, event)?;
        }
        periods.install(replay.calendars);

        let (ledger_tx, ledger_rx) = mpsc::channel(4096);
        tokio::spawn(ledger_writer(wal, ledger_rx));

        let engine = Self {
            rooms: replay.rooms.into_iter().collect(),
            periods,
            bookings: replay
                .bookings
                .into_iter()
                .map(|(id, b)| (id, Arc::new(Mutex::new(Some(b)))))
                .collect(),
            ledger_tx,
            commit_gate: RwLock::new(()),
            directory: collaborators.directory,
            days: collaborators.days,
        };
        info!(
            path = %path.display(),
            events = replayed,
            rooms = engine.rooms.len(),
            bookings = engine.bookings.len(),
            "ledger replayed"
        );
        Ok(engine)
    }

    /// Durably record one event via the group-commit writer.
    pub(super) async fn append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.ledger_tx
            .send(LedgerCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("ledger writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("ledger writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub(super) fn booking_slot(&self, id: &Ulid) -> Result<SharedBooking, EngineError> {
        self.bookings
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(Entity::Booking, *id))
    }

    /// Rewrite the ledger as the minimal event list for the current state.
    pub async fn compact_ledger(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events: Vec<Event> = self
            .rooms
            .iter()
            .map(|e| Event::RoomRegistered { room: e.value().clone() })
            .collect();

        for item_id in self.periods.item_ids() {
            let Some(calendar) = self.periods.existing_calendar(&item_id) else {
                continue;
            };
            let guard = calendar.read().await;
            events.extend(
                guard
                    .periods
                    .iter()
                    .filter(|p| p.item_type == ItemType::BookingBlock)
                    .map(|p| Event::BlockAdded { period: p.clone() }),
            );
        }

        let slots: Vec<SharedBooking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            let guard = slot.lock().await;
            let Some(booking) = guard.as_ref() else {
                continue;
            };
            let mut periods = Vec::with_capacity(booking.rooms.len());
            for allocation in &booking.rooms {
                match self.periods.period(&allocation.period_id).await {
                    Some(period) => periods.push(period),
                    None => warn!(booking = %booking.id, period = %allocation.period_id, "allocation without period"),
                }
            }
            let row = booking
                .to_row()
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            events.push(Event::BookingSaved {
                booking: row,
                rooms: booking.rooms.clone(),
                periods,
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.ledger_tx
            .send(LedgerCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("ledger writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("ledger writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        info!(events = count, "ledger compacted");
        Ok(())
    }

    pub async fn ledger_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .ledger_tx
            .send(LedgerCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl RoomCatalog for Engine {
    fn max_occupancy(&self, room_id: &Ulid) -> Result<u32, EngineError> {
        self.rooms
            .get(room_id)
            .map(|r| r.max_occupancy)
            .ok_or(EngineError::NotFound(Entity::Room, *room_id))
    }
}
