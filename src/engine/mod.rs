mod bookings;
mod error;
mod expander;
mod rules;

pub use error::{EngineError, ErrorClass};
pub use expander::{check_rule, contains_exact, expand, subtract_booked};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedSubjectState = Arc<RwLock<SubjectState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Owns the WAL. Every append waiting in the channel when the first one
/// arrives joins its batch; the batch is written and fsynced once, and all
/// senders get the same result. A failed batch leaves no record on disk.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut events = vec![event];
        let mut waiters = vec![response];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => {
                    events.push(event);
                    waiters.push(response);
                }
                Ok(other) => {
                    // Flush what we have before compaction or stats see the log.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(events.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = wal.append_batch(&events);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(ref e) = result {
            tracing::error!("WAL flush of {} events failed: {e}", events.len());
        }
        respond_batch(waiters, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn respond_batch(waiters: Vec<oneshot::Sender<io::Result<()>>>, result: &io::Result<()>) {
    for tx in waiters {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Apply an event to a subject's state. Caller holds the lock.
fn apply_to_subject(st: &mut SubjectState, event: &Event, booking_index: &DashMap<Ulid, SubjectId>) {
    match event {
        Event::RulesAdded { rules, .. } => st.rules.extend(rules.iter().cloned()),
        Event::RuleUpdated { rule } => {
            if let Some(existing) = st.rule_mut(rule.id) {
                *existing = rule.clone();
            }
        }
        Event::BookingConfirmed { booking } => {
            booking_index.insert(booking.id, booking.subject_id.clone());
            st.insert_booking(booking.clone());
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = st.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
            }
        }
    }
}

/// In-memory rule and booking store made durable by a write-ahead log.
///
/// Each subject's state sits behind its own lock; writes to one subject never
/// wait on another.
pub struct Engine {
    subjects: DashMap<SubjectId, SharedSubjectState>,
    /// Reverse lookup: booking id → subject id
    booking_to_subject: DashMap<Ulid, SubjectId>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold this shared; compaction holds it exclusively so the
    /// snapshot and the log cannot drift apart.
    write_gate: RwLock<()>,
}

/// Exclusive write scope on one subject.
///
/// Dropping it releases the subject lock on every exit path. State changes
/// only through [`SubjectTxn::commit`], after the event is durable, so an
/// abandoned or failed transaction leaves nothing behind.
pub(super) struct SubjectTxn<'a> {
    engine: &'a Engine,
    _gate: RwLockReadGuard<'a, ()>,
    state: OwnedRwLockWriteGuard<SubjectState>,
}

impl SubjectTxn<'_> {
    pub(super) fn state(&self) -> &SubjectState {
        &self.state
    }

    /// WAL-append, then apply.
    pub(super) async fn commit(&mut self, event: &Event) -> Result<(), EngineError> {
        self.engine.wal_append(event).await?;
        apply_to_subject(&mut self.state, event, &self.engine.booking_to_subject);
        Ok(())
    }
}

impl Drop for SubjectTxn<'_> {
    fn drop(&mut self) {
        if !self.state.rules.is_empty() || !self.state.bookings.is_empty() {
            return;
        }
        // Nothing was committed to a subject `begin` just created. Remove it
        // unless another task holds a handle (the map and this guard are two).
        self.engine
            .subjects
            .remove_if(&self.state.id, |_, shared| Arc::strong_count(shared) == 2);
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_to_subject = DashMap::new();
        let mut replayed: HashMap<SubjectId, SubjectState> = HashMap::new();
        for event in &events {
            let subject = event.subject_id();
            let st = replayed
                .entry(subject.to_string())
                .or_insert_with(|| SubjectState::new(subject.to_string()));
            apply_to_subject(st, event, &booking_to_subject);
        }

        let subjects = DashMap::new();
        for (id, st) in replayed {
            subjects.insert(id, Arc::new(RwLock::new(st)));
        }
        tracing::info!(
            "replayed {} events for {} subjects from {}",
            events.len(),
            subjects.len(),
            wal_path.display()
        );

        Ok(Self {
            subjects,
            booking_to_subject,
            wal_tx,
            write_gate: RwLock::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.len()
    }

    pub fn get_subject(&self, id: &str) -> Option<SharedSubjectState> {
        self.subjects.get(id).map(|e| e.value().clone())
    }

    pub fn subject_for_booking(&self, booking_id: &Ulid) -> Option<SubjectId> {
        self.booking_to_subject.get(booking_id).map(|e| e.value().clone())
    }

    /// Open a write transaction on `subject`, creating its state on first use.
    /// The new state is dropped again if the transaction commits nothing.
    pub(super) async fn begin(&self, subject: &str) -> SubjectTxn<'_> {
        let gate = self.write_gate.read().await;
        let shared = self
            .subjects
            .entry(subject.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(SubjectState::new(subject.to_string()))))
            .value()
            .clone();
        SubjectTxn {
            engine: self,
            _gate: gate,
            state: shared.write_owned().await,
        }
    }

    /// Lookup booking → subject and open a write transaction on it.
    pub(super) async fn begin_for_booking(&self, booking_id: &Ulid) -> Result<SubjectTxn<'_>, EngineError> {
        let subject = self
            .subject_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let gate = self.write_gate.read().await;
        let shared = self
            .get_subject(&subject)
            .ok_or(EngineError::NotFound(*booking_id))?;
        Ok(SubjectTxn {
            engine: self,
            _gate: gate,
            state: shared.write_owned().await,
        })
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.write_gate.write().await;

        let shared: Vec<SharedSubjectState> = self.subjects.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for st in shared {
            let guard = st.read().await;
            if !guard.rules.is_empty() {
                events.push(Event::RulesAdded {
                    subject_id: guard.id.clone(),
                    rules: guard.rules.clone(),
                });
            }
            for booking in &guard.bookings {
                let mut confirmed = booking.clone();
                confirmed.status = BookingStatus::Confirmed;
                events.push(Event::BookingConfirmed { booking: confirmed });
                if !booking.is_confirmed() {
                    events.push(Event::BookingCancelled {
                        id: booking.id,
                        subject_id: booking.subject_id.clone(),
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
