mod availability;
mod booking;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{HoldPolicy, counts_toward_capacity, remaining_capacity, reserved_quantity};
pub use booking::{Confirmation, PlacedReservation, ReservationRequest};
pub use conflict::now_ms;
pub use error::EngineError;
pub(crate) use mutations::validate_profile;
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::dispatch::{LogNotifier, Notifier};
use crate::limits::DEFAULT_HOLD_TTL_MS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedItemState = Arc<RwLock<ItemState>>;

/// Collaborators and knobs shared by every tenant engine.
#[derive(Clone)]
pub struct EngineContext {
    pub hold_ttl_ms: Ms,
    pub notifier: Arc<dyn Notifier>,
    pub audit: Arc<dyn AuditSink>,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            hold_ttl_ms: DEFAULT_HOLD_TTL_MS,
            notifier: Arc::new(LogNotifier),
            audit: Arc::new(TracingAuditSink),
        }
    }
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
    /// Refuse every later append and compaction. Sent when the tenant is dropped.
    Close {
        response: oneshot::Sender<()>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that queue up while a flush
/// is running are written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut closed = false;
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd, &mut closed);
            continue;
        };
        if closed {
            let _ = response.send(Err(closed_error()));
            continue;
        }
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd, &mut closed);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so partial bytes don't leak into the
    // next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "tenant log closed")
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand, closed: &mut bool) {
    match cmd {
        WalCommand::Compact { response, .. } if *closed => {
            let _ = response.send(Err(closed_error()));
        }
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(if *closed { 0 } else { wal.appends_since_compact() });
        }
        WalCommand::Append { response, .. } if *closed => {
            let _ = response.send(Err(closed_error()));
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
        WalCommand::Close { response } => {
            *closed = true;
            let _ = response.send(());
        }
    }
}

/// One tenant's reservation engine.
pub struct Engine {
    name: String,
    pub(super) store: InMemoryStore,
    /// Also serializes structural changes (items, settings) against compaction.
    pub(super) profile: RwLock<Option<TenantProfile>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) ctx: EngineContext,
    closed: AtomicBool,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, ctx: EngineContext) -> io::Result<Self> {
        let name = wal_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        // Nothing else can see these locks yet, so try_read/try_write always
        // succeed. Never block here: this may run inside the runtime.
        let store = InMemoryStore::new();
        let mut profile = None;
        for event in &events {
            match event {
                Event::TenantConfigured { profile: p } => profile = Some(p.clone()),
                Event::ItemCreated { item } => store.insert_item(ItemState::new(item.clone())),
                Event::ItemDeleted { id } => {
                    if let Some(shared) = store.get_item(id)
                        && let Ok(guard) = shared.try_read()
                    {
                        store.remove_item(&guard);
                    }
                }
                other => {
                    if let Some(item_id) = other.item_id()
                        && let Some(shared) = store.get_item(&item_id)
                        && let Ok(mut guard) = shared.try_write()
                    {
                        store.apply_event(&mut guard, other);
                    }
                }
            }
        }
        tracing::debug!(tenant = %name, events = events.len(), items = store.item_count(), "replayed WAL");

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            name,
            store,
            profile: RwLock::new(profile),
            wal_tx,
            notify,
            ctx,
            closed: AtomicBool::new(false),
        })
    }

    /// Stop accepting writes. Appends already queued are flushed first; every
    /// later write fails with `TenantNotFound`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if self.wal_tx.send(WalCommand::Close { response: tx }).await.is_ok() {
            let _ = rx.await;
        }
        tracing::debug!(tenant = %self.name, "engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(super) fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::TenantNotFound(self.name.clone()));
        }
        Ok(())
    }

    /// Map a writer failure, reporting a closed log as a missing tenant.
    pub(super) fn wal_failure(&self, e: io::Error) -> EngineError {
        if self.is_closed() {
            EngineError::TenantNotFound(self.name.clone())
        } else {
            EngineError::WalError(e.to_string())
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.ensure_open()?;
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
            .map_err(|e| self.wal_failure(e))
    }

    /// Durable append, then apply to the locked item, then notify listeners.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut ItemState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(state, event);
        self.notify.send(event);
        Ok(())
    }

    /// Durable append + notify for events applied at map level.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.notify.send(event);
        Ok(())
    }

    pub(super) async fn require_profile(&self) -> Result<TenantProfile, EngineError> {
        self.ensure_open()?;
        self.profile
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::TenantNotFound(self.name.clone()))
    }

    pub(super) fn shared_item(&self, id: &Ulid) -> Result<SharedItemState, EngineError> {
        self.store.get_item(id).ok_or(EngineError::ItemNotFound(*id))
    }

    /// Write-lock the item that owns `reservation_id`.
    pub(super) async fn lock_reservation_item(
        &self,
        reservation_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ItemState>, EngineError> {
        let item_id = self
            .store
            .item_for_reservation(&reservation_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))?;
        let shared = self.shared_item(&item_id)?;
        let guard = shared.write_owned().await;
        // The item may have been deleted while we waited.
        if !self.store.contains_item(&item_id) {
            return Err(EngineError::ReservationNotFound(reservation_id));
        }
        Ok(guard)
    }

    /// Tenant slug this engine was opened for.
    pub fn name(&self) -> &str {
        &self.name
    }
}
