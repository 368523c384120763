use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::compactor;
use crate::engine::{
    Confirmation, Engine, EngineContext, EngineError, PlacedReservation, ReservationRequest,
    validate_profile,
};
use crate::limits::*;
use crate::model::{SlotTime, TenantProfile};
use crate::notify::NotifyHub;
use crate::observability;

/// Owns one engine (state + WAL + compactor) per tenant, keyed by slug.
/// Each tenant's log lives at `<data_dir>/<slug>.wal`.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    ctx: EngineContext,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, ctx: EngineContext) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            ctx,
        }
    }

    fn wal_path(&self, slug: &str) -> PathBuf {
        self.data_dir.join(format!("{slug}.wal"))
    }

    fn open_engine(&self, slug: &str) -> Result<Arc<Engine>, EngineError> {
        let engine = Engine::new(self.wal_path(slug), Arc::new(NotifyHub::new()), self.ctx.clone())
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        let engine = Arc::new(engine);
        tokio::spawn(compactor::run_compactor(
            Arc::downgrade(&engine),
            self.compact_threshold,
        ));
        Ok(engine)
    }

    fn publish_count(&self) {
        metrics::gauge!(observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
    }

    /// Provision a new tenant with its profile and settings.
    pub async fn create_tenant(&self, profile: TenantProfile) -> Result<Arc<Engine>, EngineError> {
        validate_profile(&profile)?;
        let slug = profile.slug.clone();
        if self.engines.len() >= MAX_TENANTS {
            return Err(EngineError::LimitExceeded("too many tenants"));
        }
        let engine = match self.engines.entry(slug.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(slug)),
            Entry::Vacant(v) => {
                if self.wal_path(&slug).exists() {
                    return Err(EngineError::AlreadyExists(slug));
                }
                let engine = self.open_engine(&slug)?;
                v.insert(engine.clone());
                engine
            }
        };
        if let Err(e) = engine.configure(profile).await {
            self.engines.remove(&slug);
            let _ = std::fs::remove_file(self.wal_path(&slug));
            return Err(e);
        }
        self.publish_count();
        tracing::info!(tenant = %slug, "tenant created");
        Ok(engine)
    }

    /// Engine for `slug`, loading it from disk on first use.
    pub fn get(&self, slug: &str) -> Result<Arc<Engine>, EngineError> {
        if let Some(engine) = self.engines.get(slug) {
            return Ok(engine.value().clone());
        }
        let valid = !slug.is_empty()
            && slug.len() <= MAX_TENANT_SLUG_LEN
            && slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid || !self.wal_path(slug).exists() {
            return Err(EngineError::TenantNotFound(slug.to_string()));
        }
        let engine = match self.engines.entry(slug.to_string()) {
            Entry::Occupied(o) => o.get().clone(),
            Entry::Vacant(v) => {
                let engine = self.open_engine(slug)?;
                v.insert(engine.clone());
                engine
            }
        };
        self.publish_count();
        Ok(engine)
    }

    /// Remove a tenant with all its items, reservations and log. Sessions
    /// still holding the engine see `TenantNotFound` on their next write.
    pub async fn drop_tenant(&self, slug: &str) -> Result<(), EngineError> {
        let removed = self.engines.remove(slug).map(|(_, engine)| engine);
        let loaded = removed.is_some();
        if let Some(engine) = removed {
            engine.close().await;
        }
        let path = self.wal_path(slug);
        let on_disk = match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(EngineError::WalError(e.to_string())),
        };
        if !loaded && !on_disk {
            return Err(EngineError::TenantNotFound(slug.to_string()));
        }
        self.publish_count();
        tracing::info!(tenant = %slug, "tenant dropped");
        Ok(())
    }

    /// Open every tenant log found in the data directory.
    pub fn load_all(&self) -> io::Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            let Some(slug) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(slug) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(tenant = slug, "skipping tenant log: {e}"),
            }
        }
        Ok(loaded)
    }

    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        slugs.sort();
        slugs
    }

    // ── Public surface routed by tenant slug ─────────────────

    pub async fn compute_availability(
        &self,
        slug: &str,
        date: NaiveDate,
        start: SlotTime,
        end: SlotTime,
    ) -> Result<BTreeMap<Ulid, u32>, EngineError> {
        self.get(slug)?.compute_availability(date, start, end).await
    }

    pub async fn create_pending_reservation(
        &self,
        slug: &str,
        req: ReservationRequest,
    ) -> Result<PlacedReservation, EngineError> {
        self.get(slug)?.create_pending_reservation(req).await
    }

    pub async fn confirm_reservation(
        &self,
        slug: &str,
        token: &str,
        accepted_terms: bool,
    ) -> Result<Confirmation, EngineError> {
        self.get(slug)?.confirm_reservation(token, accepted_terms).await
    }
}
