use serde::Serialize;
use ulid::Ulid;

use crate::engine::now_ms;
use crate::model::Ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Customer,
    Admin,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub action: &'static str,
    pub actor: Actor,
    pub tenant: String,
    pub entity_id: Option<Ulid>,
    pub at: Ms,
}

impl AuditEvent {
    pub fn new(action: &'static str, actor: Actor, tenant: &str, entity_id: Option<Ulid>) -> Self {
        Self {
            action,
            actor,
            tenant: tenant.to_string(),
            entity_id,
            at: now_ms(),
        }
    }
}

/// Best-effort audit trail. Implementations must not block or panic;
/// a lost record never fails the operation that produced it.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits audit records as structured log lines under the `audit` target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            action = event.action,
            actor = ?event.actor,
            tenant = %event.tenant,
            entity = ?event.entity_id,
            at = event.at,
            "audit"
        );
    }
}
