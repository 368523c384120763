//! JSON-lines front end.
//!
//! Each request is one line of SQL-ish text (see [`crate::sql`]); each reply
//! is one JSON object on its own line:
//!
//! - `{"tag":"INSERT 1"}` for writes without a result set
//! - `{"rows":[...]}` for reads, plus extra flags on reservation writes
//! - `{"error":{"code":"...","message":"..."}}` on failure
//! - `{"notify":{"channel":"...","notice":{...}}}` pushed for `LISTEN`
//!
//! A connection selects its tenant with `USE <slug>`; tenant provisioning
//! (`INSERT INTO tenants`, `DELETE FROM tenants`) works without one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{Confirmation, Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::notify::{Notice, Topic};
use crate::observability;
use crate::ratelimit::FixedWindowLimiter;
use crate::sql::{self, AvailabilityWindow, Command, ReservationFilter};
use crate::tenant::TenantManager;

const NOTICE_QUEUE: usize = 256;

/// Reservation as shown to clients. The confirmation token is never
/// echoed back: it only travels through the notifier.
#[derive(Debug, Serialize)]
pub struct ReservationView<'a> {
    pub id: Ulid,
    pub item_id: Ulid,
    pub date: chrono::NaiveDate,
    pub slot_id: &'a str,
    pub start: Ms,
    pub end: Ms,
    pub quantity: u32,
    pub status: &'static str,
    pub expires_at: Option<Ms>,
    pub booking_code: Option<&'a str>,
    pub customer: &'a CustomerContact,
    pub created_at: Ms,
    pub terms_accepted_at: Option<Ms>,
    pub quoted_cents: Option<u64>,
    pub paid_cents: u64,
}

impl<'a> From<&'a Reservation> for ReservationView<'a> {
    fn from(r: &'a Reservation) -> Self {
        Self {
            id: r.id,
            item_id: r.item_id,
            date: r.date,
            slot_id: &r.slot_id,
            start: r.span.start,
            end: r.span.end,
            quantity: r.quantity,
            status: r.status.label(),
            expires_at: r.status.expires_at(),
            booking_code: r.booking_code.as_deref(),
            customer: &r.customer,
            created_at: r.created_at,
            terms_accepted_at: r.terms_accepted_at,
            quoted_cents: r.quoted_cents,
            paid_cents: r.paid_cents,
        }
    }
}

fn tag(tag: &str) -> Value {
    json!({ "tag": tag })
}

fn error_reply(code: &str, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message } })
}

fn reservation_rows(reservations: &[Reservation]) -> Value {
    let rows: Vec<ReservationView<'_>> = reservations.iter().map(ReservationView::from).collect();
    json!({ "rows": rows })
}

/// Commands a customer can fire anonymously; these count against the
/// per-IP limiter.
fn is_rate_limited(cmd: &Command) -> bool {
    matches!(
        cmd,
        Command::InsertReservation { .. }
            | Command::InsertConfirmation { .. }
            | Command::InsertLinkRequest { .. }
    )
}

/// Per-connection state.
struct Session {
    peer: SocketAddr,
    tenants: Arc<TenantManager>,
    limiter: Arc<FixedWindowLimiter>,
    engine: Option<Arc<Engine>>,
    listeners: HashMap<Topic, JoinHandle<()>>,
    notice_tx: mpsc::Sender<(String, Notice)>,
}

impl Session {
    fn engine(&self) -> Result<Arc<Engine>, EngineError> {
        let engine = self
            .engine
            .clone()
            .ok_or_else(|| EngineError::Validation("no tenant selected, send USE <tenant> first".into()))?;
        if engine.is_closed() {
            return Err(EngineError::TenantNotFound(engine.name().to_string()));
        }
        Ok(engine)
    }

    fn listen(&mut self, engine: &Engine, topic: Topic) {
        if self.listeners.contains_key(&topic) {
            return;
        }
        let mut rx = engine.notify.subscribe(topic);
        let tx = self.notice_tx.clone();
        let channel = topic.channel_name();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notice) => {
                        if tx.send((channel.clone(), notice)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped, "listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.insert(topic, handle);
    }

    fn unlisten(&mut self, topic: &Topic) {
        if let Some(handle) = self.listeners.remove(topic) {
            handle.abort();
        }
    }

    fn unlisten_all(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }

    async fn handle_line(&mut self, line: &str) -> Value {
        let cmd = match sql::parse_sql(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::COMMANDS_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                return error_reply(e.code(), &e.to_string());
            }
        };
        let label = observability::command_label(&cmd);

        if is_rate_limited(&cmd) && !self.limiter.record_attempt(self.peer.ip()) {
            metrics::counter!(observability::RATE_LIMITED_TOTAL, "command" => label).increment(1);
            tracing::warn!(peer = %self.peer, command = label, "rate limited");
            return error_reply("rate_limited", "too many requests, try again later");
        }

        let started = Instant::now();
        let result = self.execute(cmd).await;
        metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => status)
            .increment(1);

        match result {
            Ok(reply) => reply,
            Err(e) => {
                if let EngineError::WalError(detail) = &e {
                    tracing::error!(peer = %self.peer, command = label, "storage failure: {detail}");
                } else {
                    tracing::debug!(peer = %self.peer, command = label, "command failed: {e}");
                }
                error_reply(e.code(), &e.user_message())
            }
        }
    }

    async fn execute(&mut self, cmd: Command) -> Result<Value, EngineError> {
        match cmd {
            Command::Use { tenant } => {
                let engine = self.tenants.get(&tenant)?;
                self.unlisten_all();
                self.engine = Some(engine);
                Ok(tag("USE"))
            }
            Command::InsertTenant { profile } => {
                self.tenants.create_tenant(profile).await?;
                Ok(tag("INSERT 1"))
            }
            Command::DeleteTenant { slug } => {
                if self.engine.as_ref().is_some_and(|e| e.name() == slug) {
                    self.unlisten_all();
                    self.engine = None;
                }
                self.tenants.drop_tenant(&slug).await?;
                Ok(tag("DELETE 1"))
            }
            Command::Listen { channel } => {
                let engine = self.engine()?;
                let topic = Topic::parse(&channel).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "invalid channel {channel:?}, expected item_<id> or all"
                    ))
                })?;
                self.listen(&engine, topic);
                Ok(tag("LISTEN"))
            }
            Command::Unlisten { channel } => {
                let topic = Topic::parse(&channel).ok_or_else(|| {
                    EngineError::Validation(format!("invalid channel {channel:?}"))
                })?;
                self.unlisten(&topic);
                Ok(tag("UNLISTEN"))
            }
            Command::UnlistenAll => {
                self.unlisten_all();
                Ok(tag("UNLISTEN"))
            }
            Command::UpdateSettings { settings } => {
                let profile = self.engine()?.update_settings(settings).await?;
                Ok(json!({ "tag": "UPDATE 1", "rows": [profile.settings] }))
            }
            Command::InsertItem { item, upsert } => {
                let engine = self.engine()?;
                if upsert && engine.fetch_item(item.id).await.is_ok() {
                    engine.update_item(item).await?;
                    Ok(tag("UPDATE 1"))
                } else {
                    engine.create_item(item).await?;
                    Ok(tag("INSERT 1"))
                }
            }
            Command::DeleteItem { id } => {
                self.engine()?.delete_item(id).await?;
                Ok(tag("DELETE 1"))
            }
            Command::SelectItems => {
                let items = self.engine()?.list_items().await;
                let rows: Vec<Value> = items
                    .iter()
                    .map(|item| {
                        json!({
                            "id": item.id,
                            "name": item.name,
                            "total_stock": item.total_stock,
                            "broken_count": item.broken_count,
                            "sellable": item.sellable(),
                            "hourly_cost_cents": item.hourly_cost_cents,
                        })
                    })
                    .collect();
                Ok(json!({ "rows": rows }))
            }
            Command::SelectSlots => {
                let slots = self.engine()?.resolved_slots().await?;
                Ok(json!({ "rows": slots }))
            }
            Command::SelectAvailability { date, window } => {
                let engine = self.engine()?;
                let available = match window {
                    AvailabilityWindow::Slot(slot_id) => {
                        engine.availability_for_slot(date, &slot_id).await?
                    }
                    AvailabilityWindow::Interval { start, end } => {
                        engine.compute_availability(date, start, end).await?
                    }
                };
                let rows: Vec<Value> = available
                    .into_iter()
                    .map(|(item_id, available)| json!({ "item_id": item_id, "available": available }))
                    .collect();
                Ok(json!({ "rows": rows }))
            }
            Command::SelectReservations { filter } => {
                let engine = self.engine()?;
                let reservations = match filter {
                    ReservationFilter::Item(item_id) => engine.reservations_for_item(item_id).await?,
                    ReservationFilter::Id(id) => vec![engine.get_reservation(id).await?],
                    ReservationFilter::BookingCode(code) => {
                        vec![engine.reservation_by_code(&code).await?]
                    }
                };
                Ok(reservation_rows(&reservations))
            }
            Command::InsertReservation { request } => {
                let placed = self.engine()?.create_pending_reservation(request).await?;
                let mut reply = reservation_rows(std::slice::from_ref(&placed.reservation));
                reply["tag"] = json!("INSERT 1");
                reply["link_dispatched"] = json!(placed.link_dispatched);
                Ok(reply)
            }
            Command::InsertConfirmation {
                token,
                accepted_terms,
            } => {
                let confirmation = self
                    .engine()?
                    .confirm_reservation(&token, accepted_terms)
                    .await?;
                let mut reply = reservation_rows(std::slice::from_ref(confirmation.reservation()));
                let tag = match confirmation {
                    Confirmation::Confirmed(_) => "INSERT 1",
                    Confirmation::AlreadyConfirmed(_) => "INSERT 0",
                };
                reply["tag"] = json!(tag);
                reply["already_confirmed"] = json!(confirmation.already_confirmed());
                Ok(reply)
            }
            Command::InsertStatusChange { id, status } => {
                let reservation = self.engine()?.transition_reservation(id, status).await?;
                Ok(reservation_rows(&[reservation]))
            }
            Command::InsertPayment { id, amount_cents } => {
                let reservation = self.engine()?.record_payment(id, amount_cents).await?;
                Ok(reservation_rows(&[reservation]))
            }
            Command::InsertLinkRequest { id } => {
                let sent = self.engine()?.resend_confirmation_link(id).await?;
                Ok(json!({ "tag": "INSERT 1", "link_dispatched": sent }))
            }
            Command::DeleteReservation { id } => {
                let reservation = self.engine()?.cancel_reservation(id).await?;
                Ok(reservation_rows(&[reservation]))
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.unlisten_all();
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    peer: SocketAddr,
    tenants: Arc<TenantManager>,
    limiter: Arc<FixedWindowLimiter>,
) -> anyhow::Result<()> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (notice_tx, mut notice_rx) = mpsc::channel(NOTICE_QUEUE);
    let mut session = Session {
        peer,
        tenants,
        limiter,
        engine: None,
        listeners: HashMap::new(),
        notice_tx,
    };

    loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        lines.send(error_reply("limit_exceeded", "line too long").to_string()).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = session.handle_line(&line).await;
                lines.send(reply.to_string()).await?;
            }
            Some((channel, notice)) = notice_rx.recv() => {
                let push = json!({ "notify": { "channel": channel, "notice": notice } });
                lines.send(push.to_string()).await?;
            }
        }
    }
    tracing::debug!(peer = %peer, "client disconnected");
    Ok(())
}
