use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use rentcore::dispatch::{DispatchError, Notifier};
use rentcore::engine::EngineContext;
use rentcore::model::Reservation;
use rentcore::ratelimit::FixedWindowLimiter;
use rentcore::server;
use rentcore::tenant::TenantManager;

// ── Test infrastructure ──────────────────────────────────────

/// Keeps every confirmation token the server sends out.
#[derive(Default)]
struct Mailbox {
    tokens: Mutex<Vec<String>>,
    recaps: Mutex<Vec<Ulid>>,
}

impl Mailbox {
    fn last_token(&self) -> String {
        self.tokens.lock().unwrap().last().cloned().expect("no link sent")
    }
}

#[async_trait]
impl Notifier for Mailbox {
    async fn send_confirmation_link(
        &self,
        _address: &str,
        _tenant_slug: &str,
        token: &str,
    ) -> Result<(), DispatchError> {
        self.tokens.lock().unwrap().push(token.to_string());
        Ok(())
    }

    async fn send_booking_recap(
        &self,
        _address: &str,
        reservation: &Reservation,
    ) -> Result<(), DispatchError> {
        self.recaps.lock().unwrap().push(reservation.id);
        Ok(())
    }

    async fn send_admin_notification(
        &self,
        _admin_address: &str,
        _reservation: &Reservation,
    ) -> Result<(), DispatchError> {
        Ok(())
    }
}

async fn start_test_server(rate_limit: u32) -> (SocketAddr, Arc<Mailbox>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("rentcore_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let mailbox = Arc::new(Mailbox::default());
    let ctx = EngineContext {
        notifier: mailbox.clone(),
        ..Default::default()
    };
    let tm = Arc::new(TenantManager::new(dir, 1000, ctx));
    let limiter = Arc::new(FixedWindowLimiter::per_minute(rate_limit));

    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _ = server::process_connection(socket, peer, tm, limiter).await;
            });
        }
    });

    (addr, mailbox)
}

struct Client {
    lines: Framed<TcpStream, LinesCodec>,
    notices: VecDeque<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            lines: Framed::new(socket, LinesCodec::new()),
            notices: VecDeque::new(),
        }
    }

    async fn next_message(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next())
            .await
            .expect("server did not answer")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Send one command and return its reply, setting aside pushed notices.
    async fn query(&mut self, sql: &str) -> Value {
        self.lines.send(sql).await.unwrap();
        loop {
            let msg = self.next_message().await;
            if msg.get("notify").is_some() {
                self.notices.push_back(msg);
            } else {
                return msg;
            }
        }
    }

    async fn ok(&mut self, sql: &str) -> Value {
        let reply = self.query(sql).await;
        assert!(reply.get("error").is_none(), "{sql} failed: {reply}");
        reply
    }

    async fn next_notice(&mut self) -> Value {
        if let Some(n) = self.notices.pop_front() {
            return n;
        }
        self.next_message().await
    }
}

fn error_code(reply: &Value) -> &str {
    reply["error"]["code"].as_str().unwrap_or("")
}

const SETTINGS: &str = r#"{"slots":[{"id":"morning","label":"Morning","start":"09:00","end":"13:00"},{"id":"afternoon","label":"Afternoon","start":"14:00","end":"18:00"}],"full_day_enabled":true}"#;

async fn provision(client: &mut Client, slug: &str, stock: u32) -> Ulid {
    client
        .ok(&format!(
            "INSERT INTO tenants (slug, name, timezone, admin_email, settings) \
             VALUES ('{slug}', 'Lakeside Bikes', 'Europe/Rome', 'desk@lakeside.test', '{SETTINGS}')"
        ))
        .await;
    client.ok(&format!("USE {slug}")).await;
    let item_id = Ulid::new();
    client
        .ok(&format!(
            "INSERT INTO items (id, name, total_stock, broken_count, hourly_cost_cents) \
             VALUES ('{item_id}', 'City bike', {stock}, 0, 1500)"
        ))
        .await;
    item_id
}

fn reserve_sql(item_id: Ulid, slot: &str, quantity: u32) -> String {
    format!(
        "INSERT INTO reservations (item_id, booking_date, slot_id, quantity, name, email, phone) \
         VALUES ('{item_id}', '2099-06-01', '{slot}', {quantity}, 'Ada', 'ada@example.com', NULL)"
    )
}

fn available(reply: &Value, item_id: Ulid) -> u64 {
    reply["rows"]
        .as_array()
        .unwrap()
        .iter()
        .find(|row| row["item_id"] == item_id.to_string())
        .and_then(|row| row["available"].as_u64())
        .expect("item missing from availability")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_confirm_and_look_up_by_code() {
    let (addr, mailbox) = start_test_server(0).await;
    let mut client = Client::connect(addr).await;
    let item_id = provision(&mut client, "lakeside", 2).await;

    let slots = client.ok("SELECT * FROM slots").await;
    let ids: Vec<&str> = slots["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["morning", "afternoon", "full-day"]);

    let placed = client.ok(&reserve_sql(item_id, "morning", 1)).await;
    let row = &placed["rows"][0];
    assert_eq!(row["status"], "pending_confirm");
    assert_eq!(row["quoted_cents"], 6_000);
    assert_eq!(placed["link_dispatched"], true);
    let token = mailbox.last_token();
    assert!(!placed.to_string().contains(&token), "token leaked in reply");

    let avail = client
        .ok("SELECT * FROM availability WHERE booking_date = '2099-06-01' AND slot_id = 'full-day'")
        .await;
    assert_eq!(available(&avail, item_id), 1);

    let confirmed = client
        .ok(&format!("INSERT INTO confirmations (token, accepted_terms) VALUES ('{token}', true)"))
        .await;
    assert_eq!(confirmed["already_confirmed"], false);
    let code = confirmed["rows"][0]["booking_code"].as_str().unwrap().to_string();
    assert_eq!(mailbox.recaps.lock().unwrap().len(), 1);

    let again = client
        .ok(&format!("INSERT INTO confirmations (token, accepted_terms) VALUES ('{token}', true)"))
        .await;
    assert_eq!(again["already_confirmed"], true);
    assert_eq!(again["rows"][0]["booking_code"], code.as_str());
    assert_eq!(mailbox.recaps.lock().unwrap().len(), 1);

    let found = client
        .ok(&format!("SELECT * FROM reservations WHERE booking_code = '{code}'"))
        .await;
    assert_eq!(found["rows"][0]["status"], "confirmed");
}

#[tokio::test]
async fn last_unit_goes_to_one_customer() {
    let (addr, _mailbox) = start_test_server(0).await;
    let mut admin = Client::connect(addr).await;
    let item_id = provision(&mut admin, "lastunit", 1).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        tasks.push(tokio::spawn(async move {
            let mut c = Client::connect(addr).await;
            c.ok("USE lastunit").await;
            c.query(&reserve_sql(item_id, "morning", 1)).await
        }));
    }
    let mut won = 0;
    for task in tasks {
        let reply = task.await.unwrap();
        if reply.get("error").is_none() {
            won += 1;
        } else {
            assert_eq!(error_code(&reply), "capacity_exceeded");
        }
    }
    assert_eq!(won, 1);
}

#[tokio::test]
async fn listen_receives_reservation_notices() {
    let (addr, _mailbox) = start_test_server(0).await;
    let mut watcher = Client::connect(addr).await;
    let item_id = provision(&mut watcher, "watched", 3).await;
    watcher.ok(&format!("LISTEN item_{item_id}")).await;

    let mut customer = Client::connect(addr).await;
    customer.ok("USE watched").await;
    let placed = customer.ok(&reserve_sql(item_id, "afternoon", 1)).await;

    let notice = watcher.next_notice().await;
    assert_eq!(notice["notify"]["channel"], format!("item_{item_id}"));
    assert_eq!(notice["notify"]["notice"]["kind"], "reservation_placed");
    assert_eq!(notice["notify"]["notice"]["entity_id"], placed["rows"][0]["id"]);

    watcher.ok("UNLISTEN *").await;
    watcher.ok("SELECT * FROM items").await;
}

#[tokio::test]
async fn admin_lifecycle_over_the_wire() {
    let (addr, mailbox) = start_test_server(0).await;
    let mut client = Client::connect(addr).await;
    let item_id = provision(&mut client, "admin", 1).await;

    let placed = client.ok(&reserve_sql(item_id, "morning", 1)).await;
    let id = placed["rows"][0]["id"].as_str().unwrap().to_string();

    let reply = client
        .query(&format!("INSERT INTO status_changes (id, status) VALUES ('{id}', 'completed')"))
        .await;
    assert_eq!(error_code(&reply), "invalid_state");

    let token = mailbox.last_token();
    client
        .ok(&format!("INSERT INTO confirmations VALUES ('{token}', true)"))
        .await;
    let paid = client
        .ok(&format!("INSERT INTO payments (id, amount_cents) VALUES ('{id}', 6000)"))
        .await;
    assert_eq!(paid["rows"][0]["paid_cents"], 6_000);

    let reply = client.query(&format!("DELETE FROM items WHERE id = '{item_id}'")).await;
    assert_eq!(error_code(&reply), "invalid_state");

    let cancelled = client.ok(&format!("DELETE FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(cancelled["rows"][0]["status"], "cancelled");
    client.ok(&format!("DELETE FROM items WHERE id = '{item_id}'")).await;
    let items = client.ok("SELECT * FROM items").await;
    assert_eq!(items["rows"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn errors_are_reported_per_line() {
    let (addr, _mailbox) = start_test_server(0).await;
    let mut client = Client::connect(addr).await;

    let reply = client.query("SELECT * FROM items").await;
    assert_eq!(error_code(&reply), "validation_error");

    let reply = client.query("USE nowhere").await;
    assert_eq!(error_code(&reply), "not_found");

    let reply = client.query("THIS IS NOT A COMMAND").await;
    assert_eq!(error_code(&reply), "syntax_error");

    let reply = client.query("INSERT INTO confirmations VALUES ('bogus', true)").await;
    assert_eq!(error_code(&reply), "validation_error");

    // The connection survives every error above.
    let item_id = provision(&mut client, "survivor", 1).await;
    let reply = client.query(&reserve_sql(item_id, "evening", 1)).await;
    assert_eq!(error_code(&reply), "validation_error");
    let reply = client
        .query("INSERT INTO confirmations VALUES ('bogus', true)")
        .await;
    assert_eq!(error_code(&reply), "not_found");
}

#[tokio::test]
async fn customer_writes_are_rate_limited() {
    let (addr, _mailbox) = start_test_server(2).await;
    let mut client = Client::connect(addr).await;
    let item_id = provision(&mut client, "limited", 10).await;

    client.ok(&reserve_sql(item_id, "morning", 1)).await;
    client.ok(&reserve_sql(item_id, "morning", 1)).await;
    let reply = client.query(&reserve_sql(item_id, "morning", 1)).await;
    assert_eq!(error_code(&reply), "rate_limited");

    // Reads are not limited.
    client.ok("SELECT * FROM items").await;
}

#[tokio::test]
async fn tenants_are_isolated_over_the_wire() {
    let (addr, _mailbox) = start_test_server(0).await;
    let mut a = Client::connect(addr).await;
    let item_id = provision(&mut a, "tenant-a", 1).await;

    let mut b = Client::connect(addr).await;
    provision(&mut b, "tenant-b", 1).await;
    let reply = b
        .query(&format!("SELECT * FROM reservations WHERE item_id = '{item_id}'"))
        .await;
    assert_eq!(error_code(&reply), "not_found");

    let reply = b
        .query(r#"INSERT INTO tenants (slug, name, timezone) VALUES ('tenant-a', 'Dup', 'UTC')"#)
        .await;
    assert_eq!(error_code(&reply), "already_exists");
}

#[tokio::test]
async fn dropped_tenant_stops_other_sessions() {
    let (addr, _mailbox) = start_test_server(0).await;
    let mut shop = Client::connect(addr).await;
    let item_id = provision(&mut shop, "pier", 2).await;

    let mut admin = Client::connect(addr).await;
    admin.ok("DELETE FROM tenants WHERE slug = 'pier'").await;

    let reply = shop.query(&reserve_sql(item_id, "morning", 1)).await;
    assert_eq!(error_code(&reply), "not_found");
    let reply = shop.query("SELECT * FROM items").await;
    assert_eq!(error_code(&reply), "not_found");

    // Re-created under the same slug it starts empty.
    admin
        .ok(&format!(
            "INSERT INTO tenants (slug, name, timezone, admin_email, settings) \
             VALUES ('pier', 'Pier Kayaks', 'Europe/Rome', NULL, '{SETTINGS}')"
        ))
        .await;
    shop.ok("USE pier").await;
    let reply = shop.ok("SELECT * FROM items").await;
    assert!(reply["rows"].as_array().unwrap().is_empty());
}
