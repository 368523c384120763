use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. Every absolute instant in the engine uses this.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Slots ────────────────────────────────────────────────────────

/// Local wall-clock time with minute precision, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotTime {
    minutes: u16,
}

impl SlotTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            minutes: hour as u16 * 60 + minute as u16,
        })
    }

    pub fn hour(&self) -> u32 {
        (self.minutes / 60) as u32
    }

    pub fn minute(&self) -> u32 {
        (self.minutes % 60) as u32
    }

    pub fn to_naive_time(self) -> NaiveTime {
        // hour/minute are range-checked at construction
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0).unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for SlotTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return Err(format!("invalid time {s:?}: expected HH:MM"));
        }
        let digits = |a: u8, b: u8| -> Option<u8> {
            if a.is_ascii_digit() && b.is_ascii_digit() {
                Some((a - b'0') * 10 + (b - b'0'))
            } else {
                None
            }
        };
        let hour = digits(bytes[0], bytes[1]);
        let minute = digits(bytes[3], bytes[4]);
        match (hour, minute) {
            (Some(h), Some(m)) => {
                SlotTime::new(h, m).ok_or_else(|| format!("invalid time {s:?}: out of range"))
            }
            _ => Err(format!("invalid time {s:?}: expected HH:MM")),
        }
    }
}

impl TryFrom<String> for SlotTime {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SlotTime> for String {
    fn from(value: SlotTime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// A named wall-clock interval applied to any calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDefinition {
    pub id: String,
    pub label: String,
    pub start: SlotTime,
    pub end: SlotTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TenantSettings {
    #[serde(default)]
    pub slots: Vec<SlotDefinition>,
    #[serde(default)]
    pub full_day_enabled: bool,
    #[serde(default)]
    pub min_advance_hours: u32,
    #[serde(default)]
    pub blocked_dates: Vec<NaiveDate>,
}

impl TenantSettings {
    pub fn is_blocked(&self, date: NaiveDate) -> bool {
        self.blocked_dates.contains(&date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantProfile {
    pub slug: String,
    pub name: String,
    /// IANA zone name, e.g. `Europe/Rome`.
    pub timezone: String,
    pub admin_email: Option<String>,
    pub settings: TenantSettings,
}

// ── Inventory ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: Ulid,
    pub name: String,
    pub total_stock: u32,
    /// Units out for maintenance. Never exceeds `total_stock`.
    pub broken_count: u32,
    pub hourly_cost_cents: Option<u64>,
}

impl InventoryItem {
    /// Units that can be rented at all, before any reservation is counted.
    pub fn sellable(&self) -> u32 {
        self.total_stock.saturating_sub(self.broken_count)
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

/// Lifecycle of a reservation.
///
/// ```text
/// PendingConfirm ──► Confirmed ──► Completed | NoShow | Paid
///       │                │
///       └──► Cancelled ◄─┘
/// ```
///
/// The confirmation token only exists inside `PendingConfirm`; once the
/// reservation leaves that state the token is gone from the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    PendingConfirm { token: String, expires_at: Ms },
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
    Paid,
}

impl ReservationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ReservationStatus::PendingConfirm { .. } => "pending_confirm",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
            ReservationStatus::NoShow => "no_show",
            ReservationStatus::Paid => "paid",
        }
    }

    pub fn expires_at(&self) -> Option<Ms> {
        match self {
            ReservationStatus::PendingConfirm { expires_at, .. } => Some(*expires_at),
            _ => None,
        }
    }

    /// Whether an administrative move to `next` is allowed from here.
    /// Confirmation is not an administrative move and never goes through here.
    pub fn can_transition_to(&self, next: TerminalStatus) -> bool {
        match (self, next) {
            (ReservationStatus::PendingConfirm { .. }, TerminalStatus::Cancelled) => true,
            (ReservationStatus::PendingConfirm { .. }, _) => false,
            (ReservationStatus::Confirmed, _) => true,
            (
                ReservationStatus::Cancelled
                | ReservationStatus::Completed
                | ReservationStatus::NoShow
                | ReservationStatus::Paid,
                _,
            ) => false,
        }
    }
}

/// States reachable through administrative action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalStatus {
    Cancelled,
    Completed,
    NoShow,
    Paid,
}

impl TerminalStatus {
    pub fn label(&self) -> &'static str {
        self.as_status().label()
    }

    pub fn as_status(self) -> ReservationStatus {
        match self {
            TerminalStatus::Cancelled => ReservationStatus::Cancelled,
            TerminalStatus::Completed => ReservationStatus::Completed,
            TerminalStatus::NoShow => ReservationStatus::NoShow,
            TerminalStatus::Paid => ReservationStatus::Paid,
        }
    }
}

impl FromStr for TerminalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cancelled" | "canceled" => Ok(TerminalStatus::Cancelled),
            "completed" => Ok(TerminalStatus::Completed),
            "no_show" | "no-show" => Ok(TerminalStatus::NoShow),
            "paid" => Ok(TerminalStatus::Paid),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub item_id: Ulid,
    pub span: Span,
    /// Calendar date and slot the customer picked; `span` is derived from them.
    pub date: NaiveDate,
    pub slot_id: String,
    pub quantity: u32,
    pub customer: CustomerContact,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub booking_code: Option<String>,
    pub terms_accepted_at: Option<Ms>,
    pub quoted_cents: Option<u64>,
    pub paid_cents: u64,
}

/// Everything the engine holds for one inventory item.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub item: InventoryItem,
    /// Every reservation ever placed on this item, sorted by `span.start`.
    /// Expired holds and terminal rows stay here; they are filtered on read.
    pub reservations: Vec<Reservation>,
}

impl ItemState {
    pub fn new(item: InventoryItem) -> Self {
        Self {
            item,
            reservations: Vec::new(),
        }
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps `query`, in start order.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything from right_bound on starts at or after query.end.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// WAL record format. Flat on purpose: one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TenantConfigured {
        profile: TenantProfile,
    },
    ItemCreated {
        item: InventoryItem,
    },
    ItemUpdated {
        item: InventoryItem,
    },
    ItemDeleted {
        id: Ulid,
    },
    /// `token` is the confirmation token issued for this reservation. During
    /// compaction the reservation may already be past pending; the token is
    /// still recorded so a repeated confirm stays idempotent.
    ReservationPlaced {
        reservation: Reservation,
        token: String,
    },
    ReservationConfirmed {
        id: Ulid,
        item_id: Ulid,
        booking_code: String,
        accepted_at: Ms,
    },
    ReservationStatusChanged {
        id: Ulid,
        item_id: Ulid,
        status: TerminalStatus,
    },
    PaymentRecorded {
        id: Ulid,
        item_id: Ulid,
        amount_cents: u64,
    },
}

impl Event {
    /// Short name used for change notifications and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TenantConfigured { .. } => "tenant_configured",
            Event::ItemCreated { .. } => "item_created",
            Event::ItemUpdated { .. } => "item_updated",
            Event::ItemDeleted { .. } => "item_deleted",
            Event::ReservationPlaced { .. } => "reservation_placed",
            Event::ReservationConfirmed { .. } => "reservation_confirmed",
            Event::ReservationStatusChanged { .. } => "reservation_status_changed",
            Event::PaymentRecorded { .. } => "payment_recorded",
        }
    }

    /// The inventory item this event touches, if any.
    pub fn item_id(&self) -> Option<Ulid> {
        match self {
            Event::TenantConfigured { .. } => None,
            Event::ItemCreated { item } | Event::ItemUpdated { item } => Some(item.id),
            Event::ItemDeleted { id } => Some(*id),
            Event::ReservationPlaced { reservation, .. } => Some(reservation.item_id),
            Event::ReservationConfirmed { item_id, .. }
            | Event::ReservationStatusChanged { item_id, .. }
            | Event::PaymentRecorded { item_id, .. } => Some(*item_id),
        }
    }
}
