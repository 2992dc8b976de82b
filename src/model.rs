use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Only used for record timestamps; rental ranges are calendar days.
pub type Ms = i64;

/// Authenticated caller, as resolved by the wire layer (login name).
pub type UserId = String;

/// Amount in minor currency units (e.g. cents).
pub type Money = i64;

/// Closed calendar-day range `[start, end]`. Both endpoints are rented days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Days billed for this range, counting both endpoints.
    pub fn billable_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Closed-interval overlap against a possibly unbounded window.
    pub fn overlaps(&self, window: &Window) -> bool {
        window.end.is_none_or(|end| self.start <= end)
            && window.start.is_none_or(|start| self.end >= start)
    }
}

/// Query window. A missing bound is unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl Window {
    pub const UNBOUNDED: Window = Window { start: None, end: None };

    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }
}

impl From<DateRange> for Window {
    fn from(range: DateRange) -> Self {
        Self {
            start: Some(range.start),
            end: Some(range.end),
        }
    }
}

/// Rental lifecycle. `Ended` and `OwnerConfirmed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RentalStatus {
    Active,
    /// Returned early by the renter.
    Ended,
    /// Owner confirmed the item came back.
    OwnerConfirmed,
}

impl RentalStatus {
    pub fn is_active(self) -> bool {
        self == RentalStatus::Active
    }

    pub fn owner_received(self) -> bool {
        self == RentalStatus::OwnerConfirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rental {
    pub id: Ulid,
    pub item_id: Ulid,
    pub renter_id: UserId,
    pub range: DateRange,
    pub quantity: u32,
    pub total_price: Money,
    pub status: RentalStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Rental {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// In-memory state of one item, including every rental ever made against it.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub id: Ulid,
    pub owner_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub price_per_day: Money,
    pub total_stock: u32,
    /// Denormalized counter. Never used as the capacity gate.
    pub available_stock: u32,
    pub is_active: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Rentals sorted by `range.start`. Terminal rentals stay as history.
    pub rentals: Vec<Rental>,
    /// Number of entries in `rentals` still ACTIVE.
    active_rentals: usize,
}

impl ItemState {
    pub fn new(id: Ulid, owner_id: UserId, name: String, total_stock: u32, price_per_day: Money) -> Self {
        Self {
            id,
            owner_id,
            name,
            description: None,
            price_per_day,
            total_stock,
            available_stock: total_stock,
            is_active: true,
            created_at: 0,
            updated_at: 0,
            rentals: Vec::new(),
            active_rentals: 0,
        }
    }

    /// Insert rental maintaining sort order by range.start.
    pub fn insert_rental(&mut self, rental: Rental) {
        let pos = self
            .rentals
            .partition_point(|r| r.range.start <= rental.range.start);
        if rental.is_active() {
            self.active_rentals += 1;
        }
        self.rentals.insert(pos, rental);
    }

    pub fn rental(&self, id: &Ulid) -> Option<&Rental> {
        self.rentals.iter().find(|r| r.id == *id)
    }

    /// Move an ACTIVE rental to a terminal status. Returns the quantity to
    /// restore, or `None` if the rental is missing or already terminal.
    pub fn close_rental(&mut self, id: &Ulid, status: RentalStatus, at: Ms) -> Option<u32> {
        let rental = self.rentals.iter_mut().find(|r| r.id == *id)?;
        if !rental.is_active() || status.is_active() {
            return None;
        }
        rental.status = status;
        rental.updated_at = at;
        self.active_rentals -= 1;
        Some(rental.quantity)
    }

    /// Active rentals whose range overlaps the window.
    /// Uses binary search to skip rentals starting after `window.end`.
    pub fn overlapping_active(&self, window: &Window) -> impl Iterator<Item = &Rental> {
        let right_bound = match window.end {
            Some(end) => self.rentals.partition_point(|r| r.range.start <= end),
            None => self.rentals.len(),
        };
        let window = *window;
        self.rentals[..right_bound]
            .iter()
            .filter(move |r| r.is_active() && r.range.overlaps(&window))
    }

    pub fn has_active_rentals(&self) -> bool {
        self.active_rentals > 0
    }

    pub fn active_rental_count(&self) -> usize {
        self.active_rentals
    }

    /// Take `quantity` off the cached counter. Refuses (and changes nothing)
    /// when the counter is lower than `quantity`.
    pub fn decrease_stock(&mut self, quantity: u32) -> bool {
        if self.available_stock < quantity {
            return false;
        }
        self.available_stock -= quantity;
        true
    }

    /// Put `quantity` back on the cached counter, clamped to `total_stock`.
    /// Returns true if the clamp kicked in.
    pub fn increase_stock(&mut self, quantity: u32) -> bool {
        let restored = self.available_stock.saturating_add(quantity);
        if restored > self.total_stock {
            self.available_stock = self.total_stock;
            true
        } else {
            self.available_stock = restored;
            false
        }
    }

    pub fn info(&self) -> ItemInfo {
        ItemInfo {
            id: self.id,
            owner_id: self.owner_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            price_per_day: self.price_per_day,
            total_stock: self.total_stock,
            available_stock: self.available_stock,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// The event types. Flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ItemCreated {
        id: Ulid,
        owner_id: UserId,
        name: String,
        description: Option<String>,
        price_per_day: Money,
        total_stock: u32,
        available_stock: u32,
        is_active: bool,
        at: Ms,
    },
    ItemUpdated {
        id: Ulid,
        name: String,
        description: Option<String>,
        price_per_day: Money,
        total_stock: u32,
        available_stock: u32,
        is_active: bool,
        at: Ms,
    },
    ItemDeleted {
        id: Ulid,
    },
    RentalCreated {
        id: Ulid,
        item_id: Ulid,
        renter_id: UserId,
        range: DateRange,
        quantity: u32,
        total_price: Money,
        at: Ms,
    },
    RentalEnded {
        id: Ulid,
        item_id: Ulid,
        at: Ms,
    },
    RentalConfirmed {
        id: Ulid,
        item_id: Ulid,
        at: Ms,
    },
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub price_per_day: Money,
    pub total_stock: u32,
    /// Defaults to `total_stock`.
    pub available_stock: Option<u32>,
    pub is_active: bool,
}

/// Partial item update; `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub name: Option<String>,
    /// `Some(None)` clears the description.
    pub description: Option<Option<String>>,
    pub price_per_day: Option<Money>,
    pub total_stock: Option<u32>,
    pub available_stock: Option<u32>,
    pub is_active: Option<bool>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        *self == ItemPatch::default()
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: Ulid,
    pub owner_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub price_per_day: Money,
    pub total_stock: u32,
    pub available_stock: u32,
    pub is_active: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Read model: a stored item plus its computed availability for a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemView {
    pub item: ItemInfo,
    pub real_available_stock: i64,
}
