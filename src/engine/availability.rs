use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────
//
// Every availability number in the system goes through `rented_quantity`:
// the listing read model, the single-item query and the creation gate.

/// Sum of quantities of active rentals overlapping the window.
pub fn rented_quantity(item: &ItemState, window: &Window) -> u64 {
    item.overlapping_active(window)
        .map(|r| u64::from(r.quantity))
        .sum()
}

/// `total_stock` minus overlapping active demand. Negative when the owner
/// lowered `total_stock` below what is already rented out.
pub fn real_available_stock(item: &ItemState, window: &Window) -> i64 {
    i64::from(item.total_stock) - rented_quantity(item, window) as i64
}

/// Build the listing read model without touching the stored item.
pub fn item_view(item: &ItemState, window: &Window) -> ItemView {
    ItemView {
        item: item.info(),
        real_available_stock: real_available_stock(item, window),
    }
}
