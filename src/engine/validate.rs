use crate::limits::*;
use crate::model::*;

use super::availability::real_available_stock;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if range.end <= range.start {
        return Err(EngineError::InvalidRange {
            start: range.start,
            end: range.end,
        });
    }
    if range.billable_days() > MAX_RENTAL_DAYS {
        return Err(EngineError::LimitExceeded("rental too long"));
    }
    Ok(())
}

pub(crate) fn validate_quantity(quantity: u32) -> Result<(), EngineError> {
    if quantity == 0 {
        return Err(EngineError::InvalidQuantity(quantity));
    }
    Ok(())
}

pub(crate) fn validate_user(user: &str) -> Result<(), EngineError> {
    if user.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

/// Field checks shared by create and update.
pub(crate) fn validate_item_fields(
    name: &str,
    description: Option<&str>,
    price_per_day: Money,
    total_stock: u32,
    available_stock: u32,
) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidItem("name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("item name too long"));
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if price_per_day < 0 {
        return Err(EngineError::InvalidItem("price_per_day cannot be negative"));
    }
    if total_stock > MAX_STOCK {
        return Err(EngineError::LimitExceeded("total_stock too large"));
    }
    if available_stock > total_stock {
        return Err(EngineError::InvalidItem("available_stock exceeds total_stock"));
    }
    Ok(())
}

/// Inclusive-day pricing: `days * price_per_day * quantity`.
pub(crate) fn rental_price(range: &DateRange, price_per_day: Money, quantity: u32) -> Result<Money, EngineError> {
    range
        .billable_days()
        .checked_mul(price_per_day)
        .and_then(|p| p.checked_mul(i64::from(quantity)))
        .ok_or(EngineError::LimitExceeded("total price overflows"))
}

/// Capacity gate for a new rental. Compares against computed availability,
/// never against the cached counter.
pub(crate) fn check_capacity(item: &ItemState, range: &DateRange, quantity: u32) -> Result<(), EngineError> {
    let available = real_available_stock(item, &Window::from(*range));
    if i64::from(quantity) > available {
        return Err(EngineError::InsufficientStock {
            item_id: item.id,
            requested: quantity,
            available,
        });
    }
    Ok(())
}
