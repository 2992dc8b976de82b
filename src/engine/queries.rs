use ulid::Ulid;

use crate::model::*;

use super::availability::item_view;
use super::{Engine, EngineError};

/// A window with both bounds must not be reversed.
fn validate_window(window: &Window) -> Result<(), EngineError> {
    if let (Some(start), Some(end)) = (window.start, window.end)
        && end < start
    {
        return Err(EngineError::InvalidRange { start, end });
    }
    Ok(())
}

impl Engine {
    /// The stored item, without any computed availability.
    pub async fn get_item(&self, id: Ulid) -> Result<ItemInfo, EngineError> {
        let item = self.get_item_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = item.read().await;
        Ok(guard.info())
    }

    /// Page through items ordered by id, each with its real availability
    /// over `window`.
    pub async fn list_items(
        &self,
        window: Window,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<ItemView>, EngineError> {
        validate_window(&window)?;
        let limit = self.pages.clamp(limit);

        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();

        let mut views = Vec::with_capacity(limit.min(ids.len()));
        for id in ids.into_iter().skip(skip).take(limit) {
            // Deleted between the id snapshot and here.
            let Some(item) = self.get_item_state(&id) else { continue };
            let guard = item.read().await;
            views.push(item_view(&guard, &window));
        }
        Ok(views)
    }

    pub async fn item_availability(&self, id: Ulid, window: Window) -> Result<ItemView, EngineError> {
        validate_window(&window)?;
        let item = self.get_item_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = item.read().await;
        Ok(item_view(&guard, &window))
    }

    /// Visible to the renter and to the owner of the rented item.
    pub async fn get_rental(&self, caller: &str, id: Ulid) -> Result<Rental, EngineError> {
        let guard = self.resolve_rental_read(&id).await?;
        let rental = guard.rental(&id).ok_or(EngineError::NotFound(id))?;
        if rental.renter_id != caller && guard.owner_id != caller {
            return Err(EngineError::NotFound(id));
        }
        Ok(rental.clone())
    }

    /// The caller's active rentals, ordered by start date.
    pub async fn list_active_rentals(&self, caller: &str) -> Vec<Rental> {
        let ids = self
            .renter_rentals
            .get(caller)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut rentals = Vec::new();
        for id in ids {
            let Ok(guard) = self.resolve_rental_read(&id).await else { continue };
            if let Some(rental) = guard.rental(&id).filter(|r| r.is_active()) {
                rentals.push(rental.clone());
            }
        }
        rentals.sort_by_key(|r| (r.range.start, r.id));
        rentals
    }
}
