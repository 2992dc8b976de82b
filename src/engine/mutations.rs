use std::sync::Arc;

use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::validate::{
    check_capacity, now_ms, rental_price, validate_item_fields, validate_quantity, validate_range,
    validate_user,
};
use super::{forget_rentals, Engine, EngineError, WalCommand};

/// Which terminal transition a rental takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    /// Renter returns the item early.
    End,
    /// Owner confirms receipt.
    Confirm,
}

fn created_event(item: &ItemState) -> Event {
    Event::ItemCreated {
        id: item.id,
        owner_id: item.owner_id.clone(),
        name: item.name.clone(),
        description: item.description.clone(),
        price_per_day: item.price_per_day,
        total_stock: item.total_stock,
        available_stock: item.available_stock,
        is_active: item.is_active,
        at: item.created_at,
    }
}

fn updated_event(item: &ItemState) -> Event {
    Event::ItemUpdated {
        id: item.id,
        name: item.name.clone(),
        description: item.description.clone(),
        price_per_day: item.price_per_day,
        total_stock: item.total_stock,
        available_stock: item.available_stock,
        is_active: item.is_active,
        at: item.updated_at,
    }
}

impl Engine {
    /// Get an item and take its write lock. Re-checks existence after the
    /// lock is acquired so a concurrent delete is never written through.
    async fn lock_item_write(&self, id: &Ulid) -> Result<OwnedRwLockWriteGuard<ItemState>, EngineError> {
        let item = self.get_item_state(id).ok_or(EngineError::NotFound(*id))?;
        let guard = item.write_owned().await;
        if !self.state.contains_key(id) {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    pub async fn create_item(&self, owner: &str, new: NewItem) -> Result<ItemInfo, EngineError> {
        validate_user(owner)?;
        if self.state.len() >= MAX_ITEMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many items"));
        }
        let available_stock = new.available_stock.unwrap_or(new.total_stock);
        validate_item_fields(
            &new.name,
            new.description.as_deref(),
            new.price_per_day,
            new.total_stock,
            available_stock,
        )?;
        let _claim = self.claim_id(new.id)?;
        if self.state.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }

        let _gate = self.compaction_gate.read().await;
        let now = now_ms();
        let mut item = ItemState::new(new.id, owner.to_string(), new.name, new.total_stock, new.price_per_day);
        item.description = new.description;
        item.available_stock = available_stock;
        item.is_active = new.is_active;
        item.created_at = now;
        item.updated_at = now;

        let event = created_event(&item);
        self.wal_append(&event).await?;
        let info = item.info();
        self.state.insert(item.id, Arc::new(RwLock::new(item)));
        debug!("item {} created by {owner}", info.id);
        Ok(info)
    }

    pub async fn update_item(&self, caller: &str, id: Ulid, patch: ItemPatch) -> Result<ItemInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_item_write(&id).await?;
        if guard.owner_id != caller {
            return Err(EngineError::Forbidden(id));
        }
        if patch.is_empty() {
            return Ok(guard.info());
        }

        let name = patch.name.unwrap_or_else(|| guard.name.clone());
        let description = patch.description.unwrap_or_else(|| guard.description.clone());
        let price_per_day = patch.price_per_day.unwrap_or(guard.price_per_day);
        let total_stock = patch.total_stock.unwrap_or(guard.total_stock);
        let available_stock = patch
            .available_stock
            .unwrap_or_else(|| guard.available_stock.min(total_stock));
        let is_active = patch.is_active.unwrap_or(guard.is_active);
        validate_item_fields(&name, description.as_deref(), price_per_day, total_stock, available_stock)?;

        if total_stock < guard.total_stock && guard.has_active_rentals() {
            warn!(
                "item {id}: total_stock lowered {} -> {total_stock} with active rentals outstanding",
                guard.total_stock
            );
        }

        let event = Event::ItemUpdated {
            id,
            name,
            description,
            price_per_day,
            total_stock,
            available_stock,
            is_active,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.info())
    }

    pub async fn delete_item(&self, caller: &str, id: Ulid) -> Result<ItemInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let guard = self.lock_item_write(&id).await?;
        if guard.owner_id != caller {
            return Err(EngineError::Forbidden(id));
        }
        if guard.has_active_rentals() {
            return Err(EngineError::HasActiveRentals(id));
        }

        let event = Event::ItemDeleted { id };
        self.wal_append(&event).await?;
        forget_rentals(&guard, &self.rental_to_item, &self.renter_rentals);
        self.state.remove(&id);
        Ok(guard.info())
    }

    /// Reserve `quantity` units of an item for `range`.
    ///
    /// The item's write lock is held from the availability check through the
    /// WAL append, so concurrent requests on the same item are serialized and
    /// each one sees the rentals committed before it.
    pub async fn create_rental(
        &self,
        renter: &str,
        id: Ulid,
        item_id: Ulid,
        range: DateRange,
        quantity: u32,
    ) -> Result<Rental, EngineError> {
        validate_user(renter)?;
        validate_quantity(quantity)?;
        validate_range(&range)?;
        let _claim = self.claim_id(id)?;
        if self.rental_to_item.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_item_write(&item_id).await?;
        if !guard.is_active {
            return Err(EngineError::NotFound(item_id));
        }
        if guard.active_rental_count() >= MAX_ACTIVE_RENTALS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many active rentals on item"));
        }
        if let Err(e) = check_capacity(&guard, &range, quantity) {
            metrics::counter!(observability::RENTALS_REJECTED_TOTAL, "reason" => "insufficient_stock")
                .increment(1);
            debug!("rental {id} rejected: {e}");
            return Err(e);
        }
        let total_price = rental_price(&range, guard.price_per_day, quantity)?;
        let counter_short = guard.available_stock < quantity;

        let event = Event::RentalCreated {
            id,
            item_id,
            renter_id: renter.to_string(),
            range,
            quantity,
            total_price,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        if counter_short {
            warn!(
                "item {item_id}: cached available_stock {} below rental quantity {quantity}, counter left unchanged",
                guard.available_stock
            );
            metrics::counter!(observability::STOCK_COUNTER_DRIFT_TOTAL, "kind" => "underflow").increment(1);
        }
        metrics::counter!(observability::RENTALS_CREATED_TOTAL).increment(1);
        debug!("rental {id} created: item {item_id} x{quantity} [{}, {}]", range.start, range.end);

        guard.rental(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Renter ends a rental early. Rentals of other renters look nonexistent.
    pub async fn end_rental(&self, caller: &str, id: Ulid) -> Result<Rental, EngineError> {
        self.terminate_rental(caller, id, Termination::End).await
    }

    /// Item owner confirms the rented units came back.
    pub async fn confirm_received(&self, caller: &str, id: Ulid) -> Result<Rental, EngineError> {
        self.terminate_rental(caller, id, Termination::Confirm).await
    }

    async fn terminate_rental(&self, caller: &str, id: Ulid, how: Termination) -> Result<Rental, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_rental_write(&id).await?;
        let item_id = guard.id;
        let rental = guard.rental(&id).ok_or(EngineError::NotFound(id))?;
        match how {
            Termination::End if rental.renter_id != caller => return Err(EngineError::NotFound(id)),
            Termination::Confirm if guard.owner_id != caller => return Err(EngineError::Forbidden(item_id)),
            _ => {}
        }
        if !rental.is_active() {
            return Err(EngineError::AlreadyTerminal(id));
        }
        let quantity = rental.quantity;
        let clamps = guard.available_stock.saturating_add(quantity) > guard.total_stock;

        let at = now_ms();
        let event = match how {
            Termination::End => Event::RentalEnded { id, item_id, at },
            Termination::Confirm => Event::RentalConfirmed { id, item_id, at },
        };
        self.persist_and_apply(&mut guard, &event).await?;

        if clamps {
            warn!("item {item_id}: restoring {quantity} from rental {id} exceeded total_stock, clamped");
            metrics::counter!(observability::STOCK_COUNTER_DRIFT_TOTAL, "kind" => "clamp").increment(1);
        }
        let outcome = match how {
            Termination::End => "ended",
            Termination::Confirm => "confirmed",
        };
        metrics::counter!(observability::RENTALS_TERMINATED_TOTAL, "outcome" => outcome).increment(1);

        guard.rental(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Holds the compaction gate exclusively, so no mutation can append between
    /// the snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut item_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        item_ids.sort();

        let mut events = Vec::new();
        for id in item_ids {
            let Some(item) = self.get_item_state(&id) else { continue };
            let guard = item.read().await;

            events.push(created_event(&guard));
            for rental in &guard.rentals {
                events.push(Event::RentalCreated {
                    id: rental.id,
                    item_id: guard.id,
                    renter_id: rental.renter_id.clone(),
                    range: rental.range,
                    quantity: rental.quantity,
                    total_price: rental.total_price,
                    at: rental.created_at,
                });
                match rental.status {
                    RentalStatus::Active => {}
                    RentalStatus::Ended => events.push(Event::RentalEnded {
                        id: rental.id,
                        item_id: guard.id,
                        at: rental.updated_at,
                    }),
                    RentalStatus::OwnerConfirmed => events.push(Event::RentalConfirmed {
                        id: rental.id,
                        item_id: guard.id,
                        at: rental.updated_at,
                    }),
                }
            }
            // Pins the cached counter and updated_at to their exact current values.
            events.push(updated_event(&guard));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
