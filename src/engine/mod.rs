mod availability;
mod error;
mod mutations;
mod queries;
mod validate;

pub use availability::{item_view, real_available_stock, rented_quantity};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::config::PageLimits;
use crate::model::*;
use crate::wal::Wal;

pub type SharedItemState = Arc<RwLock<ItemState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Non-append commands run after the batch is durable
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedItemState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: rental id → item id
    pub(super) rental_to_item: DashMap<Ulid, Ulid>,
    /// Renter → rental ids, in creation order.
    pub(super) renter_rentals: DashMap<UserId, Vec<Ulid>>,
    pub(super) pages: PageLimits,
    /// Mutations hold this shared from first lock to last apply; compaction
    /// holds it exclusively while it snapshots and swaps the WAL.
    pub(super) compaction_gate: RwLock<()>,
    /// Ids of items and rentals whose create is in flight.
    pub(super) claimed_ids: DashMap<Ulid, ()>,
}

/// An id reserved by an in-flight create. Released on drop.
pub(super) struct IdClaim<'a> {
    ids: &'a DashMap<Ulid, ()>,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}

/// Apply an event directly to an ItemState (no locking; caller holds the lock).
///
/// Stock counter side effects live here so WAL replay reproduces the counter
/// exactly; the mutation path inspects the counter beforehand to report drift.
fn apply_to_item(
    item: &mut ItemState,
    event: &Event,
    rental_map: &DashMap<Ulid, Ulid>,
    renter_map: &DashMap<UserId, Vec<Ulid>>,
) {
    match event {
        Event::ItemUpdated {
            name,
            description,
            price_per_day,
            total_stock,
            available_stock,
            is_active,
            at,
            ..
        } => {
            item.name = name.clone();
            item.description = description.clone();
            item.price_per_day = *price_per_day;
            item.total_stock = *total_stock;
            item.available_stock = (*available_stock).min(*total_stock);
            item.is_active = *is_active;
            item.updated_at = *at;
        }
        Event::RentalCreated {
            id,
            item_id,
            renter_id,
            range,
            quantity,
            total_price,
            at,
        } => {
            item.insert_rental(Rental {
                id: *id,
                item_id: *item_id,
                renter_id: renter_id.clone(),
                range: *range,
                quantity: *quantity,
                total_price: *total_price,
                status: RentalStatus::Active,
                created_at: *at,
                updated_at: *at,
            });
            item.decrease_stock(*quantity);
            rental_map.insert(*id, *item_id);
            renter_map.entry(renter_id.clone()).or_default().push(*id);
        }
        Event::RentalEnded { id, at, .. } => {
            finish_rental(item, id, RentalStatus::Ended, *at);
        }
        Event::RentalConfirmed { id, at, .. } => {
            finish_rental(item, id, RentalStatus::OwnerConfirmed, *at);
        }
        // ItemCreated/Deleted are handled at the DashMap level, not here
        Event::ItemCreated { .. } | Event::ItemDeleted { .. } => {}
    }
}

fn finish_rental(item: &mut ItemState, rental_id: &Ulid, status: RentalStatus, at: Ms) {
    if let Some(quantity) = item.close_rental(rental_id, status, at) {
        item.increase_stock(quantity);
    }
}

/// Drop the index entries of every rental of an item that is going away.
fn forget_rentals(
    item: &ItemState,
    rental_map: &DashMap<Ulid, Ulid>,
    renter_map: &DashMap<UserId, Vec<Ulid>>,
) {
    for rental in &item.rentals {
        rental_map.remove(&rental.id);
        if let Some(mut ids) = renter_map.get_mut(&rental.renter_id) {
            ids.retain(|id| *id != rental.id);
        }
    }
}

fn item_from_created(event: &Event) -> Option<ItemState> {
    let Event::ItemCreated {
        id,
        owner_id,
        name,
        description,
        price_per_day,
        total_stock,
        available_stock,
        is_active,
        at,
    } = event
    else {
        return None;
    };
    let mut item = ItemState::new(*id, owner_id.clone(), name.clone(), *total_stock, *price_per_day);
    item.description = description.clone();
    item.available_stock = (*available_stock).min(*total_stock);
    item.is_active = *is_active;
    item.created_at = *at;
    item.updated_at = *at;
    Some(item)
}

impl Engine {
    pub fn new(wal_path: PathBuf, pages: PageLimits) -> std::io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            rental_to_item: DashMap::new(),
            renter_rentals: DashMap::new(),
            pages,
            compaction_gate: RwLock::new(()),
            claimed_ids: DashMap::new(),
        };

        // Replay events. We're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::ItemCreated { id, .. } => {
                    if let Some(item) = item_from_created(event) {
                        engine.state.insert(*id, Arc::new(RwLock::new(item)));
                    }
                }
                Event::ItemDeleted { id } => {
                    if let Some((_, entry)) = engine.state.remove(id) {
                        let item = entry.try_read().expect("replay: uncontended read");
                        forget_rentals(&item, &engine.rental_to_item, &engine.renter_rentals);
                    }
                }
                other => {
                    if let Some(item_id) = event_item_id(other)
                        && let Some(entry) = engine.state.get(&item_id) {
                            let item_arc = entry.clone();
                            drop(entry);
                            let mut guard = item_arc.try_write().expect("replay: uncontended write");
                            apply_to_item(&mut guard, other, &engine.rental_to_item, &engine.renter_rentals);
                        }
                }
            }
        }

        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} items, {} rentals",
                events.len(),
                engine.state.len(),
                engine.rental_to_item.len()
            );
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Reserve `id` for a create. Two concurrent creates with the same id
    /// cannot both get past this.
    pub(super) fn claim_id(&self, id: Ulid) -> Result<IdClaim<'_>, EngineError> {
        if self.claimed_ids.insert(id, ()).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(IdClaim {
            ids: &self.claimed_ids,
            id,
        })
    }

    pub fn get_item_state(&self, id: &Ulid) -> Option<SharedItemState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_item_for_rental(&self, rental_id: &Ulid) -> Option<Ulid> {
        self.rental_to_item.get(rental_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call. If the append fails nothing is applied.
    pub(super) async fn persist_and_apply(
        &self,
        item: &mut ItemState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_item(item, event, &self.rental_to_item, &self.renter_rentals);
        Ok(())
    }

    /// Lookup rental → item, get item, acquire write lock.
    pub(super) async fn resolve_rental_write(
        &self,
        rental_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ItemState>, EngineError> {
        let item_id = self
            .get_item_for_rental(rental_id)
            .ok_or(EngineError::NotFound(*rental_id))?;
        let item = self
            .get_item_state(&item_id)
            .ok_or(EngineError::NotFound(item_id))?;
        Ok(item.write_owned().await)
    }

    /// Lookup rental → item, get item, acquire read lock.
    pub(super) async fn resolve_rental_read(
        &self,
        rental_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<ItemState>, EngineError> {
        let item_id = self
            .get_item_for_rental(rental_id)
            .ok_or(EngineError::NotFound(*rental_id))?;
        let item = self
            .get_item_state(&item_id)
            .ok_or(EngineError::NotFound(item_id))?;
        Ok(item.read_owned().await)
    }
}

/// Extract the item id from an event (for non-Create/Delete events).
fn event_item_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RentalCreated { item_id, .. }
        | Event::RentalEnded { item_id, .. }
        | Event::RentalConfirmed { item_id, .. } => Some(*item_id),
        Event::ItemUpdated { id, .. } => Some(*id),
        Event::ItemCreated { .. } | Event::ItemDeleted { .. } => None,
    }
}
