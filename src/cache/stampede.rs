//! Stampede Coordinator
//!
//! Deduplicates concurrent requests for the same key. The first caller for a
//! cold key inserts a [`StampedeState`] and becomes the owner of a new
//! generation; later callers join it and wait on the same shared outcome.
//!
//! A generation serves one value type under one flag set. Callers for the
//! same key with another type or flag set get a generation of their own,
//! deduplicated the same way.
//!
//! ```text
//!   caller ──► acquire(key, type, flags) ──┬── none ─────────► Owner(waiter, publisher)
//!                                          ├── live state ───► Joined(waiter)
//!                                          └── dead state ───► replace ──► Owner
//!
//!   waiter dropped ──► interested - 1 ──► 0 ? cancel shared token
//!   publisher ──► retire state ──► send outcome to every waiter
//! ```
//!
//! Each waiter resolves under its own cancellation token. Only when the last
//! interested waiter detaches is the shared token cancelled, which the value
//! factory observes cooperatively.
//!
//! A generation's distributed write-back runs under its write-back lock.
//! `set` and `remove` supersede every generation for the key and then wait
//! on those locks, so their own distributed writes always land last.

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::entry::LocalHit;
use super::key::CacheKey;
use super::metrics::CacheMetrics;
use super::options::EntryFlags;
use crate::error::CacheError;

/// What every waiter of a generation receives
pub type Outcome = std::result::Result<LocalHit, CacheError>;

/// Generations in flight for each key, one per value type and flag set
type StateMap = DashMap<CacheKey, Vec<Arc<StampedeState>>>;

/// Coordination state for one in-flight generation of a key
pub struct StampedeState {
    key: CacheKey,
    generation: u64,
    value_type: TypeId,
    flags: EntryFlags,
    /// Waiters that have not detached
    interested: AtomicUsize,
    /// Cancelled once `interested` reaches zero
    token: CancellationToken,
    /// Set by `set`/`remove` for this key; suppresses write-back
    superseded: AtomicBool,
    /// Held across the distributed write-back
    writeback: Mutex<()>,
    outcome: Shared<BoxFuture<'static, Outcome>>,
}

impl StampedeState {
    fn new(
        key: CacheKey,
        generation: u64,
        value_type: TypeId,
        flags: EntryFlags,
    ) -> (Arc<Self>, oneshot::Sender<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let lost_key = key.to_string();
        let outcome = rx
            .map(move |received| {
                received.unwrap_or_else(|_| Err(CacheError::FactoryPanicked { key: lost_key }))
            })
            .boxed()
            .shared();

        let state = Arc::new(Self {
            key,
            generation,
            value_type,
            flags,
            interested: AtomicUsize::new(1),
            token: CancellationToken::new(),
            superseded: AtomicBool::new(false),
            writeback: Mutex::new(()),
            outcome,
        });
        (state, tx)
    }

    /// Key
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Generation number, unique per coordinator
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Shared cancellation token handed to the value factory
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Waiters still interested in the outcome
    pub fn interested(&self) -> usize {
        self.interested.load(Ordering::Acquire)
    }

    /// True once a `set` or `remove` for this key landed during the generation
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    /// True while a write-back may still land: not superseded and at least
    /// one caller is still waiting
    pub fn accepts_writeback(&self) -> bool {
        !self.is_superseded() && !self.token.is_cancelled()
    }

    fn supersede(&self) {
        self.superseded.store(true, Ordering::Release);
    }

    /// Lock out writers that supersede this generation until the guard drops
    pub async fn lock_writeback(&self) -> MutexGuard<'_, ()> {
        self.writeback.lock().await
    }

    /// Wait for an in-progress distributed write-back to finish
    pub async fn writeback_settled(&self) {
        drop(self.writeback.lock().await);
    }

    fn accepts(&self, value_type: TypeId, flags: EntryFlags) -> bool {
        self.value_type == value_type && self.flags == flags
    }

    /// Register one more waiter iff the generation still has one
    fn try_add_caller(&self) -> bool {
        let mut current = self.interested.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.interested.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn remove_caller(&self) {
        if self.interested.fetch_sub(1, Ordering::AcqRel) == 1 && !self.token.is_cancelled() {
            tracing::debug!(key = %self.key, generation = self.generation, "last caller detached");
            self.token.cancel();
        }
    }
}

impl std::fmt::Debug for StampedeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampedeState")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("flags", &self.flags)
            .field("interested", &self.interested())
            .field("superseded", &self.is_superseded())
            .finish()
    }
}

/// One caller's interest in a generation. Dropping it detaches the caller.
pub struct Waiter {
    state: Arc<StampedeState>,
    metrics: Arc<CacheMetrics>,
}

impl Waiter {
    /// Wait for the shared outcome, or for `caller` to be cancelled.
    ///
    /// A cancelled caller gets [`CacheError::Cancelled`] carrying its own
    /// token; the generation keeps running for everyone else.
    pub async fn wait(self, caller: &CancellationToken) -> Outcome {
        let outcome = self.state.outcome.clone();
        tokio::select! {
            biased;
            _ = caller.cancelled() => {
                self.metrics.record_caller_cancellation();
                Err(CacheError::Cancelled { token: caller.clone() })
            }
            outcome = outcome => outcome,
        }
    }

    /// The generation this waiter belongs to
    pub fn state(&self) -> &Arc<StampedeState> {
        &self.state
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.state.remove_caller();
    }
}

/// Completes a generation. Held by whoever runs the value factory.
pub struct Publisher {
    states: Arc<StateMap>,
    state: Arc<StampedeState>,
    tx: Option<oneshot::Sender<Outcome>>,
}

impl Publisher {
    /// The generation being produced
    pub fn state(&self) -> &Arc<StampedeState> {
        &self.state
    }

    /// End the generation and hand `outcome` to every waiter.
    ///
    /// The state leaves the map first, so a caller arriving after this
    /// starts a fresh generation.
    pub fn publish(mut self, outcome: Outcome) {
        self.retire();
        if let Some(tx) = self.tx.take() {
            // The state itself holds the receiver
            let _ = tx.send(outcome);
        }
    }

    fn retire(&self) {
        if let Entry::Occupied(mut occupied) = self.states.entry(self.state.key.clone()) {
            occupied
                .get_mut()
                .retain(|current| !Arc::ptr_eq(current, &self.state));
            if occupied.get().is_empty() {
                occupied.remove();
            }
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::error!(
                key = %self.state.key,
                generation = self.state.generation,
                "generation ended without an outcome"
            );
            self.retire();
        }
    }
}

/// Result of [`Coordinator::acquire`]
pub enum Acquired {
    /// First caller: run the generation and publish its outcome
    Owner(Waiter, Publisher),
    /// A generation is already running for this key, type and flag set
    Joined(Waiter),
}

/// Per-key in-flight operation registry
pub struct Coordinator {
    states: Arc<StateMap>,
    next_generation: AtomicU64,
    metrics: Arc<CacheMetrics>,
}

impl Coordinator {
    /// Create an empty registry
    pub fn new(metrics: Arc<CacheMetrics>) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            metrics,
        }
    }

    /// Join the running generation for `key`, `value_type` and `flags`, or
    /// start a new one
    pub fn acquire(&self, key: &CacheKey, value_type: TypeId, flags: EntryFlags) -> Acquired {
        let mut flights = self.states.entry(key.clone()).or_default();

        if let Some(pos) = flights.iter().position(|state| state.accepts(value_type, flags)) {
            let state = &flights[pos];
            if state.try_add_caller() {
                self.metrics.record_stampede_join();
                return Acquired::Joined(self.waiter(Arc::clone(state)));
            }
            // Every caller detached; the generation is finishing without
            // anyone to publish to
            tracing::debug!(key = %key, generation = state.generation, "replacing abandoned generation");
            flights.swap_remove(pos);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (state, tx) = StampedeState::new(key.clone(), generation, value_type, flags);
        flights.push(Arc::clone(&state));
        Acquired::Owner(
            self.waiter(Arc::clone(&state)),
            Publisher {
                states: Arc::clone(&self.states),
                state,
                tx: Some(tx),
            },
        )
    }

    fn waiter(&self, state: Arc<StampedeState>) -> Waiter {
        Waiter {
            state,
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Mark every running generation for `key` as stale and return them, so
    /// the caller can wait out their write-backs
    pub fn supersede(&self, key: &CacheKey) -> Vec<Arc<StampedeState>> {
        match self.states.get(key) {
            Some(flights) => flights
                .iter()
                .map(|state| {
                    state.supersede();
                    Arc::clone(state)
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of generations in flight
    pub fn in_flight(&self) -> usize {
        self.states.iter().map(|flights| flights.len()).sum()
    }

    /// True if a generation is registered for `key`
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.states.contains_key(key)
    }
}

// =============================================================================
// Tests
// =============================================================================
