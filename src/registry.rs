//! Session Registry
//!
//! Process-wide table of live remote connections, shared by the terminal and
//! file-transfer proxies (each proxy owns its own registry instance).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SessionRegistry<H>                                      │
//! │  slots: DashMap<SessionKey, Arc<Mutex<SlotState>>>       │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  RegistryEntry                                     │  │
//! │  │  ├── handle: Arc<H>                                │  │
//! │  │  ├── last_active: Instant                          │  │
//! │  │  ├── leases: AtomicU32                             │  │
//! │  │  └── idle_timer: Option<JoinHandle>                │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Per-key lifecycle
//!
//! `ABSENT → CONNECTING → CONNECTED → (IDLE-EXPIRED | CLOSED | ERRORED) → ABSENT`
//!
//! - The slot mutex is held for the whole connect, so concurrent `acquire`
//!   calls for the same key wait and then reuse the result. Other keys are
//!   never blocked.
//! - A slot that leaves the map is marked `Retired`; anyone still waiting on
//!   its mutex retries against a fresh slot.
//! - Each entry has exactly one idle timer. Every operation through the entry
//!   calls `touch`, which pushes the deadline out. While leases are held the
//!   deadline is not enforced.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{OwnerId, ServerId};

/// Default idle window (10 minutes)
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// A live connection the registry can health-check and close
#[async_trait]
pub trait ManagedHandle: Send + Sync + 'static {
    /// Single source of truth for entry health
    fn is_connected(&self) -> bool;

    /// Close the underlying connection. Must be idempotent.
    async fn close(&self);
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Idle window in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Whether an entry is tied to a stored server or to inline credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Bound,
    AdHoc,
}

/// Registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// Stored server, reusable by the same owner
    Bound { owner: OwnerId, server: ServerId },
    /// Inline credentials, reachable only through the random token
    AdHoc { owner: OwnerId, token: Uuid },
}

impl SessionKey {
    pub fn bound(owner: OwnerId, server: ServerId) -> Self {
        Self::Bound { owner, server }
    }

    /// New ad-hoc key with a fresh random token
    pub fn ad_hoc(owner: OwnerId) -> Self {
        Self::AdHoc {
            owner,
            token: Uuid::new_v4(),
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Bound { .. } => SessionKind::Bound,
            Self::AdHoc { .. } => SessionKind::AdHoc,
        }
    }

    pub fn owner(&self) -> OwnerId {
        match self {
            Self::Bound { owner, .. } | Self::AdHoc { owner, .. } => *owner,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bound { owner, server } => write!(f, "{}-{}", owner, server),
            Self::AdHoc { owner, token } => write!(f, "{}-quick-{}", owner, token),
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_entries: usize,
    pub bound_entries: usize,
    pub ad_hoc_entries: usize,
    /// Entries with at least one outstanding lease
    pub leased_entries: usize,
    /// Keys with a connect in flight
    pub connecting: usize,
    pub idle_timeout_secs: u64,
}

/// A registered connection
pub struct RegistryEntry<H: ?Sized> {
    key: SessionKey,
    handle: Arc<H>,
    pub created_at: DateTime<Utc>,
    last_active: parking_lot::Mutex<Instant>,
    leases: AtomicU32,
    idle_timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<H: ManagedHandle + ?Sized> RegistryEntry<H> {
    fn new(key: SessionKey, handle: Arc<H>) -> Self {
        Self {
            key,
            handle,
            created_at: Utc::now(),
            last_active: parking_lot::Mutex::new(Instant::now()),
            leases: AtomicU32::new(0),
            idle_timer: parking_lot::Mutex::new(None),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn kind(&self) -> SessionKind {
        self.key.kind()
    }

    pub fn handle(&self) -> Arc<H> {
        self.handle.clone()
    }

    /// Reset the idle deadline
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Time since the last touch
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_active())
    }

    pub fn lease_count(&self) -> u32 {
        self.leases.load(Ordering::SeqCst)
    }

    /// Hold the entry open while a long-lived consumer (a shell) uses it
    pub fn lease(self: &Arc<Self>) -> Lease<H> {
        let count = self.leases.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        debug!("Session {} lease count increased to {}", self.key, count);
        self.touch();
        Lease {
            entry: self.clone(),
        }
    }

    fn set_idle_timer(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.idle_timer.lock().replace(handle) {
            old.abort();
        }
    }

    fn cancel_idle_timer(&self) {
        if let Some(handle) = self.idle_timer.lock().take() {
            handle.abort();
            debug!("Session {} idle timer cancelled", self.key);
        }
    }
}

/// Outstanding use of an entry. Dropping it counts as activity.
pub struct Lease<H: ManagedHandle + ?Sized> {
    entry: Arc<RegistryEntry<H>>,
}

impl<H: ManagedHandle + ?Sized> Lease<H> {
    pub fn entry(&self) -> &Arc<RegistryEntry<H>> {
        &self.entry
    }

    pub fn handle(&self) -> Arc<H> {
        self.entry.handle()
    }
}

impl<H: ManagedHandle + ?Sized> Drop for Lease<H> {
    fn drop(&mut self) {
        let prev = self.entry.leases.fetch_sub(1, Ordering::SeqCst);
        debug!(
            "Session {} lease count decreased to {}",
            self.entry.key,
            prev.saturating_sub(1)
        );
        self.entry.touch();
    }
}

enum SlotState<H: ?Sized> {
    Vacant,
    Occupied(Arc<RegistryEntry<H>>),
    Retired,
}

type Slot<H> = Arc<Mutex<SlotState<H>>>;

/// A locked slot whose connect has not finished yet
///
/// Dropping it unfilled (failed or cancelled connect) retires the slot and
/// takes it out of the map.
struct PendingSlot<H: ?Sized> {
    state: OwnedMutexGuard<SlotState<H>>,
    slot: Slot<H>,
    key: SessionKey,
    slots: Arc<DashMap<SessionKey, Slot<H>>>,
    armed: bool,
}

impl<H: ?Sized> PendingSlot<H> {
    fn take_occupant(&mut self) -> Option<Arc<RegistryEntry<H>>> {
        match std::mem::replace(&mut *self.state, SlotState::Vacant) {
            SlotState::Occupied(entry) => Some(entry),
            _ => None,
        }
    }

    fn fill(mut self, entry: Arc<RegistryEntry<H>>) {
        *self.state = SlotState::Occupied(entry);
        self.armed = false;
    }
}

impl<H: ?Sized> Drop for PendingSlot<H> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        *self.state = SlotState::Retired;
        let slot = &self.slot;
        self.slots.remove_if(&self.key, |_, s| Arc::ptr_eq(s, slot));
        debug!("Connect for session {} did not finish, slot retired", self.key);
    }
}

/// Registry of live sessions keyed by [`SessionKey`]
pub struct SessionRegistry<H: ?Sized> {
    slots: Arc<DashMap<SessionKey, Slot<H>>>,
    config: RegistryConfig,
}

impl<H: ManagedHandle + ?Sized> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl<H: ManagedHandle + ?Sized> SessionRegistry<H> {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Number of keys currently present (including connects in flight)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Return the healthy entry for `key`, connecting if there is none
    ///
    /// At most one `connect` runs per key at a time. A failed connect leaves
    /// no entry behind and is reported to every caller that was waiting.
    pub async fn acquire<F, Fut, E>(
        &self,
        key: &SessionKey,
        connect: F,
    ) -> Result<Arc<RegistryEntry<H>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<H>, E>>,
    {
        let (slot, state) = loop {
            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SlotState::Vacant)))
                .clone();
            let state = slot.clone().lock_owned().await;
            if matches!(*state, SlotState::Retired) {
                continue;
            }
            break (slot, state);
        };

        if let SlotState::Occupied(entry) = &*state {
            if entry.handle.is_connected() {
                entry.touch();
                debug!("Reusing session {}", key);
                return Ok(entry.clone());
            }
        }

        let mut pending = PendingSlot {
            state,
            slot: slot.clone(),
            key: key.clone(),
            slots: self.slots.clone(),
            armed: true,
        };

        if let Some(stale) = pending.take_occupant() {
            warn!("Session {} is no longer connected, replacing it", key);
            stale.cancel_idle_timer();
            stale.handle.close().await;
        }

        info!("Connecting session {}", key);
        let handle = connect().await?;
        let entry = Arc::new(RegistryEntry::new(key.clone(), handle));
        let timer = self.spawn_idle_timer(slot, entry.clone());
        entry.set_idle_timer(timer);
        pending.fill(entry.clone());
        info!("Session {} registered", key);
        Ok(entry)
    }

    /// Look up a healthy entry without ever connecting
    pub async fn get(&self, key: &SessionKey) -> Option<Arc<RegistryEntry<H>>> {
        let slot = self.slots.get(key).map(|s| s.value().clone())?;
        let state = slot.lock().await;
        match &*state {
            SlotState::Occupied(entry) if entry.handle.is_connected() => Some(entry.clone()),
            _ => None,
        }
    }

    /// Registered entry for `key`, healthy or not
    pub async fn peek(&self, key: &SessionKey) -> Option<Arc<RegistryEntry<H>>> {
        let slot = self.slots.get(key).map(|s| s.value().clone())?;
        let state = slot.lock().await;
        match &*state {
            SlotState::Occupied(entry) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Reset the idle timer for `key`. Returns false when there is no entry.
    pub async fn touch(&self, key: &SessionKey) -> bool {
        match self.get(key).await {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Cancel the timer, close the handle and remove the entry
    ///
    /// Idempotent: returns false when nothing was registered.
    pub async fn release(&self, key: &SessionKey) -> bool {
        let Some(slot) = self.slots.get(key).map(|s| s.value().clone()) else {
            return false;
        };

        let mut state = slot.lock().await;
        let previous = std::mem::replace(&mut *state, SlotState::Retired);
        self.slots.remove_if(key, |_, s| Arc::ptr_eq(s, &slot));
        drop(state);

        match previous {
            SlotState::Occupied(entry) => {
                entry.cancel_idle_timer();
                entry.handle.close().await;
                info!("Session {} released", key);
                true
            }
            _ => false,
        }
    }

    /// Release `entry` only if it is still the one registered under its key
    ///
    /// Used when a consumer saw the connection fail: a newer connection made
    /// by someone else under the same key is left alone.
    pub async fn release_entry(&self, entry: &Arc<RegistryEntry<H>>) -> bool {
        let key = entry.key();
        let Some(slot) = self.slots.get(key).map(|s| s.value().clone()) else {
            return false;
        };

        let mut state = slot.lock().await;
        let is_current = matches!(&*state, SlotState::Occupied(e) if Arc::ptr_eq(e, entry));
        if !is_current {
            return false;
        }
        *state = SlotState::Retired;
        self.slots.remove_if(key, |_, s| Arc::ptr_eq(s, &slot));
        drop(state);

        entry.cancel_idle_timer();
        entry.handle.close().await;
        info!("Session {} released after failure", key);
        true
    }

    /// Release every entry
    pub async fn release_all(&self) {
        let keys: Vec<SessionKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        info!("Releasing {} sessions", keys.len());
        for key in keys {
            self.release(&key).await;
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let slots: Vec<Slot<H>> = self.slots.iter().map(|e| e.value().clone()).collect();

        let mut stats = RegistryStats {
            total_entries: 0,
            bound_entries: 0,
            ad_hoc_entries: 0,
            leased_entries: 0,
            connecting: 0,
            idle_timeout_secs: self.config.idle_timeout_secs,
        };

        for slot in slots {
            // A held lock means a connect (or teardown) is in progress
            let Ok(state) = slot.try_lock() else {
                stats.connecting += 1;
                continue;
            };
            if let SlotState::Occupied(entry) = &*state {
                stats.total_entries += 1;
                match entry.kind() {
                    SessionKind::Bound => stats.bound_entries += 1,
                    SessionKind::AdHoc => stats.ad_hoc_entries += 1,
                }
                if entry.lease_count() > 0 {
                    stats.leased_entries += 1;
                }
            }
        }

        stats
    }

    /// One timer task per entry, living until eviction or release
    fn spawn_idle_timer(&self, slot: Slot<H>, entry: Arc<RegistryEntry<H>>) -> JoinHandle<()> {
        let timeout = self.config.idle_timeout();
        let slots = self.slots.clone();

        tokio::spawn(async move {
            loop {
                if entry.lease_count() > 0 {
                    tokio::time::sleep(timeout).await;
                    continue;
                }
                let deadline = entry.last_active() + timeout;
                if Instant::now() < deadline && entry.handle.is_connected() {
                    tokio::time::sleep_until(deadline).await;
                    continue;
                }
                break;
            }

            let mut state = slot.lock().await;
            let is_current = matches!(&*state, SlotState::Occupied(e) if Arc::ptr_eq(e, &entry));
            if !is_current {
                return;
            }
            *state = SlotState::Retired;
            slots.remove_if(entry.key(), |_, s| Arc::ptr_eq(s, &slot));
            drop(state);

            // Detach rather than abort: this is the timer task itself
            entry.idle_timer.lock().take();

            info!(
                "Session {} idle for {}s, closing",
                entry.key(),
                entry.idle_for().as_secs()
            );
            entry.handle.close().await;
        })
    }
}
