/// Connection Pool Module
///
/// A pool is a named, fixed-capacity set of connections created lazily from
/// one connector and handed out round-robin. Slots fill on demand, so the
/// handle list may contain gaps until every slot has been visited.
///
/// Pools are registered by name in an explicit [`PoolRegistry`]; a
/// process-wide registry is available through [`PoolRegistry::global`].

use crate::core::db::connection::Connection;
use crate::core::{RdbiError, Result};
use crate::driver::Connector;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, warn};

/// Capacity used when none is given
pub const DEFAULT_POOL_SIZE: usize = 5;

struct PoolState {
    /// Slots in allocation order; `None` until first handed out
    handles: Vec<Option<Arc<Connection>>>,
    max: usize,
    /// Slot the next `get_dbh` serves
    last_index: usize,
}

impl PoolState {
    fn live(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.handles.iter().flatten()
    }
}

/// A named set of connections
pub struct Pool {
    name: String,
    connector: Connector,
    state: Mutex<PoolState>,
}

impl Pool {
    /// Creates an empty pool.
    ///
    /// # Errors
    ///
    /// `RdbiError::Config` when `max` is 0.
    pub fn new(name: impl Into<String>, connector: Connector, max: usize) -> Result<Self> {
        check_capacity(max)?;
        Ok(Pool {
            name: name.into(),
            connector,
            state: Mutex::new(PoolState {
                handles: Vec::new(),
                max,
                last_index: 0,
            }),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|_| RdbiError::poisoned("pool"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn max(&self) -> usize {
        self.state.lock().map(|s| s.max).unwrap_or(0)
    }

    /// Slot the next `get_dbh` will serve
    pub fn last_index(&self) -> usize {
        self.state.lock().map(|s| s.last_index).unwrap_or(0)
    }

    /// Number of connections the pool currently holds
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.live().count()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connections the pool currently holds, in slot order
    pub fn handles(&self) -> Vec<Arc<Connection>> {
        self.state
            .lock()
            .map(|s| s.live().cloned().collect())
            .unwrap_or_default()
    }

    /// Hands out the connection in the current slot and advances the slot.
    ///
    /// An empty slot is filled with a new connection; a disconnected one is
    /// reconnected first.
    pub fn get_dbh(&self) -> Result<Arc<Connection>> {
        let mut state = self.state()?;
        if state.last_index >= state.max {
            state.last_index = 0;
        }
        let slot = state.last_index;

        let dbh = match state.handles.get(slot).cloned().flatten() {
            Some(dbh) if dbh.is_connected() => dbh,
            Some(dbh) => {
                dbh.reconnect()?;
                dbh
            }
            None => {
                let dbh = self.connector.connect()?;
                if state.handles.len() <= slot {
                    state.handles.resize(slot + 1, None);
                }
                state.handles[slot] = Some(Arc::clone(&dbh));
                dbh
            }
        };

        state.last_index = (slot + 1) % state.max;
        debug!(pool = %self.name, slot, "handed out connection");
        Ok(dbh)
    }

    /// Opens a connection into the first free slot.
    ///
    /// # Errors
    ///
    /// `RdbiError::Capacity` when every slot is taken.
    pub fn add_connection(&self) -> Result<Arc<Connection>> {
        let mut state = self.state()?;

        let slot = match state.handles.iter().position(Option::is_none) {
            Some(slot) => slot,
            None if state.handles.len() < state.max => state.handles.len(),
            None => {
                return Err(RdbiError::Capacity(format!(
                    "pool '{}' already holds its maximum of {} connections",
                    self.name, state.max
                )))
            }
        };

        let dbh = self.connector.connect()?;
        if slot == state.handles.len() {
            state.handles.push(Some(Arc::clone(&dbh)));
        } else {
            state.handles[slot] = Some(Arc::clone(&dbh));
        }
        debug!(pool = %self.name, slot, "added connection");
        Ok(dbh)
    }

    /// Drops `dbh` from the pool without disconnecting it.
    ///
    /// Returns whether the pool held it.
    pub fn remove(&self, dbh: &Arc<Connection>) -> Result<bool> {
        let mut state = self.state()?;
        let before = state.handles.len();
        state
            .handles
            .retain(|slot| !matches!(slot, Some(held) if Arc::ptr_eq(held, dbh)));
        Ok(state.handles.len() != before)
    }

    /// Changes the capacity.
    ///
    /// When shrinking, connected handles are kept ahead of disconnected ones;
    /// whatever no longer fits is returned to the caller, not disconnected.
    ///
    /// # Errors
    ///
    /// `RdbiError::Config` when `max` is 0.
    pub fn resize(&self, max: usize) -> Result<Vec<Arc<Connection>>> {
        check_capacity(max)?;
        let mut state = self.state()?;

        let (connected, disconnected): (Vec<_>, Vec<_>) = state
            .handles
            .drain(..)
            .flatten()
            .partition(|dbh| dbh.is_connected());

        let mut kept = Vec::with_capacity(max);
        let mut evicted = Vec::new();
        for dbh in connected.into_iter().chain(disconnected) {
            if kept.len() < max {
                kept.push(Some(dbh));
            } else {
                evicted.push(dbh);
            }
        }

        state.handles = kept;
        state.max = max;
        if state.last_index >= max {
            state.last_index = 0;
        }

        debug!(pool = %self.name, max, evicted = evicted.len(), "resized pool");
        Ok(evicted)
    }

    /// Reconnects every held connection
    pub fn reconnect(&self) -> Result<()> {
        let state = self.state()?;
        for dbh in state.live() {
            dbh.reconnect()?;
        }
        Ok(())
    }

    /// Reconnects the held connections that are disconnected
    pub fn reconnect_if_disconnected(&self) -> Result<()> {
        let state = self.state()?;
        for dbh in state.live().filter(|dbh| !dbh.is_connected()) {
            dbh.reconnect()?;
        }
        Ok(())
    }

    /// Disconnects every held connection; failures are logged and skipped.
    pub fn disconnect(&self) -> Result<()> {
        let state = self.state()?;
        for dbh in state.live() {
            if let Err(e) = dbh.disconnect() {
                warn!(pool = %self.name, connection = %dbh.id(), error = %e, "failed to disconnect");
            }
        }
        Ok(())
    }

    /// Average ping across the held connections.
    ///
    /// Disconnected handles are reconnected first. A driver reporting no
    /// measurement (or zero) counts as 1. An empty pool reports 0.
    pub fn ping(&self) -> Result<u64> {
        self.reconnect_if_disconnected()?;

        let state = self.state()?;
        let mut total = 0u64;
        let mut count = 0u64;
        for dbh in state.live() {
            total += dbh.ping()?.filter(|&ping| ping > 0).unwrap_or(1);
            count += 1;
        }

        Ok(if count == 0 { 0 } else { total / count })
    }
}

fn check_capacity(max: usize) -> Result<()> {
    if max == 0 {
        return Err(RdbiError::Config("pool capacity must be at least 1".to_string()));
    }
    Ok(())
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("connector", &self.connector)
            .field("max", &self.max())
            .field("len", &self.len())
            .field("last_index", &self.last_index())
            .finish()
    }
}

/// Name -> pool lookup
#[derive(Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

static GLOBAL_POOLS: OnceCell<PoolRegistry> = OnceCell::new();

impl PoolRegistry {
    pub fn new() -> Self {
        PoolRegistry::default()
    }

    /// The process-wide registry
    pub fn global() -> &'static PoolRegistry {
        GLOBAL_POOLS.get_or_init(PoolRegistry::new)
    }

    /// Creates a pool and registers it under `name`, replacing any pool of
    /// the same name.
    pub fn create(&self, name: &str, connector: Connector, max: usize) -> Result<Arc<Pool>> {
        let pool = Arc::new(Pool::new(name, connector, max)?);
        if self.insert(Arc::clone(&pool)).is_some() {
            debug!(pool = name, "replaced existing pool");
        }
        Ok(pool)
    }

    /// Registers `pool` under its own name, returning the pool it replaces
    pub fn insert(&self, pool: Arc<Pool>) -> Option<Arc<Pool>> {
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pool.name().to_string(), pool)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
