//! Registry of discovered robots
//!
//! Records are keyed by robot name and expire when a robot stops answering
//! discovery probes. The registry is written only by the dispatch thread;
//! other threads read it through [`SharedRegistry::try_read`], which reports
//! [`LinkError::RegistryUnavailable`] instead of blocking on a writer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crate::error::{LinkError, Result};
use crate::events::Event;
use crate::settings::RobotSettings;

/// Default time without replies after which a robot is considered lost
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotRecord {
    pub name: String,
    /// Sender of the latest reply
    pub address: SocketAddr,
    #[serde(skip)]
    pub last_seen: Instant,
    pub discovered_at: DateTime<Utc>,
    /// No other debug client owns the robot
    pub free: bool,
    /// Where debug commands and keepalives go
    pub debug_address: Option<SocketAddr>,
    /// The debug client currently owning the robot, if any
    pub debug_client: Option<SocketAddr>,
    /// Sender of the latest settings record
    pub monitor_address: Option<SocketAddr>,
    pub settings: RobotSettings,
}

impl RobotRecord {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        let name = name.into();
        let settings = RobotSettings {
            name: name.clone(),
            ..RobotSettings::default()
        };
        Self {
            name,
            address,
            last_seen: Instant::now(),
            discovered_at: Utc::now(),
            free: true,
            debug_address: None,
            debug_client: None,
            monitor_address: None,
            settings,
        }
    }

    /// Free, running its frontend and reachable for debugging
    pub fn is_debuggable(&self) -> bool {
        self.free && self.settings.frontend_running && self.debug_address.is_some()
    }

    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > expiry
    }

    fn matches_ip(&self, ip: IpAddr) -> bool {
        self.address.ip() == ip || self.debug_address.map_or(false, |addr| addr.ip() == ip)
    }
}

#[derive(Debug)]
pub struct Registry {
    records: BTreeMap<String, RobotRecord>,
    expiry: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRY)
    }
}

impl Registry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            expiry,
        }
    }

    /// Insert or replace a record, touching its last-seen time.
    ///
    /// Returns `Found` for a new name and `Updated` otherwise. `last_seen`
    /// never moves backwards.
    pub fn upsert(&mut self, mut record: RobotRecord, now: Instant) -> Event {
        match self.records.get_mut(&record.name) {
            Some(existing) => {
                record.last_seen = existing.last_seen.max(now);
                record.discovered_at = existing.discovered_at;
                *existing = record;
                Event::Updated(existing.clone())
            }
            None => {
                record.last_seen = now;
                self.records.insert(record.name.clone(), record.clone());
                Event::Found(record)
            }
        }
    }

    /// Remove every record not seen within the expiry window
    pub fn expire(&mut self, now: Instant) -> Vec<RobotRecord> {
        let expiry = self.expiry;
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|record| record.is_expired(now, expiry))
            .map(|record| record.name.clone())
            .collect();
        expired
            .iter()
            .filter_map(|name| self.records.remove(name))
            .collect()
    }

    pub fn lookup(&self, name: &str) -> Option<&RobotRecord> {
        self.records.get(name)
    }

    pub fn lookup_by_address(&self, ip: IpAddr) -> Option<&RobotRecord> {
        self.records.values().find(|record| record.matches_ip(ip))
    }

    pub fn records(&self) -> impl Iterator<Item = &RobotRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Registry handle shared between the dispatch thread and readers
#[derive(Debug, Clone, Default)]
pub struct SharedRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl SharedRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::new(expiry))),
        }
    }

    /// Read without blocking; fails with `RegistryUnavailable` while a
    /// writer holds the lock.
    pub fn try_read<T>(&self, f: impl FnOnce(&Registry) -> T) -> Result<T> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(f(&guard)),
            Err(TryLockError::WouldBlock) => Err(LinkError::RegistryUnavailable),
            Err(TryLockError::Poisoned(poisoned)) => Ok(f(&poisoned.into_inner())),
        }
    }

    /// Blocking write, used by the dispatch thread
    pub fn write<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Clone of one record, best effort
    pub fn try_lookup(&self, name: &str) -> Result<Option<RobotRecord>> {
        self.try_read(|registry| registry.lookup(name).cloned())
    }

    /// Clone of all records, best effort
    pub fn try_snapshot(&self) -> Result<Vec<RobotRecord>> {
        self.try_read(|registry| registry.records().cloned().collect())
    }

    #[cfg(test)]
    pub(crate) fn lock_for_test(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap()
    }
}
