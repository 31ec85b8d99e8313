use crate::core::domain::{DeviceEntry, DeviceId};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// What `register` did with the beacon it was handed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First verified beacon from this id; callers should announce the device
    New,
    /// Known id; TTL extended in place, no discovery event warranted
    Refreshed,
}

/// TTL cache of devices seen on the network, keyed by their stable id.
///
/// An entry lives `ttl` past its last verified beacon; expired entries are
/// treated as absent everywhere and removed either lazily on access or by the
/// periodic `purge_expired` sweep. The lock is never held across an await.
pub struct DeviceRegistry {
    ttl: Duration,
    entries: Mutex<HashMap<DeviceId, DeviceEntry>>,
}

impl DeviceRegistry {
    /// `ttl` must exceed the beacon announce period, or live peers flap out of
    /// the registry between announcements. Config validation enforces this.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a new device or refresh a known one.
    ///
    /// A known id keeps its entry: the address and metadata are updated and
    /// `expires_at` is pushed out, but the id itself never changes. Only a
    /// `New` result should produce a discovery event.
    pub fn register(&self, id: DeviceId, name: &str, os: &str, addr: IpAddr) -> Registration {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            // An expired entry that was never purged counts as gone; the
            // device dropped off the network and is being discovered anew.
            Some(entry) if entry.expires_at > now => {
                entry.name = name.to_string();
                entry.os = os.to_string();
                entry.addr = addr;
                entry.expires_at = now + self.ttl;
                Registration::Refreshed
            }
            _ => {
                entries.insert(
                    id.clone(),
                    DeviceEntry {
                        id,
                        name: name.to_string(),
                        os: os.to_string(),
                        addr,
                        expires_at: now + self.ttl,
                    },
                );
                Registration::New
            }
        }
    }

    /// Address of a live device, or `None` if unknown or expired.
    /// An expired entry found here is removed on the spot.
    pub fn lookup(&self, id: &DeviceId) -> Option<IpAddr> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.addr),
            Some(_) => {
                entries.remove(id);
                None
            }
            None => None,
        }
    }

    /// Read an entry without touching its TTL.
    pub fn peek(&self, id: &DeviceId) -> Option<DeviceEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(id)
            .filter(|entry| entry.expires_at > Instant::now())
            .cloned()
    }

    /// Explicitly extend a live entry's TTL. Returns false for unknown or
    /// already-expired ids.
    pub fn refresh(&self, id: &DeviceId) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(id) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.ttl;
                true
            }
            _ => false,
        }
    }

    /// Live entry whose address matches `ip`, used to resolve an inbound
    /// transfer connection back to the device that announced from there.
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<DeviceEntry> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .find(|entry| entry.addr == ip && entry.expires_at > now)
            .cloned()
    }

    /// Drop every expired entry. Called from the announce tick so the map
    /// cannot grow unbounded even for ids that are never looked up again.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let purged = before - entries.len();
        if purged > 0 {
            debug!("purged {} expired device(s)", purged);
        }
        purged
    }

    /// All live entries, unordered.
    pub fn snapshot(&self) -> Vec<DeviceEntry> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|entry| entry.expires_at > now)
            .cloned()
            .collect()
    }
}
