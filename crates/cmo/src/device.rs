use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use derive_more::Display;
use serde::Serialize;

/// Arena slot plus generation, so a stale handle never aliases a newer device.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{index}.{generation}")]
pub struct DeviceId {
    index: u32,
    generation: u32,
}

/// Lookup handle held by the device driver side. It never owns the quota
/// record; the pool's participant table does.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    id: DeviceId,
    name: Arc<str>,
    allocs_failed: Arc<AtomicU64>,
}

impl DeviceHandle {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Count a denied admission request. Safe to call without the pool lock.
    pub fn record_alloc_failure(&self) {
        self.allocs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allocs_failed(&self) -> u64 {
        self.allocs_failed.load(Ordering::Relaxed)
    }
}

/// Per-device share of the entitlement.
#[derive(Debug)]
pub(crate) struct DeviceQuota {
    pub(crate) name: Arc<str>,
    pub(crate) entitled: u64,
    pub(crate) allocated: u64,
    pub(crate) desired: u64,
    pub(crate) allocs_failed: Arc<AtomicU64>,
}

impl DeviceQuota {
    pub(crate) fn new(name: Arc<str>, floor: u64, desired: u64) -> Self {
        Self {
            name,
            entitled: floor,
            allocated: 0,
            desired,
            allocs_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn stats(&self, id: DeviceId) -> DeviceStats {
        DeviceStats {
            id: id.to_string(),
            name: self.name.to_string(),
            entitled: self.entitled,
            allocated: self.allocated,
            desired: self.desired,
            allocs_failed: self.allocs_failed.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub id: String,
    pub name: String,
    pub entitled: u64,
    pub allocated: u64,
    pub desired: u64,
    pub allocs_failed: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    quota: Option<DeviceQuota>,
}

/// Participant list backed by a generational arena.
#[derive(Debug, Default)]
pub(crate) struct DeviceTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl DeviceTable {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, quota: DeviceQuota) -> DeviceHandle {
        let name = quota.name.clone();
        let allocs_failed = quota.allocs_failed.clone();
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.quota = Some(quota);
                DeviceId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    quota: Some(quota),
                });
                DeviceId {
                    index,
                    generation: 0,
                }
            }
        };
        self.len += 1;
        DeviceHandle {
            id,
            name,
            allocs_failed,
        }
    }

    pub(crate) fn get(&self, id: DeviceId) -> Option<&DeviceQuota> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.quota.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: DeviceId) -> Option<&mut DeviceQuota> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.quota.as_mut())
    }

    pub(crate) fn remove(&mut self, id: DeviceId) -> Option<DeviceQuota> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let quota = slot.quota.take()?;
        self.free.push(id.index);
        self.len -= 1;
        Some(quota)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (DeviceId, &DeviceQuota)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.quota.as_ref().map(|quota| {
                (
                    DeviceId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    quota,
                )
            })
        })
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut DeviceQuota> {
        self.slots.iter_mut().filter_map(|slot| slot.quota.as_mut())
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &DeviceQuota> {
        self.slots.iter().filter_map(|slot| slot.quota.as_ref())
    }
}
