//! Device join and leave.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;

use crate::device::{DeviceHandle, DeviceQuota};
use crate::pool::{PoolState, QuotaPool};
use crate::{FatalError, QuotaError, Result};

impl PoolState {
    pub(crate) fn admit(
        &mut self,
        name: Arc<str>,
        desired: Option<u64>,
    ) -> Result<DeviceHandle, QuotaError> {
        let floor = self.floor();
        let desired = desired
            .map(|d| self.cfg.iommu_align(d))
            .unwrap_or(floor)
            .max(floor);

        if self.provisioned > 0 {
            // The floor share was set aside at start-up.
            self.provisioned -= 1;
            self.desired = self.desired.saturating_add(desired - floor);
            return Ok(self.devices.insert(DeviceQuota::new(name, floor, desired)));
        }

        let available = self.spare.saturating_add(self.excess.free);
        if available < floor {
            return Err(Report::new(QuotaError::exhausted(floor, available)));
        }

        let tmp = floor.min(self.excess.free);
        self.excess.free -= tmp;
        self.excess.size -= tmp;
        self.reserve.size += tmp;
        self.spare -= floor - tmp;
        self.desired = self.desired.saturating_add(desired);

        let handle = self.devices.insert(DeviceQuota::new(name, floor, desired));
        self.refresh_min();
        Ok(handle)
    }

    pub(crate) fn remove(&mut self, handle: &DeviceHandle) -> Option<Result<(), FatalError>> {
        let floor = self.floor();
        let quota = self.devices.get(handle.id())?;
        if quota.allocated != 0 {
            return Some(Err(Report::new(FatalError::OutstandingAllocation {
                device: handle.name().to_string(),
                allocated: quota.allocated,
            })));
        }

        let quota = self.devices.remove(handle.id())?;
        self.desired = self.desired.saturating_sub(quota.desired - floor);

        // The floor itself stays in the reserve until the next balance.
        let mut entitled = quota.entitled.saturating_sub(floor);
        if entitled > 0 && self.spare < floor {
            let tmp = entitled.min(floor - self.spare);
            self.spare += tmp;
            entitled -= tmp;
        }

        self.excess.size += entitled;
        self.excess.free += entitled;
        self.reserve.size -= entitled;
        self.refresh_min();
        Some(Ok(()))
    }
}

impl QuotaPool {
    /// Bring a device into the pool when it is discovered on the bus.
    ///
    /// `desired` is the driver's declared DMA need, or `None` when the driver
    /// has no such capability; either way the device starts with exactly the
    /// floor share. Fails with [`QuotaError::Exhausted`] when the floor share
    /// cannot be carved out, in which case the device must not do DMA.
    pub fn admit(
        &self,
        name: impl Into<Arc<str>>,
        desired: Option<u64>,
    ) -> Result<DeviceHandle, QuotaError> {
        let name = name.into();
        let mut state = self.lock();
        match state.admit(name.clone(), desired) {
            Ok(handle) => {
                tracing::info!(
                    device = %name,
                    id = %handle.id(),
                    desired = state.devices.get(handle.id()).map(|q| q.desired),
                    "device admitted"
                );
                self.schedule_balance(&mut state, Duration::ZERO);
                Ok(handle)
            }
            Err(report) => {
                tracing::warn!(
                    device = %name,
                    error = %report.current_context(),
                    "insufficient free entitlement to add device"
                );
                Err(report)
            }
        }
    }

    /// Take a device out of the pool at bus-remove time. The device must have
    /// released every allocation first; otherwise the accounting is broken and
    /// a [`FatalError`] is returned with the device still registered.
    pub fn remove(&self, handle: &DeviceHandle) -> Result<(), FatalError> {
        let mut state = self.lock();
        match state.remove(handle) {
            Some(Ok(())) => {
                tracing::info!(device = handle.name(), id = %handle.id(), "device removed");
                self.schedule_balance(&mut state, Duration::ZERO);
                Ok(())
            }
            Some(Err(report)) => {
                tracing::error!(
                    device = handle.name(),
                    error = %report.current_context(),
                    "removing device with outstanding allocation"
                );
                Err(report)
            }
            None => {
                tracing::debug!(device = handle.name(), "device already removed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::pool::tests::{assert_invariants, cfg};
    use crate::pool::Bucket;

    #[test]
    fn provisioned_device_only_folds_desire() {
        let mut state = PoolState::new(cfg(100, 10), 1000, 1).expect("init");
        let handle = state.admit(Arc::from("vscsi0"), Some(350)).expect("admit");

        assert_eq!(state.provisioned, 0);
        assert_eq!(state.min, 200);
        assert_eq!(state.desired, 450);
        assert_eq!(state.reserve.size, 200);
        assert_eq!(state.excess, Bucket { size: 800, free: 800 });
        let quota = state.devices.get(handle.id()).expect("dev");
        assert_eq!((quota.entitled, quota.desired, quota.allocated), (100, 350, 0));
        assert_invariants(&state);
    }

    #[test]
    fn hotplugged_device_carves_floor_from_excess() {
        let mut state = PoolState::new(cfg(100, 10), 1000, 0).expect("init");
        state.admit(Arc::from("veth0"), None).expect("admit");

        assert_eq!(state.min, 200);
        assert_eq!(state.desired, 200);
        assert_eq!(state.reserve.size, 200);
        assert_eq!(state.excess, Bucket { size: 800, free: 800 });
        assert_eq!(state.spare, 100);
        assert_invariants(&state);
    }

    #[test]
    fn hotplug_falls_back_to_spare() {
        let mut state = PoolState::new(cfg(100, 10), 1000, 0).expect("init");
        state.excess.free = 30;
        state.admit(Arc::from("veth0"), None).expect("admit");

        assert_eq!(state.excess, Bucket { size: 870, free: 0 });
        assert_eq!(state.reserve.size, 130);
        assert_eq!(state.spare, 30);
        assert_eq!(state.min, 130);
        assert_invariants(&state);
    }

    #[test]
    fn floors_paid_from_spare_keep_reserve_above_min() {
        let mut state = PoolState::new(cfg(100, 10), 300, 0).expect("init");
        for name in ["a", "b", "c"] {
            state.admit(Arc::from(name), None).expect("admit");
        }

        assert_eq!(state.spare, 0);
        assert_eq!(state.reserve.size, 300);
        assert_eq!(state.min, 300);
        assert_invariants(&state);
    }

    #[test]
    fn hotplug_without_room_is_refused() {
        let mut state = PoolState::new(cfg(100, 10), 1000, 0).expect("init");
        state.excess.free = 30;
        state.spare = 60;
        let before = state.stats();

        let err = state.admit(Arc::from("veth0"), None).expect_err("no room");
        assert_eq!(
            err.current_context(),
            &QuotaError::Exhausted {
                requested: 100,
                available: 90
            }
        );
        assert_eq!(state.stats(), before);
    }

    #[test]
    fn desire_is_aligned_and_floored() {
        let mut config = cfg(100, 10);
        config.iommu_page_size = 64;
        let mut state = PoolState::new(config, 1000, 0).expect("init");
        let small = state.admit(Arc::from("a"), Some(10)).expect("admit");
        let odd = state.admit(Arc::from("b"), Some(130)).expect("admit");

        assert_eq!(state.devices.get(small.id()).expect("a").desired, 100);
        assert_eq!(state.devices.get(odd.id()).expect("b").desired, 192);
    }

    #[test]
    fn huge_desire_on_admit_saturates() {
        let mut state = PoolState::new(cfg(100, 10), 1000, 1).expect("init");
        state.admit(Arc::from("a"), Some(u64::MAX)).expect("provisioned");
        state.admit(Arc::from("b"), Some(u64::MAX)).expect("hotplug");

        assert_eq!(state.desired, u64::MAX);
        state.balance().expect("balance");
        assert_invariants(&state);
    }

    #[test]
    fn removal_with_allocation_is_fatal() {
        let mut state = PoolState::new(cfg(100, 10), 1000, 0).expect("init");
        let handle = state.admit(Arc::from("vscsi0"), None).expect("admit");
        state.allocate(handle.id(), 10).expect("dev").expect("alloc");

        let err = state.remove(&handle).expect("dev").expect_err("fatal");
        assert_eq!(
            err.current_context(),
            &FatalError::OutstandingAllocation {
                device: "vscsi0".to_string(),
                allocated: 10
            }
        );
        assert!(state.devices.get(handle.id()).is_some());
    }

    #[test]
    fn removal_returns_above_floor_share() {
        let mut state = PoolState::new(cfg(100, 10), 1000, 0).expect("init");
        let handle = state.admit(Arc::from("vscsi0"), Some(400)).expect("admit");
        // as after a balance pass
        state.devices.get_mut(handle.id()).expect("dev").entitled = 400;
        state.reserve.size += 300;
        state.excess.size -= 300;
        state.excess.free -= 300;
        state.spare = 50;
        assert_invariants(&state);

        state.remove(&handle).expect("dev").expect("removed");
        assert_eq!(state.spare, 100);
        assert_eq!(state.excess, Bucket { size: 750, free: 750 });
        assert_eq!(state.reserve.size, 250);
        assert_eq!(state.desired, 200);
        assert_eq!(state.devices.len(), 0);
        assert_invariants(&state);
        assert!(state.remove(&handle).is_none());
    }
}
