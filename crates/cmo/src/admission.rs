//! O(1) admission control on the map/unmap path.

use error_stack::Report;

use crate::device::{DeviceHandle, DeviceId};
use crate::pool::{PoolState, QuotaPool};
use crate::{QuotaError, Result};

impl PoolState {
    /// Charge `size` bytes to `device`, drawing on its own reserve first and
    /// the shared excess pool for the remainder.
    pub(crate) fn allocate(
        &mut self,
        device: DeviceId,
        size: u64,
    ) -> Option<Result<(), QuotaError>> {
        let spare_full = self.spare >= self.floor();
        let excess_free = self.excess.free;
        let quota = self.devices.get_mut(device)?;

        let reserve_free = quota.entitled.saturating_sub(quota.allocated);
        // Excess stays off limits while the spare itself is depleted.
        let excess_free = if spare_full { excess_free } else { 0 };
        let available = reserve_free.saturating_add(excess_free);

        if available < size {
            return Some(Err(Report::new(QuotaError::exhausted(size, available))));
        }

        quota.allocated += size;
        self.curr += size;
        self.high = self.high.max(self.curr);
        self.excess.free -= size - reserve_free.min(size);
        Some(Ok(()))
    }

    /// Return `size` bytes from `device`. Returns whether the pool shape
    /// changed enough to warrant a balancer run.
    pub(crate) fn deallocate(&mut self, device: DeviceId, size: u64) -> Option<bool> {
        let floor = self.floor();
        let quota = self.devices.get_mut(device)?;

        debug_assert!(size <= quota.allocated, "releasing more than allocated");
        let mut excess_freed = size.min(quota.allocated.saturating_sub(quota.entitled));
        let mut reserve_freed = size - excess_freed;
        quota.allocated = quota.allocated.saturating_sub(size);
        self.curr = self.curr.saturating_sub(size);

        let mut balance = false;
        let mut spare_needed = floor.saturating_sub(self.spare);

        // Refill the spare from excess, moving that entitlement into the reserve.
        if spare_needed > 0 && excess_freed > 0 {
            let tmp = excess_freed.min(spare_needed);
            self.excess.size -= tmp;
            self.reserve.size += tmp;
            self.spare += tmp;
            excess_freed -= tmp;
            spare_needed -= tmp;
            balance = true;
        }

        // Refill the spare from the device's own share, never below the floor.
        if spare_needed > 0 && reserve_freed > 0 {
            let tmp = spare_needed
                .min(reserve_freed)
                .min(quota.entitled.saturating_sub(floor));
            self.spare += tmp;
            quota.entitled -= tmp;
            reserve_freed -= tmp;
            balance = true;
        }
        if balance {
            self.refresh_min();
        }

        // Grow the reserve toward the aggregate desire.
        if excess_freed > 0 && self.desired > self.reserve.size {
            let tmp = excess_freed.min(self.desired - self.reserve.size);
            self.excess.size -= tmp;
            self.reserve.size += tmp;
            excess_freed -= tmp;
            balance = true;
        }

        self.excess.free += excess_freed;
        Some(balance)
    }
}

impl QuotaPool {
    /// Ask for `size` bytes of mapping capacity for `device`.
    ///
    /// `size` must already be rounded to IOMMU granularity. On failure nothing
    /// changed; the caller records the failure on the device and must not map.
    pub fn allocate(&self, device: &DeviceHandle, size: u64) -> Result<(), QuotaError> {
        let mut state = self.lock();
        match state.allocate(device.id(), size) {
            Some(Ok(())) => Ok(()),
            Some(Err(report)) => {
                tracing::debug!(
                    device = device.name(),
                    size,
                    error = %report.current_context(),
                    "allocation denied"
                );
                Err(report)
            }
            None => Err(PoolState::unknown(device)),
        }
    }

    /// Give back `size` bytes previously granted by [`QuotaPool::allocate`].
    /// Must be called exactly once per successful allocation, with the same
    /// rounded size.
    pub fn deallocate(&self, device: &DeviceHandle, size: u64) {
        let mut state = self.lock();
        match state.deallocate(device.id(), size) {
            Some(true) => {
                let delay = state.cfg.balance_delay();
                self.schedule_balance(&mut state, delay);
            }
            Some(false) => {}
            None => {
                tracing::warn!(device = device.name(), size, "deallocation for unknown device");
            }
        }
    }
}
