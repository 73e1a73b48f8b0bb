use std::time::Duration;

use crate::device::{DeviceHandle, DeviceId};
use crate::pool::{PoolState, QuotaPool};

impl PoolState {
    /// Returns `false` when the device is not a participant.
    pub(crate) fn set_desired(&mut self, device: DeviceId, desired: u64) -> bool {
        let floor = self.floor();
        let desired = desired.max(floor);
        let Some(quota) = self.devices.get_mut(device) else {
            return false;
        };

        if desired >= quota.desired {
            self.desired = self.desired.saturating_add(desired - quota.desired);
            quota.desired = desired;
            return true;
        }

        self.desired = self.desired.saturating_sub(quota.desired - desired);
        quota.desired = desired;

        // Give back reserve above the new desire right away.
        if quota.entitled > desired {
            let released = quota.entitled - desired;
            self.reserve.size -= released;
            self.excess.size += released;
            if quota.allocated < quota.entitled {
                self.excess.free += quota.entitled - quota.allocated.max(desired);
            }
            quota.entitled = desired;
        }
        true
    }
}

impl QuotaPool {
    /// Change the entitlement a device would like to have. Increases are
    /// realized by the next balancer pass; decreases below the current share
    /// release the difference immediately. Unknown devices are ignored.
    pub fn set_desired(&self, device: &DeviceHandle, desired: u64) {
        let mut state = self.lock();
        if !state.set_desired(device.id(), desired) {
            tracing::debug!(device = device.name(), "set_desired on non-participant ignored");
            return;
        }
        tracing::info!(device = device.name(), desired, "desired entitlement changed");
        self.schedule_balance(&mut state, Duration::ZERO);
    }
}
