//! Runtime growth and shrink of the hypervisor-granted entitlement.

use std::time::Duration;

use error_stack::Report;

use crate::pool::{PoolState, QuotaPool};
use crate::{QuotaError, Result};

impl PoolState {
    /// Capacity a device could give back: entitlement above both its
    /// outstanding allocation and the floor.
    fn reclaimable(entitled: u64, allocated: u64, floor: u64) -> u64 {
        if entitled > allocated && entitled > floor {
            entitled - allocated.max(floor)
        } else {
            0
        }
    }

    pub(crate) fn update_entitlement(&mut self, new_entitlement: u64) -> Result<(), QuotaError> {
        let floor = self.floor();

        if new_entitlement >= self.entitled {
            let mut delta = new_entitlement - self.entitled;

            if self.spare < floor {
                let tmp = delta.min(floor - self.spare);
                self.spare += tmp;
                self.reserve.size += tmp;
                delta -= tmp;
                self.refresh_min();
            }

            self.excess.size += delta;
            self.excess.free += delta;
            self.entitled = new_entitlement;
            return Ok(());
        }

        let mut delta = self.entitled - new_entitlement;
        let mut avail = self.excess.free;
        for quota in self.devices.values() {
            if avail >= delta {
                break;
            }
            avail += Self::reclaimable(quota.entitled, quota.allocated, floor);
        }

        if avail < delta {
            return Err(Report::new(QuotaError::exhausted(delta, avail)));
        }

        let tmp = self.excess.free.min(delta);
        self.excess.size -= tmp;
        self.excess.free -= tmp;
        delta -= tmp;

        for quota in self.devices.values_mut() {
            if delta == 0 {
                break;
            }
            let tmp = Self::reclaimable(quota.entitled, quota.allocated, floor).min(delta);
            quota.entitled -= tmp;
            self.reserve.size -= tmp;
            delta -= tmp;
        }

        self.entitled = new_entitlement;
        Ok(())
    }
}

impl QuotaPool {
    /// Apply a new entitlement from the hypervisor. Shrinking fails with
    /// [`QuotaError::Exhausted`] when not enough unused capacity can be
    /// reclaimed; the pool is then unchanged.
    pub fn update_entitlement(&self, new_entitlement: u64) -> Result<(), QuotaError> {
        let mut state = self.lock();
        let old = state.entitled;
        if let Err(report) = state.update_entitlement(new_entitlement) {
            tracing::warn!(
                old,
                new = new_entitlement,
                error = %report.current_context(),
                "refused entitlement shrink"
            );
            return Err(report);
        }
        tracing::info!(old, new = new_entitlement, "entitlement updated");
        self.schedule_balance(&mut state, Duration::ZERO);
        Ok(())
    }
}
