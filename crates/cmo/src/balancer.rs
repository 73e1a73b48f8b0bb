//! Background redistribution of the reserve pool.
//!
//! # Algorithm
//!
//! 1. Recompute the floor requirement (`min`) from the known devices.
//! 2. Reset every device to the floor and subtract what is already pinned
//!    (the larger of its allocation and its floor) from the distributable
//!    capacity, then refill the spare from what remains.
//! 3. Water-fill: raise every device still below its desire by at most one
//!    chunk per pass, until every device is satisfied or nothing is left to
//!    hand out. Each grant is charged against what the device held before it.
//! 4. Rebuild the reserve/excess split from the new per-device shares.
//!
//! Runs are requested by the other operations and coalesce: while one is
//! pending, further requests are dropped.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pool::{PoolState, QuotaPool};
use crate::{FatalError, QuotaError, Result};

impl PoolState {
    pub(crate) fn balance(&mut self) -> Result<(), FatalError> {
        let floor = self.floor();
        let chunk = self.cfg.balance_chunk;

        let known = (self.devices.len() as u64).saturating_add(self.provisioned);
        let min = known.saturating_mul(floor);
        if min > self.entitled {
            return Err(Report::new(FatalError::MinimumExceedsEntitlement {
                min,
                entitled: self.entitled,
            }));
        }
        // Capacity pinned by floors and by allocations above them. The spare
        // only comes out of what is left.
        let pinned = self
            .devices
            .values()
            .map(|quota| quota.allocated.max(floor))
            .sum::<u64>()
            .saturating_add(self.provisioned.saturating_mul(floor));
        self.spare = floor.min(self.entitled.saturating_sub(pinned));
        self.min = min + self.spare;
        self.desired = self.min;

        let mut avail = self.entitled.saturating_sub(pinned.saturating_add(self.spare));
        for quota in self.devices.values_mut() {
            quota.entitled = floor;
            self.desired = self.desired.saturating_add(quota.desired - floor);
        }

        let devcount = self.devices.len();
        while avail > 0 {
            let mut fulfilled = 0;
            for quota in self.devices.values_mut() {
                if quota.entitled >= quota.desired {
                    fulfilled += 1;
                    continue;
                }

                let prev = quota.entitled;
                let grant = avail.min(chunk).min(quota.desired - prev);
                quota.entitled += grant;

                // Growth already covered by the device's allocation does not
                // come out of the distributable capacity.
                let need = quota
                    .allocated
                    .max(quota.entitled)
                    .saturating_sub(quota.allocated.max(prev));
                avail = avail.saturating_sub(need);
            }
            if fulfilled == devcount {
                break;
            }
        }

        let mut reserve = self.min;
        let mut need = 0;
        for quota in self.devices.values() {
            reserve += quota.entitled - floor;
            need += quota.allocated.saturating_sub(quota.entitled);
        }
        self.reserve.size = reserve;
        self.excess.size = self.entitled.saturating_sub(reserve);
        self.excess.free = self.excess.size.saturating_sub(need);

        self.balance_pending = false;
        Ok(())
    }
}

impl QuotaPool {
    /// Run the balancer now, holding the pool lock for the whole pass.
    pub fn balance(&self) -> Result<(), FatalError> {
        let mut state = self.lock();
        state.balance().inspect_err(|report| {
            tracing::error!(error = %report.current_context(), "balancer found broken accounting");
        })?;
        tracing::debug!(
            entitled = state.entitled,
            reserve = state.reserve.size,
            excess = state.excess.size,
            excess_free = state.excess.free,
            spare = state.spare,
            desired = state.desired,
            "pool balanced"
        );
        Ok(())
    }

    /// Start the background balancer on the current tokio runtime.
    ///
    /// The task runs until `cancellation_token` fires. A fatal accounting
    /// error ends it early and is returned through the handle. Only one
    /// balancer may be attached to a pool.
    pub fn spawn_balancer(
        self: &Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> Result<JoinHandle<Result<(), FatalError>>, QuotaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.set_balance_sender(tx.clone()) {
            return Err(Report::new(QuotaError::invalid_config(
                "a balancer is already attached to this pool",
            )));
        }

        // Requests made before the worker existed only set the pending flag.
        if self.balance_pending() && tx.send(Duration::ZERO).is_err() {
            tracing::debug!("balancer channel closed before start, run stays pending");
        }

        let pool = self.clone();
        Ok(tokio::spawn(async move {
            tracing::info!("Starting entitlement balancer task");
            let result = pool.run_balancer(rx, cancellation_token).await;
            tracing::info!("Entitlement balancer task completed");
            result
        }))
    }

    async fn run_balancer(
        &self,
        mut requests: mpsc::UnboundedReceiver<Duration>,
        cancellation_token: CancellationToken,
    ) -> Result<(), FatalError> {
        loop {
            let delay = tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("balancer shutdown requested");
                    return Ok(());
                }
                request = requests.recv() => match request {
                    Some(delay) => delay,
                    None => return Ok(()),
                },
            };

            if !delay.is_zero() {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        tracing::info!("balancer shutdown requested");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if !self.balance_pending() {
                // Someone ran the balancer inline in the meantime.
                continue;
            }
            self.balance()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use std::sync::Arc;

    use super::*;
    use crate::device::DeviceId;
    use crate::pool::tests::{assert_invariants, cfg};
    use crate::pool::Bucket;

    fn admit(state: &mut PoolState, name: &str, desired: u64) -> DeviceId {
        state
            .admit(Arc::from(name), Some(desired))
            .expect("admit")
            .id()
    }

    #[test]
    fn single_device_converges_to_entitlement_minus_spare() {
        let mut state = PoolState::new(cfg(100, 50), 1000, 0).expect("init");
        let dev = admit(&mut state, "vscsi0", 1000);
        state.balance().expect("balance");

        assert_eq!(state.devices.get(dev).expect("dev").entitled, 900);
        assert_eq!(state.spare, 100);
        assert_eq!(state.min, 200);
        assert_eq!(state.desired, 1100);
        assert_eq!(state.reserve.size, 1000);
        assert_eq!(state.excess, Bucket { size: 0, free: 0 });
        assert!(!state.balance_pending);
        assert_invariants(&state);
    }

    #[test]
    fn devices_at_floor_stay_at_floor() {
        let mut state = PoolState::new(cfg(100, 50), 1000, 0).expect("init");
        let a = admit(&mut state, "a", 100);
        let b = admit(&mut state, "b", 100);
        state.balance().expect("balance");

        assert_eq!(state.devices.get(a).expect("a").entitled, 100);
        assert_eq!(state.devices.get(b).expect("b").entitled, 100);
        assert_eq!(state.reserve.size, 300);
        assert_eq!(state.excess, Bucket { size: 700, free: 700 });
        assert_invariants(&state);
    }

    #[test]
    fn water_filling_is_max_min_fair() {
        // 1000 entitled, spare 100, floors 300: 600 to hand out.
        let mut state = PoolState::new(cfg(100, 50), 1000, 0).expect("init");
        let small = admit(&mut state, "small", 200);
        let big = admit(&mut state, "big", 2000);
        let other = admit(&mut state, "other", 2000);
        state.balance().expect("balance");

        assert_eq!(state.devices.get(small).expect("small").entitled, 200);
        assert_eq!(state.devices.get(big).expect("big").entitled, 350);
        assert_eq!(state.devices.get(other).expect("other").entitled, 350);
        assert_eq!(state.excess.size, 0);
        assert_invariants(&state);
    }

    #[test]
    fn allocation_above_share_stays_out_of_excess_free() {
        let mut state = PoolState::new(cfg(100, 50), 1000, 0).expect("init");
        let dev = admit(&mut state, "vscsi0", 100);
        state.allocate(dev, 400).expect("dev").expect("alloc");
        state.balance().expect("balance");

        assert_eq!(state.devices.get(dev).expect("dev").entitled, 100);
        assert_eq!(state.excess, Bucket { size: 800, free: 500 });
        assert_invariants(&state);
    }

    #[test]
    fn allocations_above_floor_squeeze_the_spare() {
        let mut state = PoolState::new(cfg(100, 50), 1000, 0).expect("init");
        let a = admit(&mut state, "a", 100);
        state.allocate(a, 800).expect("dev").expect("alloc");
        admit(&mut state, "b", 100);
        // excess is fully used, so the third floor comes out of the spare
        admit(&mut state, "c", 100);
        assert_eq!(state.spare, 0);

        state.balance().expect("balance");
        assert_eq!(state.spare, 0);
        assert_eq!(state.reserve.size, 300);
        assert_eq!(state.excess, Bucket { size: 700, free: 0 });
        assert_invariants(&state);

        state.deallocate(a, 700).expect("dev");
        assert_eq!(state.spare, 100);
        assert_eq!(state.excess, Bucket { size: 600, free: 600 });
        assert_invariants(&state);
    }

    #[test]
    fn capped_grant_is_charged_from_previous_share() {
        let mut state = PoolState::new(cfg(64, 64), 256, 0).expect("init");
        state.update_entitlement(1133).expect("grow");
        let d0 = admit(&mut state, "d0", 361);
        admit(&mut state, "d1", 64);
        let d2 = admit(&mut state, "d2", 577);
        state.allocate(d2, 169).expect("dev").expect("alloc");
        admit(&mut state, "d3", 64);
        state.allocate(d2, 284).expect("dev").expect("alloc");
        admit(&mut state, "d4", 64);
        assert_invariants(&state);

        state.balance().expect("balance");
        assert_eq!(state.devices.get(d0).expect("d0").entitled, 361);
        // 453 allocated plus the 63 left after d0 was satisfied
        assert_eq!(state.devices.get(d2).expect("d2").entitled, 516);
        assert_eq!(state.reserve.size, 1133);
        assert_eq!(state.excess, Bucket { size: 0, free: 0 });
        assert_invariants(&state);
    }

    #[test]
    fn provisioned_floors_survive_balance() {
        let mut state = PoolState::new(cfg(100, 50), 1000, 2).expect("init");
        admit(&mut state, "a", 100);
        state.balance().expect("balance");

        assert_eq!(state.provisioned, 1);
        assert_eq!(state.min, 300);
        assert_eq!(state.reserve.size, 300);
        assert_eq!(state.excess, Bucket { size: 700, free: 700 });
    }

    #[test]
    fn minimum_above_entitlement_is_fatal() {
        let mut state = PoolState::new(cfg(100, 50), 300, 0).expect("init");
        admit(&mut state, "a", 100);
        admit(&mut state, "b", 100);
        state.entitled = 150;

        let err = state.balance().expect_err("fatal");
        assert_eq!(
            err.current_context(),
            &FatalError::MinimumExceedsEntitlement {
                min: 200,
                entitled: 150
            }
        );
    }

    #[test]
    fn spare_shrinks_when_entitlement_is_tight() {
        let mut state = PoolState::new(cfg(100, 50), 250, 0).expect("init");
        admit(&mut state, "a", 500);
        state.balance().expect("balance");

        assert_eq!(state.spare, 100);
        state.entitled = 150;
        state.reserve.size = 150;
        state.excess = Bucket::default();
        state.balance().expect("balance");
        assert_eq!(state.spare, 50);
        assert_invariants(&state);
    }
}
