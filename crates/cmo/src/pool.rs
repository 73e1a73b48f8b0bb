//! The global entitlement record and its lock.
//!
//! All accounting lives in [`PoolState`] behind a single mutex. The operation
//! modules (`admission`, `entitlement`, `membership`, `desired`, `balancer`)
//! add the state transitions as `impl PoolState` blocks and expose them
//! through locked wrappers on [`QuotaPool`].

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use error_stack::{Report, ResultExt};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::CmoConfig;
use crate::device::{DeviceHandle, DeviceStats, DeviceTable};
use crate::{FatalError, QuotaError, Result};

/// Size and free portion of a pool of capacity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bucket {
    pub(crate) size: u64,
    pub(crate) free: u64,
}

/// Source of the entitlement granted by the hypervisor at start-up.
pub trait EntitlementSource {
    fn query_entitlement(&self) -> Result<u64, QuotaError>;
}

impl EntitlementSource for u64 {
    fn query_entitlement(&self) -> Result<u64, QuotaError> {
        Ok(*self)
    }
}

#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) cfg: CmoConfig,
    pub(crate) entitled: u64,
    /// Backs guaranteed per-device shares; the spare is carved out of it.
    pub(crate) reserve: Bucket,
    pub(crate) excess: Bucket,
    pub(crate) spare: u64,
    pub(crate) min: u64,
    pub(crate) desired: u64,
    pub(crate) curr: u64,
    pub(crate) high: u64,
    /// Floor shares reserved at start-up that no device has claimed yet.
    pub(crate) provisioned: u64,
    pub(crate) devices: DeviceTable,
    pub(crate) balance_pending: bool,
}

impl PoolState {
    pub(crate) fn new(
        cfg: CmoConfig,
        entitled: u64,
        expected_devices: u64,
    ) -> Result<Self, FatalError> {
        let required = expected_devices
            .saturating_add(1)
            .saturating_mul(cfg.floor);
        if required > entitled {
            return Err(Report::new(FatalError::InsufficientEntitlement {
                entitled,
                required,
            }));
        }

        Ok(Self {
            entitled,
            reserve: Bucket {
                size: required,
                free: 0,
            },
            excess: Bucket {
                size: entitled - required,
                free: entitled - required,
            },
            spare: cfg.floor,
            min: required,
            desired: required,
            curr: 0,
            high: 0,
            provisioned: expected_devices,
            devices: DeviceTable::default(),
            balance_pending: false,
            cfg,
        })
    }

    pub(crate) fn floor(&self) -> u64 {
        self.cfg.floor
    }

    /// Re-derive `min` (one floor per known device plus the spare) after the
    /// spare or the participant count changed.
    pub(crate) fn refresh_min(&mut self) {
        let known = (self.devices.len() as u64).saturating_add(self.provisioned);
        self.min = known.saturating_mul(self.floor()).saturating_add(self.spare);
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            entitled: self.entitled,
            reserve_size: self.reserve.size,
            excess_size: self.excess.size,
            excess_free: self.excess.free,
            spare: self.spare,
            min: self.min,
            desired: self.desired,
            curr: self.curr,
            high: self.high,
            participants: self.devices.len(),
        }
    }

    pub(crate) fn unknown(handle: &DeviceHandle) -> Report<QuotaError> {
        Report::new(QuotaError::UnknownDevice {
            device: handle.name().to_string(),
        })
    }
}

/// Read-only view of the pool counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub entitled: u64,
    pub reserve_size: u64,
    pub excess_size: u64,
    pub excess_free: u64,
    pub spare: u64,
    pub min: u64,
    pub desired: u64,
    pub curr: u64,
    pub high: u64,
    pub participants: usize,
}

/// Shared handle to the entitlement pool.
#[derive(Debug)]
pub struct QuotaPool {
    state: Mutex<PoolState>,
    balance_tx: OnceLock<mpsc::UnboundedSender<Duration>>,
}

impl QuotaPool {
    /// Start the pool with `entitled` bytes, pre-reserving one floor share for
    /// each of the `expected_devices` that will be admitted shortly.
    pub fn new(
        cfg: CmoConfig,
        entitled: u64,
        expected_devices: u64,
    ) -> Result<Arc<Self>, FatalError> {
        cfg.validate()
            .change_context(FatalError::InvalidConfiguration)?;

        let state = PoolState::new(cfg, entitled, expected_devices).inspect_err(|report| {
            tracing::error!(error = %report.current_context(), "cannot start entitlement pool");
        })?;

        tracing::info!(
            entitled,
            expected_devices,
            reserve = state.reserve.size,
            excess = state.excess.size,
            "entitlement pool initialized"
        );

        Ok(Arc::new(Self {
            state: Mutex::new(state),
            balance_tx: OnceLock::new(),
        }))
    }

    /// Like [`QuotaPool::new`], asking `source` for the entitlement. A failed
    /// query starts the pool with zero entitlement, which is fatal unless the
    /// floor requirement is zero too.
    pub fn from_source<S: EntitlementSource + ?Sized>(
        cfg: CmoConfig,
        source: &S,
        expected_devices: u64,
    ) -> Result<Arc<Self>, FatalError> {
        let entitled = source.query_entitlement().unwrap_or_else(|report| {
            tracing::error!(error = ?report, "unable to determine system IO entitlement");
            0
        });
        Self::new(cfg, entitled, expected_devices)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a balancer run unless one is already pending.
    pub(crate) fn schedule_balance(&self, state: &mut PoolState, delay: Duration) {
        if state.balance_pending {
            return;
        }
        state.balance_pending = true;
        if let Some(tx) = self.balance_tx.get() {
            if tx.send(delay).is_err() {
                tracing::debug!("balancer worker is gone, run stays pending");
            }
        }
    }

    pub(crate) fn set_balance_sender(&self, tx: mpsc::UnboundedSender<Duration>) -> bool {
        self.balance_tx.set(tx).is_ok()
    }

    pub fn config(&self) -> CmoConfig {
        self.lock().cfg.clone()
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats()
    }

    pub fn device_stats(&self, handle: &DeviceHandle) -> Option<DeviceStats> {
        let state = self.lock();
        state
            .devices
            .get(handle.id())
            .map(|quota| quota.stats(handle.id()))
    }

    pub fn devices(&self) -> Vec<DeviceStats> {
        let state = self.lock();
        state
            .devices
            .iter()
            .map(|(id, quota)| quota.stats(id))
            .collect()
    }

    /// Whether a balancer run has been requested and not yet performed.
    pub fn balance_pending(&self) -> bool {
        self.lock().balance_pending
    }

    /// Reset the historical peak to the current outstanding allocation.
    pub fn reset_high(&self) {
        let mut state = self.lock();
        state.high = state.curr;
    }

    pub fn reset_allocs_failed(&self, handle: &DeviceHandle) -> Result<(), QuotaError> {
        let state = self.lock();
        let quota = state
            .devices
            .get(handle.id())
            .ok_or_else(|| PoolState::unknown(handle))?;
        quota
            .allocs_failed
            .store(0, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    pub(crate) fn cfg(floor: u64, chunk: u64) -> CmoConfig {
        CmoConfig {
            floor,
            balance_chunk: chunk,
            balance_delay_ms: 100,
            iommu_page_size: 1,
            page_size: 1,
        }
    }

    /// Checks the accounting invariants that must hold between operations.
    pub(crate) fn assert_invariants(state: &PoolState) {
        assert_eq!(
            state.entitled,
            state.reserve.size + state.excess.size,
            "entitled must equal reserve + excess"
        );
        assert!(state.spare <= state.floor(), "spare above floor");
        assert!(state.curr <= state.entitled, "curr above entitled");
        assert!(state.excess.free <= state.excess.size, "excess free above size");
        assert!(state.reserve.size >= state.min, "reserve below min");
        let absorbed = state.excess.size - state.excess.free;
        for quota in state.devices.values() {
            assert!(quota.entitled >= state.floor(), "device share below floor");
            assert!(
                quota.allocated <= quota.entitled + absorbed,
                "device allocation not covered"
            );
        }
    }

    #[test]
    fn init_reserves_spare_and_expected_floors() {
        let state = PoolState::new(cfg(100, 10), 1000, 3).expect("init");
        assert_eq!(state.reserve.size, 400);
        assert_eq!(state.excess, Bucket { size: 600, free: 600 });
        assert_eq!(state.spare, 100);
        assert_eq!(state.min, 400);
        assert_eq!(state.desired, 400);
        assert_eq!(state.provisioned, 3);
        assert_invariants(&state);
    }

    #[test]
    fn init_with_too_little_entitlement_is_fatal() {
        let err = PoolState::new(cfg(100, 10), 250, 2).expect_err("fatal");
        assert_eq!(
            err.current_context(),
            &FatalError::InsufficientEntitlement {
                entitled: 250,
                required: 300
            }
        );
    }

    struct FailingSource;

    impl EntitlementSource for FailingSource {
        fn query_entitlement(&self) -> Result<u64, QuotaError> {
            Err(Report::new(QuotaError::invalid_config("no firmware")))
        }
    }

    #[test]
    fn failed_entitlement_query_is_fatal() {
        let err = QuotaPool::from_source(cfg(100, 10), &FailingSource, 0).expect_err("fatal");
        assert!(matches!(
            err.current_context(),
            FatalError::InsufficientEntitlement { entitled: 0, .. }
        ));
    }

    #[test]
    fn invalid_config_is_rejected_at_start() {
        let err = QuotaPool::new(cfg(100, 0), 1000, 0).expect_err("zero chunk");
        assert_eq!(err.current_context(), &FatalError::InvalidConfiguration);
    }

    #[test]
    fn reset_high_tracks_current() {
        let pool = QuotaPool::new(cfg(100, 10), 1000, 0).expect("init");
        {
            let mut state = pool.lock();
            state.curr = 40;
            state.high = 90;
        }
        pool.reset_high();
        assert_eq!(pool.stats().high, 40);
    }
}
