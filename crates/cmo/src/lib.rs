//! Cooperative memory overcommitment for virtual I/O adapters.
//!
//! A hypervisor grants the partition a fixed amount of DMA-mappable memory
//! (the *entitlement*). This crate divides it among the participating devices:
//! - [`QuotaPool`]: the global record with admission control
//!   ([`QuotaPool::allocate`] / [`QuotaPool::deallocate`]), entitlement
//!   changes, device join/leave and the debounced background balancer.
//! - [`CmoDma`]: wraps a [`DmaMapper`] so that every mapping is charged
//!   against the device's share before the hardware is programmed.
//!
//! Recoverable failures are [`QuotaError`]; broken accounting is reported as
//! [`FatalError`] and callers must stop using the pool.

use error_stack::Report;

mod admission;
mod balancer;
mod config;
mod desired;
mod device;
mod dma;
mod entitlement;
mod error;
mod membership;
mod pool;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use config::CmoConfig;
pub use device::{DeviceHandle, DeviceId, DeviceStats};
pub use dma::{CmoDma, DmaAddr, DmaMapper};
pub use error::{FatalError, QuotaError};
pub use pool::{EntitlementSource, PoolStats, QuotaPool};
