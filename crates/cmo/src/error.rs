use derive_more::Display;

/// Recoverable failures. The operation that returned one left every
/// accounting field untouched.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// Not enough entitlement to satisfy the request.
    #[display("entitlement exhausted: requested {requested}, available {available}")]
    Exhausted { requested: u64, available: u64 },
    /// The DMA mapping collaborator refused the mapping.
    #[display("dma mapping failed: {reason}")]
    MappingFailed { reason: String },
    /// Configuration is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    /// The handle does not refer to a participating device.
    #[display("device {device} is not a participant")]
    UnknownDevice { device: String },
}

impl core::error::Error for QuotaError {}

impl QuotaError {
    pub fn exhausted(requested: u64, available: u64) -> Self {
        Self::Exhausted {
            requested,
            available,
        }
    }

    pub fn mapping(reason: impl Into<String>) -> Self {
        Self::MappingFailed {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Accounting invariant violations. Callers must not continue using the pool
/// after receiving one of these.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// The pool cannot start with the given tunables.
    #[display("unusable pool configuration")]
    InvalidConfiguration,
    /// The entitlement cannot cover the spare plus one floor per known device.
    #[display("insufficient system entitlement: have {entitled}, need {required}")]
    InsufficientEntitlement { entitled: u64, required: u64 },
    /// The balancer found more floor shares than entitlement.
    #[display("minimum entitlement {min} exceeds entitlement {entitled}")]
    MinimumExceedsEntitlement { min: u64, entitled: u64 },
    /// A device was removed while it still held mapped capacity.
    #[display("device {device} removed with {allocated} bytes still allocated")]
    OutstandingAllocation { device: String, allocated: u64 },
}

impl core::error::Error for FatalError {}
