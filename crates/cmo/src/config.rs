use std::time::Duration;

use error_stack::Report;
use serde::Deserialize;

use crate::{QuotaError, Result};

/// Tunables for the entitlement pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CmoConfig {
    /// Minimum entitlement guaranteed to every participating device; also the
    /// size of the spare reserve.
    pub floor: u64,
    /// Largest increment the balancer hands a device per water-filling pass.
    pub balance_chunk: u64,
    /// Debounce before a balancer run triggered by a deallocation.
    pub balance_delay_ms: u64,
    /// Granularity of streaming mappings.
    pub iommu_page_size: u64,
    /// Granularity of coherent allocations.
    pub page_size: u64,
}

impl Default for CmoConfig {
    fn default() -> Self {
        Self {
            floor: 1_562_624,
            balance_chunk: 131_072,
            balance_delay_ms: 1_000,
            iommu_page_size: 4_096,
            page_size: 4_096,
        }
    }
}

impl CmoConfig {
    pub fn balance_delay(&self) -> Duration {
        Duration::from_millis(self.balance_delay_ms)
    }

    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.floor == 0 {
            return Err(Report::new(QuotaError::invalid_config(
                "floor must be greater than zero",
            )));
        }
        if self.balance_chunk == 0 {
            return Err(Report::new(QuotaError::invalid_config(
                "balance_chunk must be greater than zero",
            )));
        }
        if !self.iommu_page_size.is_power_of_two() {
            return Err(Report::new(QuotaError::invalid_config(format!(
                "iommu_page_size {} is not a power of two",
                self.iommu_page_size
            ))));
        }
        if !self.page_size.is_power_of_two() {
            return Err(Report::new(QuotaError::invalid_config(format!(
                "page_size {} is not a power of two",
                self.page_size
            ))));
        }
        Ok(())
    }

    /// Round a streaming mapping length up to IOMMU granularity.
    pub fn iommu_align(&self, n: u64) -> u64 {
        round_up(n, self.iommu_page_size)
    }

    /// Round a coherent allocation length up to page granularity.
    pub fn page_align(&self, n: u64) -> u64 {
        round_up(n, self.page_size)
    }
}

pub(crate) fn round_up(n: u64, base: u64) -> u64 {
    if !n.is_multiple_of(base) {
        n.saturating_add(base - (n % base))
    } else {
        n
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn rounds_up_to_granularity() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(CmoConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_floor_and_odd_pages() {
        let cfg = CmoConfig {
            floor: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = CmoConfig {
            iommu_page_size: 3000,
            ..Default::default()
        };
        let err = cfg.validate().expect_err("non power of two page");
        assert!(matches!(
            err.current_context(),
            QuotaError::InvalidConfiguration { .. }
        ));
    }

    #[test]
    fn partial_input_keeps_defaults() {
        let cfg: CmoConfig =
            serde_json::from_str(r#"{"floor": 100, "balanceDelayMs": 5}"#).expect("parse");
        assert_eq!(cfg.floor, 100);
        assert_eq!(cfg.balance_delay(), Duration::from_millis(5));
        assert_eq!(cfg.balance_chunk, 131_072);
    }
}
