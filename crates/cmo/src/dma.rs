//! Entitlement-checked wrapper around the DMA mapping layer.
//!
//! Every mapping is charged to the device before the hardware is touched and
//! released after it is unmapped, with sizes rounded the same way on both
//! sides.

use std::sync::Arc;

use crate::config::CmoConfig;
use crate::device::DeviceHandle;
use crate::pool::QuotaPool;
use crate::{QuotaError, Result};

/// Bus address handed out by the mapping layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaAddr(pub u64);

/// Page-table programming collaborator.
pub trait DmaMapper: Send + Sync {
    fn map(&self, device: &DeviceHandle, len: u64) -> Result<DmaAddr, QuotaError>;
    fn unmap(&self, device: &DeviceHandle, addr: DmaAddr, len: u64);
}

#[derive(Debug)]
pub struct CmoDma<M: DmaMapper> {
    pool: Arc<QuotaPool>,
    mapper: M,
    cfg: CmoConfig,
}

impl<M: DmaMapper> CmoDma<M> {
    pub fn new(pool: Arc<QuotaPool>, mapper: M) -> Self {
        let cfg = pool.config();
        Self { pool, mapper, cfg }
    }

    pub fn pool(&self) -> &Arc<QuotaPool> {
        &self.pool
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    fn charge(&self, device: &DeviceHandle, size: u64) -> Result<(), QuotaError> {
        self.pool.allocate(device, size).inspect_err(|_| {
            device.record_alloc_failure();
        })
    }

    fn map_charged(
        &self,
        device: &DeviceHandle,
        len: u64,
        size: u64,
    ) -> Result<DmaAddr, QuotaError> {
        self.charge(device, size)?;
        self.mapper.map(device, len).inspect_err(|report| {
            tracing::debug!(
                device = device.name(),
                len,
                error = %report.current_context(),
                "mapping failed after charge"
            );
            self.pool.deallocate(device, size);
            device.record_alloc_failure();
        })
    }

    /// Map one streaming buffer.
    pub fn map_single(&self, device: &DeviceHandle, len: u64) -> Result<DmaAddr, QuotaError> {
        self.map_charged(device, len, self.cfg.iommu_align(len))
    }

    pub fn unmap_single(&self, device: &DeviceHandle, addr: DmaAddr, len: u64) {
        self.mapper.unmap(device, addr, len);
        self.pool.deallocate(device, self.cfg.iommu_align(len));
    }

    /// Allocate and map a coherent buffer, charged at page granularity.
    pub fn alloc_coherent(&self, device: &DeviceHandle, len: u64) -> Result<DmaAddr, QuotaError> {
        self.map_charged(device, len, self.cfg.page_align(len))
    }

    pub fn free_coherent(&self, device: &DeviceHandle, addr: DmaAddr, len: u64) {
        self.mapper.unmap(device, addr, len);
        self.pool.deallocate(device, self.cfg.page_align(len));
    }

    /// Map a scatter list. The whole list is charged up front; if any
    /// segment fails the mapped ones are torn down and the charge is
    /// returned.
    pub fn map_sg(
        &self,
        device: &DeviceHandle,
        segments: &[u64],
    ) -> Result<Vec<DmaAddr>, QuotaError> {
        let total: u64 = segments.iter().map(|&len| self.cfg.iommu_align(len)).sum();
        self.charge(device, total)?;

        let mut mapped = Vec::with_capacity(segments.len());
        for &len in segments {
            match self.mapper.map(device, len) {
                Ok(addr) => mapped.push(addr),
                Err(report) => {
                    tracing::debug!(
                        device = device.name(),
                        segment = mapped.len(),
                        error = %report.current_context(),
                        "scatter list mapping failed"
                    );
                    for (&addr, &len) in mapped.iter().zip(segments) {
                        self.mapper.unmap(device, addr, len);
                    }
                    self.pool.deallocate(device, total);
                    device.record_alloc_failure();
                    return Err(report);
                }
            }
        }
        Ok(mapped)
    }

    pub fn unmap_sg(&self, device: &DeviceHandle, segments: &[(DmaAddr, u64)]) {
        let mut total = 0;
        for &(addr, len) in segments {
            self.mapper.unmap(device, addr, len);
            total += self.cfg.iommu_align(len);
        }
        self.pool.deallocate(device, total);
    }
}
