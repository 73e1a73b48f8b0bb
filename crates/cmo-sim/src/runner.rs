//! Scenario replay against a live pool with its background balancer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use cmo::{
    CmoDma, DeviceHandle, DeviceStats, DmaAddr, DmaMapper, PoolStats, QuotaError, QuotaPool,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{Expect, Scenario, Step};
use crate::logging::STATS_TARGET;

/// Stand-in for the IOMMU: hands out increasing bus addresses and never fails.
#[derive(Debug, Default)]
pub(crate) struct SimMapper {
    next: AtomicU64,
}

impl DmaMapper for SimMapper {
    fn map(&self, _device: &DeviceHandle, len: u64) -> cmo::Result<DmaAddr, QuotaError> {
        let base = self.next.fetch_add(len.max(1), Ordering::Relaxed);
        Ok(DmaAddr(0x1000_0000 + base))
    }

    fn unmap(&self, device: &DeviceHandle, addr: DmaAddr, len: u64) {
        tracing::trace!(device = device.name(), addr = addr.0, len, "unmapped");
    }
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    addr: DmaAddr,
    len: u64,
    coherent: bool,
}

/// Result of one replayed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: usize,
    pub kind: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final state printed after a run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub pool: PoolStats,
    pub devices: Vec<DeviceStats>,
    pub outcomes: Vec<StepOutcome>,
}

pub struct Runner {
    dma: CmoDma<SimMapper>,
    devices: HashMap<String, DeviceHandle>,
    mappings: HashMap<String, VecDeque<Mapping>>,
    strict: bool,
}

impl Runner {
    pub fn new(pool: Arc<QuotaPool>, strict: bool) -> Self {
        Self {
            dma: CmoDma::new(pool, SimMapper::default()),
            devices: HashMap::new(),
            mappings: HashMap::new(),
            strict,
        }
    }

    fn pool(&self) -> &Arc<QuotaPool> {
        self.dma.pool()
    }

    fn device(&self, name: &str) -> anyhow::Result<&DeviceHandle> {
        self.devices
            .get(name)
            .with_context(|| format!("device {name} was never admitted"))
    }

    /// Replay every step, then stop the balancer and collect the final state.
    pub async fn run(mut self, steps: Vec<Step>) -> anyhow::Result<Report> {
        let cancellation_token = CancellationToken::new();
        let balancer = self
            .pool()
            .spawn_balancer(cancellation_token.clone())
            .map_err(|report| anyhow::anyhow!("{}", report.current_context()))?;

        let mut outcomes = Vec::with_capacity(steps.len());
        let mut result = Ok(());
        for (index, step) in steps.into_iter().enumerate() {
            match self.apply(index, step).await {
                Ok(outcome) => {
                    self.emit_snapshot(&outcome);
                    outcomes.push(outcome);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
            if balancer.is_finished() {
                break;
            }
        }

        cancellation_token.cancel();
        balancer
            .await
            .context("balancer task panicked")?
            .map_err(|report| anyhow::anyhow!("balancer stopped: {}", report.current_context()))?;
        result?;

        Ok(Report {
            pool: self.pool().stats(),
            devices: self.pool().devices(),
            outcomes,
        })
    }

    async fn apply(&mut self, index: usize, step: Step) -> anyhow::Result<StepOutcome> {
        let (kind, expect, outcome): (_, _, Result<(), String>) = match step {
            Step::Admit {
                name,
                desired,
                expect,
            } => {
                if self.devices.contains_key(&name) {
                    bail!("step {index}: device {name} admitted twice");
                }
                let outcome = match self.pool().admit(name.as_str(), desired) {
                    Ok(handle) => {
                        self.devices.insert(name, handle);
                        Ok(())
                    }
                    Err(report) => Err(report.current_context().to_string()),
                };
                ("admit", expect, outcome)
            }
            Step::Alloc {
                device,
                size,
                expect,
            } => {
                let handle = self.device(&device)?;
                let outcome = self.pool().allocate(handle, size).map_err(|report| {
                    handle.record_alloc_failure();
                    report.current_context().to_string()
                });
                ("alloc", expect, outcome)
            }
            Step::Dealloc { device, size } => {
                let handle = self.device(&device)?;
                let allocated = self
                    .pool()
                    .device_stats(handle)
                    .map(|stats| stats.allocated)
                    .unwrap_or_default();
                if size > allocated {
                    bail!("step {index}: {device} releases {size} but holds {allocated}");
                }
                self.pool().deallocate(handle, size);
                ("dealloc", Expect::Any, Ok(()))
            }
            Step::Map {
                device,
                len,
                coherent,
                expect,
            } => {
                let handle = self.device(&device)?.clone();
                let mapped = if coherent {
                    self.dma.alloc_coherent(&handle, len)
                } else {
                    self.dma.map_single(&handle, len)
                };
                let outcome = match mapped {
                    Ok(addr) => {
                        self.mappings.entry(device).or_default().push_back(Mapping {
                            addr,
                            len,
                            coherent,
                        });
                        Ok(())
                    }
                    Err(report) => Err(report.current_context().to_string()),
                };
                ("map", expect, outcome)
            }
            Step::Unmap { device } => {
                let handle = self.device(&device)?.clone();
                let mapping = self
                    .mappings
                    .get_mut(&device)
                    .and_then(VecDeque::pop_front)
                    .with_context(|| format!("step {index}: {device} has no live mapping"))?;
                if mapping.coherent {
                    self.dma.free_coherent(&handle, mapping.addr, mapping.len);
                } else {
                    self.dma.unmap_single(&handle, mapping.addr, mapping.len);
                }
                ("unmap", Expect::Any, Ok(()))
            }
            Step::Entitlement { size, expect } => {
                let outcome = self
                    .pool()
                    .update_entitlement(size)
                    .map_err(|report| report.current_context().to_string());
                ("entitlement", expect, outcome)
            }
            Step::SetDesired { device, desired } => {
                let handle = self.device(&device)?;
                self.pool().set_desired(handle, desired);
                ("setDesired", Expect::Any, Ok(()))
            }
            Step::Remove { device } => {
                let handle = self
                    .devices
                    .remove(&device)
                    .with_context(|| format!("device {device} was never admitted"))?;
                self.mappings.remove(&device);
                self.pool()
                    .remove(&handle)
                    .map_err(|report| {
                        anyhow::anyhow!("step {index}: {}", report.current_context())
                    })?;
                ("remove", Expect::Any, Ok(()))
            }
            Step::Balance => {
                self.pool()
                    .balance()
                    .map_err(|report| {
                        anyhow::anyhow!("step {index}: {}", report.current_context())
                    })?;
                ("balance", Expect::Any, Ok(()))
            }
            Step::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ("sleep", Expect::Any, Ok(()))
            }
        };

        let ok = outcome.is_ok();
        if self.strict && !expect.matches(ok) {
            bail!(
                "step {index} ({kind}): expected {expect:?}, got {}",
                outcome.err().unwrap_or_else(|| "success".to_string())
            );
        }
        if let Err(error) = &outcome {
            tracing::info!(step = index, kind, error = %error, "step denied");
        }

        Ok(StepOutcome {
            step: index,
            kind,
            ok,
            error: outcome.err(),
        })
    }

    fn emit_snapshot(&self, outcome: &StepOutcome) {
        let stats = self.pool().stats();
        tracing::info!(
            target: STATS_TARGET,
            tag_step = outcome.kind,
            step = outcome.step as u64,
            ok = outcome.ok,
            entitled = stats.entitled,
            reserve_size = stats.reserve_size,
            excess_size = stats.excess_size,
            excess_free = stats.excess_free,
            spare = stats.spare,
            min = stats.min,
            desired = stats.desired,
            curr = stats.curr,
            high = stats.high,
            participants = stats.participants as u64,
            "pool snapshot"
        );
    }
}

/// Build the pool a scenario describes and replay it.
pub async fn replay(scenario: Scenario, strict: bool) -> anyhow::Result<Report> {
    let pool = QuotaPool::new(
        scenario.config.clone(),
        scenario.entitlement,
        scenario.expected_devices,
    )
    .map_err(|report| anyhow::anyhow!("{}", report.current_context()))?;
    Runner::new(pool, strict).run(scenario.steps).await
}
