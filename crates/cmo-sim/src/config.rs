use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use cmo::CmoConfig;
use serde::Deserialize;

#[derive(Parser)]
#[command(about, long_about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a scenario against a live entitlement pool
    Run(RunArgs),
    /// Parse a scenario and print the effective pool configuration
    Check(CheckArgs),
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    #[arg(
        value_hint = clap::ValueHint::FilePath,
        help = "Scenario file, e.g. scenarios/hotplug.yaml"
    )]
    pub scenario: PathBuf,

    #[arg(
        long,
        env = "CMO_STATS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path for pool snapshots written after every step, e.g. logs/cmo-stats.log"
    )]
    pub stats_file: Option<PathBuf>,

    #[arg(
        long,
        env = "CMO_ENTITLEMENT",
        help = "Override the scenario's start-up entitlement in bytes"
    )]
    pub entitlement: Option<u64>,

    #[arg(
        long,
        help = "Fail when a step's outcome differs from its `expect` field",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub strict: bool,
}

#[derive(Parser, Clone)]
pub struct CheckArgs {
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub scenario: PathBuf,
}

/// A scenario file: pool set-up followed by the steps to replay.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub config: CmoConfig,
    pub entitlement: u64,
    #[serde(default)]
    pub expected_devices: u64,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    Admit {
        name: String,
        desired: Option<u64>,
        #[serde(default)]
        expect: Expect,
    },
    Alloc {
        device: String,
        size: u64,
        #[serde(default)]
        expect: Expect,
    },
    Dealloc {
        device: String,
        size: u64,
    },
    /// Map a buffer through the DMA wrapper.
    Map {
        device: String,
        len: u64,
        #[serde(default)]
        coherent: bool,
        #[serde(default)]
        expect: Expect,
    },
    /// Unmap the device's oldest live mapping.
    Unmap {
        device: String,
    },
    Entitlement {
        size: u64,
        #[serde(default)]
        expect: Expect,
    },
    SetDesired {
        device: String,
        desired: u64,
    },
    Remove {
        device: String,
    },
    Balance,
    Sleep {
        ms: u64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expect {
    #[default]
    Any,
    Ok,
    Denied,
}

impl Expect {
    pub fn matches(self, ok: bool) -> bool {
        match self {
            Expect::Any => true,
            Expect::Ok => ok,
            Expect::Denied => !ok,
        }
    }
}

impl Scenario {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read scenario {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parse scenario {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let scenario: Scenario = serde_yaml::from_str(content)?;
        scenario
            .config
            .validate()
            .map_err(|report| anyhow::anyhow!("{}", report.current_context()))?;
        Ok(scenario)
    }
}
