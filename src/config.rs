//! Node configuration: role presets and the tunables they set defaults for.

use crate::types::ReceiptKind;
use clap::ValueEnum;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Producer,
    Bridge,
    Library,
    Constrained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingScope {
    OutboxAndPending,
    PendingPrioritized,
    All,
    EmergencyOnly,
}

/// The defaults a role sets; every field can still be overridden explicitly
/// by `NodeConfig`. Values per §6's role preset table.
#[derive(Debug, Clone)]
pub struct RolePreset {
    pub cache_budget_bytes: u64,
    pub ttl_scale: f64,
    pub grace_window: Duration,
    pub forwarding: ForwardingScope,
    pub default_receipt_policy: BTreeSet<ReceiptKind>,
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const DEFAULT_GRACE: Duration = Duration::from_secs(7 * 24 * 3600);

impl Role {
    pub fn preset(self) -> RolePreset {
        match self {
            Role::Producer => RolePreset {
                cache_budget_bytes: 512 * MIB,
                ttl_scale: 1.0,
                grace_window: DEFAULT_GRACE,
                forwarding: ForwardingScope::OutboxAndPending,
                default_receipt_policy: [ReceiptKind::Received, ReceiptKind::Delivered].into_iter().collect(),
            },
            Role::Bridge => RolePreset {
                cache_budget_bytes: 4 * GIB,
                ttl_scale: 1.0,
                grace_window: DEFAULT_GRACE,
                forwarding: ForwardingScope::PendingPrioritized,
                default_receipt_policy: [ReceiptKind::Forwarded].into_iter().collect(),
            },
            Role::Library => RolePreset {
                cache_budget_bytes: 16 * GIB,
                ttl_scale: 1.0,
                grace_window: DEFAULT_GRACE * 4,
                forwarding: ForwardingScope::All,
                default_receipt_policy: [ReceiptKind::Delivered].into_iter().collect(),
            },
            Role::Constrained => RolePreset {
                cache_budget_bytes: 64 * MIB,
                ttl_scale: 0.25,
                grace_window: DEFAULT_GRACE / 4,
                forwarding: ForwardingScope::EmergencyOnly,
                default_receipt_policy: BTreeSet::new(),
            },
        }
    }
}

/// Default cache budget for a node with no role preset selected, per the
/// normative reading of the (inconsistent) source defaults: 2 GiB.
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 2 * GIB;
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_EVICTOR_PERIOD: Duration = Duration::from_secs(30);
pub const MAX_PAYLOAD_BYTES: u64 = 16 * MIB;
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Option<Role>,
    pub cache_budget_bytes: u64,
    pub sweep_period: Duration,
    pub evictor_period: Duration,
    pub grace_window: Duration,
    pub forwarding: ForwardingScope,
    pub default_receipt_policy: BTreeSet<ReceiptKind>,
    pub data_dir: std::path::PathBuf,
    pub listen_addr: Option<std::net::SocketAddr>,
}

impl NodeConfig {
    pub fn from_role(role: Role, data_dir: std::path::PathBuf) -> Self {
        let preset = role.preset();
        Self {
            role: Some(role),
            cache_budget_bytes: preset.cache_budget_bytes,
            sweep_period: DEFAULT_SWEEP_PERIOD,
            evictor_period: DEFAULT_EVICTOR_PERIOD,
            grace_window: preset.grace_window,
            forwarding: preset.forwarding,
            default_receipt_policy: preset.default_receipt_policy,
            data_dir,
            listen_addr: None,
        }
    }

    pub fn default_with_data_dir(data_dir: std::path::PathBuf) -> Self {
        Self {
            role: None,
            cache_budget_bytes: DEFAULT_CACHE_BUDGET_BYTES,
            sweep_period: DEFAULT_SWEEP_PERIOD,
            evictor_period: DEFAULT_EVICTOR_PERIOD,
            grace_window: DEFAULT_GRACE,
            forwarding: ForwardingScope::All,
            default_receipt_policy: BTreeSet::new(),
            data_dir,
            listen_addr: None,
        }
    }
}
