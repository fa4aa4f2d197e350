//! Configuration model.
//!
//! TOML file carrying the instance identity, heartbeat settings, listen
//! addresses and the local node roster. Missing pieces fall back to
//! built-in defaults; a missing or unparseable file is a warning, not a
//! failure. The only piece rewritten at runtime is a node's HA role.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hwmgr_core::error::HwmError;
use hwmgr_core::ids::{NodeRole, SubsKind};

/// Default multicast base: groups live at `224.0.0.<base + offset>`.
pub const MCAST_BASE: u8 = 1;

/// Heartbeat periods may be given in milliseconds or seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    #[default]
    Ms,
    S,
}

/// One heartbeat setting: period plus miss threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    pub period: u64,
    pub resolution: Resolution,
    pub threshold: u32,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self { period: 1000, resolution: Resolution::Ms, threshold: 3 }
    }
}

impl Heartbeat {
    #[must_use]
    pub const fn period_ms(&self) -> u64 {
        match self.resolution {
            Resolution::Ms => self.period,
            Resolution::S => self.period * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heartbeats {
    /// Node-facing keepalive.
    pub node: Heartbeat,
    /// Cluster beacon period.
    pub cluster: Heartbeat,
    /// Wait before initial role resolution.
    pub ha: Heartbeat,
}

impl Default for Heartbeats {
    fn default() -> Self {
        Self {
            node: Heartbeat::default(),
            cluster: Heartbeat::default(),
            ha: Heartbeat { period: 3000, resolution: Resolution::Ms, threshold: 1 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for ListenAddr {
    fn default() -> Self {
        Self { ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Addresses {
    pub node_listen: ListenAddr,
    pub peer_listen: ListenAddr,
    pub multicast_port: u16,
}

impl Default for Addresses {
    fn default() -> Self {
        Self {
            node_listen: ListenAddr { ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 4999 },
            peer_listen: ListenAddr { ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 5000 },
            multicast_port: 5001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    /// Cluster-unique hardware index of this location.
    pub index: u32,
    /// Multicast group offset added to the base address.
    pub group: u8,
    pub heartbeat: Heartbeats,
    pub addresses: Addresses,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            index: 1,
            group: 0,
            heartbeat: Heartbeats::default(),
            addresses: Addresses::default(),
        }
    }
}

/// Configured HA role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigRole {
    Active,
    Passive,
    #[default]
    None,
}

impl From<ConfigRole> for NodeRole {
    fn from(role: ConfigRole) -> Self {
        match role {
            ConfigRole::Active => Self::Active,
            ConfigRole::Passive => Self::Passive,
            ConfigRole::None => Self::None,
        }
    }
}

impl From<NodeRole> for ConfigRole {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Active => Self::Active,
            NodeRole::Passive => Self::Passive,
            NodeRole::None => Self::None,
        }
    }
}

/// Subscription kinds understood by the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSubsKind {
    Group,
    Process,
    Interface,
    Node,
    Location,
}

impl From<ConfigSubsKind> for SubsKind {
    fn from(kind: ConfigSubsKind) -> Self {
        match kind {
            ConfigSubsKind::Group => Self::Group,
            ConfigSubsKind::Process => Self::Process,
            ConfigSubsKind::Interface => Self::Interface,
            ConfigSubsKind::Node => Self::Node,
            ConfigSubsKind::Location => Self::Location,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSubscription {
    pub kind: ConfigSubsKind,
    pub value: u32,
    #[serde(default)]
    pub cross_bind: bool,
}

/// A node expected to attach to this location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigNode {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub role: ConfigRole,
    pub group: u32,
    #[serde(default)]
    pub subscriptions: Vec<ConfigSubscription>,
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub instance: Instance,
    pub nodes: Vec<ConfigNode>,
    /// Where the config was loaded from; role persistence writes back
    /// here. Not part of the file itself.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Strict load: any read or parse failure is a configuration error.
    pub fn try_load(path: &Path) -> Result<Self, HwmError> {
        let text = fs::read_to_string(path)
            .map_err(|err| HwmError::Config(format!("{}: {err}", path.display())))?;
        let mut cfg: Self = toml::from_str(&text)
            .map_err(|err| HwmError::Config(format!("{}: {err}", path.display())))?;
        cfg.path = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// Lenient load: a missing or unparseable file is a warning, and the
    /// built-in defaults apply.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(cfg) => {
                info!(path = %path.display(), "configuration loaded");
                cfg
            }
            Err(err) => {
                warn!(%err, "using default configuration");
                Self::default()
            }
        }
    }

    /// The multicast group address: `224.0.0.<base + offset>`.
    #[must_use]
    pub fn multicast_group(&self) -> Ipv4Addr {
        Ipv4Addr::new(224, 0, 0, MCAST_BASE.wrapping_add(self.instance.group))
    }

    /// Update a node's role and rewrite the config file, atomically
    /// (write a sibling temp file, then rename over).
    pub fn persist_role(&mut self, node_index: u32, role: NodeRole) -> io::Result<()> {
        let Some(node) = self.nodes.iter_mut().find(|n| n.index == node_index) else {
            return Ok(());
        };
        node.role = role.into();

        let Some(path) = self.path.clone() else {
            // Running on defaults; nothing to persist into.
            return Ok(());
        };
        let text = toml::to_string_pretty(&Strip::of(self))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        info!(node_index, ?role, path = %path.display(), "role persisted");
        Ok(())
    }
}

/// Serialization view without the bookkeeping fields.
#[derive(Serialize)]
struct Strip<'a> {
    instance: &'a Instance,
    nodes: &'a [ConfigNode],
}

impl<'a> Strip<'a> {
    fn of(cfg: &'a Config) -> Self {
        Self { instance: &cfg.instance, nodes: &cfg.nodes }
    }
}
