//! Gateway configuration: an optional TOML file overlaid by command-line
//! flags, validated into [`Settings`] before anything is started.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::protocol::limits::{MAX_CONNS, MAX_WORKERS, MIN_WORKERS};
use crate::protocol::{MAX_BACK_END, MAX_RING_DATA_LEN};
use crate::timer::{DEFAULT_CAPACITY, MAX_TICK_MS, MIN_TICK_MS};

/// `ip:port:0xID` as used for the local node and the ASM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub id: u32,
}

impl NodeAddr {
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hostport, id) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("invalid format {:?}: expected ip:port:id", s))?;
        let addr = parse_host_port(hostport)?;
        let id = id.trim();
        let digits = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .unwrap_or(id);
        let id = u32::from_str_radix(digits, 16)
            .with_context(|| format!("invalid node id {:?} (hex expected)", id))?;
        Ok(Self {
            ip: *addr.ip(),
            port: addr.port(),
            id,
        })
    }
}

/// `ip:port` with a port in 1..=65535
pub fn parse_host_port(s: &str) -> Result<SocketAddrV4> {
    let (ip, port) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid format {:?}: expected ip:port", s))?;
    let ip = crate::net::parse_ipv4(ip)?;
    let port: u16 = port
        .trim()
        .parse()
        .with_context(|| format!("invalid port {:?}", port))?;
    if port == 0 {
        bail!("invalid port 0 in {:?}", s);
    }
    Ok(SocketAddrV4::new(ip, port))
}

/// Comma-separated list of absolute backend roots
pub fn parse_backends(s: &str) -> Result<Vec<PathBuf>> {
    let roots: Vec<PathBuf> = s
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect();
    check_backends(&roots)?;
    Ok(roots)
}

fn check_backends(roots: &[PathBuf]) -> Result<()> {
    if roots.is_empty() {
        bail!("at least one backend directory is required");
    }
    if roots.len() > MAX_BACK_END {
        bail!("too many backend directories: {} (max {})", roots.len(), MAX_BACK_END);
    }
    if let Some(bad) = roots.iter().find(|p| !p.is_absolute()) {
        bail!("backend directory {} is not absolute", bad.display());
    }
    Ok(())
}

/// Paths used to run the external transfer tool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub python: PathBuf,
    pub script: PathBuf,
    pub config_path: PathBuf,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            python: PathBuf::from("/usr/bin/python3"),
            script: PathBuf::from("/opt/storage_gateway/src/client2/main.py"),
            config_path: PathBuf::from("/opt/storage_gateway/src/client2/config.ini"),
        }
    }
}

/// Raw configuration as read from a file and the command line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub region_id: u32,
    pub system_id: u32,
    pub group_id: u32,
    /// `ip:port:0xID` to listen on
    pub local: Option<String>,
    /// `ip:port` advertised to clients
    pub connect: Option<String>,
    /// `ip:port:0xID` of the ASM
    pub asm: Option<String>,
    pub backends: Vec<PathBuf>,
    pub workers: usize, // 0 = auto
    pub daemonize: bool,
    pub log_file: Option<PathBuf>,
    pub tick_ms: u64,
    pub heartbeat_ms: u64,
    pub max_conns: usize,
    pub max_timers: usize,
    pub ring_size: usize,
    pub migration: MigrationSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            region_id: 0,
            system_id: 0,
            group_id: 0,
            local: None,
            connect: None,
            asm: None,
            backends: Vec::new(),
            workers: 0,
            daemonize: false,
            log_file: None,
            tick_ms: 1000,
            heartbeat_ms: 1000,
            max_conns: MAX_CONNS,
            max_timers: DEFAULT_CAPACITY,
            ring_size: MAX_RING_DATA_LEN,
            migration: MigrationSettings::default(),
        }
    }
}

/// Validated settings the daemon runs with
#[derive(Clone, Debug)]
pub struct Settings {
    pub region_id: u32,
    pub system_id: u32,
    pub group_id: u32,
    pub local: NodeAddr,
    pub connect: SocketAddrV4,
    pub asm: NodeAddr,
    pub backends: Vec<PathBuf>,
    pub workers: usize,
    pub daemonize: bool,
    pub log_file: Option<PathBuf>,
    pub tick_ms: u64,
    pub heartbeat_ms: u64,
    pub max_conns: usize,
    pub max_timers: usize,
    pub ring_size: usize,
    pub migration: MigrationSettings,
}

impl Settings {
    /// True when `ip` is this node's listen or advertised address
    pub fn is_listening_ip(&self, ip: Ipv4Addr) -> bool {
        ip == *self.connect.ip() || ip == self.local.ip
    }
}

/// Worker count: 0 means one per CPU, the result is clamped to [4, 255]
pub fn effective_workers(requested: usize) -> usize {
    let n = if requested == 0 {
        num_cpus::get()
    } else {
        requested
    };
    n.clamp(MIN_WORKERS, MAX_WORKERS)
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: GatewayConfig =
            toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<Settings> {
        if self.region_id == 0 || self.system_id == 0 || self.group_id == 0 {
            bail!("region, system and group ids must all be non-zero");
        }
        let local: NodeAddr = self
            .local
            .as_deref()
            .context("local listen address (-l ip:port:id) is required")?
            .parse()
            .context("local address")?;
        if local.id == 0 {
            bail!("local node id must be non-zero");
        }
        let connect = parse_host_port(
            self.connect
                .as_deref()
                .context("connect address (-c ip:port) is required")?,
        )
        .context("connect address")?;
        let asm: NodeAddr = self
            .asm
            .as_deref()
            .context("ASM address (-a ip:port:id) is required")?
            .parse()
            .context("ASM address")?;
        if asm.id == 0 || asm.ip.is_unspecified() {
            bail!("ASM address and id must be non-zero");
        }
        check_backends(&self.backends)?;
        if !(MIN_TICK_MS..=MAX_TICK_MS).contains(&self.tick_ms) {
            bail!("tick_ms {} outside [{}, {}]", self.tick_ms, MIN_TICK_MS, MAX_TICK_MS);
        }
        if self.heartbeat_ms < self.tick_ms {
            bail!("heartbeat_ms {} is shorter than one tick", self.heartbeat_ms);
        }
        if self.max_conns == 0 || self.max_timers == 0 {
            bail!("max_conns and max_timers must be positive");
        }
        Ok(Settings {
            region_id: self.region_id,
            system_id: self.system_id,
            group_id: self.group_id,
            local,
            connect,
            asm,
            backends: self.backends.clone(),
            workers: effective_workers(self.workers),
            daemonize: self.daemonize,
            log_file: self.log_file.clone(),
            tick_ms: self.tick_ms,
            heartbeat_ms: self.heartbeat_ms,
            max_conns: self.max_conns,
            max_timers: self.max_timers,
            ring_size: self.ring_size,
            migration: self.migration.clone(),
        })
    }
}
