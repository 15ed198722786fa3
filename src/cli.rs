//! Command-line surface of `sgwd`

use anyhow::Result;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{parse_backends, GatewayConfig};

/// Storage gateway daemon
#[derive(Clone, Debug, Default, Parser)]
#[command(name = "sgwd", version, about = "Storage gateway daemon")]
pub struct GatewayOpts {
    /// Region id
    #[arg(short = 'r', long = "region")]
    pub region_id: Option<u32>,

    /// System id
    #[arg(short = 's', long = "system")]
    pub system_id: Option<u32>,

    /// Group id
    #[arg(short = 'g', long = "group")]
    pub group_id: Option<u32>,

    /// Listen address and node id (ip:port:0xID)
    #[arg(short = 'l', long = "local")]
    pub local: Option<String>,

    /// Address advertised to clients (ip:port)
    #[arg(short = 'c', long = "connect")]
    pub connect: Option<String>,

    /// ASM address and id (ip:port:0xID)
    #[arg(short = 'a', long = "asm")]
    pub asm: Option<String>,

    /// Comma-separated absolute backend directories (at most 5)
    #[arg(short = 'b', long = "backends")]
    pub backends: Option<String>,

    /// Worker threads (0 = one per CPU; clamped to 4..=255)
    #[arg(short = 'w', long = "workers")]
    pub workers: Option<usize>,

    /// Detach and run in the background
    #[arg(short = 'd', long = "daemon", action = ArgAction::SetTrue)]
    pub daemonize: bool,

    /// Log file (stderr when omitted)
    #[arg(short = 'p', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Optional TOML config; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl GatewayOpts {
    /// Merge flags over the config file (if any)
    pub fn into_config(self) -> Result<GatewayConfig> {
        let mut cfg = match &self.config {
            Some(path) => GatewayConfig::load(path)?,
            None => GatewayConfig::default(),
        };
        if let Some(v) = self.region_id {
            cfg.region_id = v;
        }
        if let Some(v) = self.system_id {
            cfg.system_id = v;
        }
        if let Some(v) = self.group_id {
            cfg.group_id = v;
        }
        if self.local.is_some() {
            cfg.local = self.local;
        }
        if self.connect.is_some() {
            cfg.connect = self.connect;
        }
        if self.asm.is_some() {
            cfg.asm = self.asm;
        }
        if let Some(list) = self.backends.as_deref() {
            cfg.backends = parse_backends(list)?;
        }
        if let Some(w) = self.workers {
            cfg.workers = w;
        }
        cfg.daemonize |= self.daemonize;
        if self.log_file.is_some() {
            cfg.log_file = self.log_file;
        }
        Ok(cfg)
    }
}
