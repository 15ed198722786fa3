//! Gateway-wide migration state and the launcher for the external transfer
//! tool.
//!
//! The state only ever moves forward: normal -> migrating -> migrated. Each
//! step is a single compare-and-swap so concurrent workers cannot both start
//! a migration.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::{error, info};

use crate::config::MigrationSettings;
use crate::protocol::{ack, command};
use crate::protocol_core::MigrationOptions;

/// Upper bound on transfer processes started over the process lifetime
pub const MAX_LAUNCHES: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationState {
    Normal = 0,
    Migrating = 1,
    Migrated = 2,
}

impl MigrationState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Normal,
            1 => Self::Migrating,
            _ => Self::Migrated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Migrating => "migrating",
            Self::Migrated => "migrated",
        }
    }
}

#[derive(Debug)]
pub struct MigrationGate {
    state: AtomicU8,
}

impl Default for MigrationGate {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(MigrationState::Normal as u8),
        }
    }
}

impl MigrationGate {
    pub fn state(&self) -> MigrationState {
        MigrationState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: MigrationState, to: MigrationState) -> Result<(), MigrationState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(MigrationState::from_u8)
    }

    /// normal -> migrating; on failure returns the state that blocked it
    pub fn begin(&self) -> Result<(), MigrationState> {
        self.transition(MigrationState::Normal, MigrationState::Migrating)
    }

    /// migrating -> migrated
    pub fn complete(&self) -> Result<(), MigrationState> {
        self.transition(MigrationState::Migrating, MigrationState::Migrated)
    }

    /// Whether `cmd` may be processed in the current state
    pub fn allows(&self, cmd: u32) -> bool {
        match self.state() {
            MigrationState::Normal => true,
            // MIGRATION_START always reaches its handler, which refuses it
            MigrationState::Migrating | MigrationState::Migrated => matches!(
                cmd,
                command::MIGRATION_START_REQ
                    | command::START_DOWNLOAD_REQ
                    | command::START_DOWNLOAD_RSP
                    | command::DOWNLOAD_DATA_REQ
                    | command::DOWNLOAD_DATA_RSP
                    | command::DOWNLOAD_FINISH_REQ
                    | command::DOWNLOAD_FINISH_RSP
                    | command::MIGRATION_STOP_REQ
                    | command::MIGRATION_FINISHED_REQ
            ),
        }
    }
}

/// Everything the transfer tool needs to know
#[derive(Clone, Debug)]
pub struct MigrationConfig {
    pub options: MigrationOptions,
    pub backend_dir: PathBuf,
}

impl MigrationConfig {
    /// INI rendering consumed by the transfer tool
    pub fn to_ini(&self) -> String {
        let o = &self.options;
        let mut s = String::from("[client]\n");
        let _ = writeln!(s, "old_sgw_ipv4={}", o.old_sgw.ip);
        let _ = writeln!(s, "old_sgw_port={}", o.old_sgw.port);
        let _ = writeln!(s, "new_sgw_ipv4={}", o.new_sgw.ip);
        let _ = writeln!(s, "new_sgw_port={}", o.new_sgw.port);
        let _ = writeln!(s, "old_mds_ipv4={}", o.old_mds.ip);
        let _ = writeln!(s, "old_mds_port={}", o.old_mds.port);
        let _ = writeln!(s, "new_mds_ipv4={}", o.new_mds.ip);
        let _ = writeln!(s, "new_mds_port={}", o.new_mds.port);
        let _ = writeln!(s, "backend_directory={}", self.backend_dir.display());
        s
    }
}

#[derive(Debug)]
pub struct MigrationHandle {
    pub pid: Option<u32>,
    pub config_path: PathBuf,
}

/// Starts the transfer and reacts to its completion report
pub trait MigrationLauncher: Send + Sync {
    fn launch(&self, config: &MigrationConfig) -> Result<MigrationHandle>;
    fn on_completion(&self, ack_code: u32);
}

/// Writes the INI file and runs `<python> <script> <config>`
pub struct ScriptLauncher {
    settings: MigrationSettings,
    grace: Duration,
    children: Mutex<Vec<Child>>,
}

impl ScriptLauncher {
    pub fn new(settings: MigrationSettings) -> Self {
        Self {
            settings,
            grace: Duration::from_secs(1),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn launched(&self) -> usize {
        self.children.lock().len()
    }
}

impl MigrationLauncher for ScriptLauncher {
    fn launch(&self, config: &MigrationConfig) -> Result<MigrationHandle> {
        let mut children = self.children.lock();
        if children.len() >= MAX_LAUNCHES {
            bail!("refusing to start transfer: {} already launched", children.len());
        }
        let cfg_path = &self.settings.config_path;
        if let Some(parent) = cfg_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(cfg_path, config.to_ini())
            .with_context(|| format!("write {}", cfg_path.display()))?;
        let child = Command::new(&self.settings.python)
            .arg(&self.settings.script)
            .arg(cfg_path)
            .spawn()
            .with_context(|| format!("spawn {}", self.settings.python.display()))?;
        let pid = child.id();
        info!(pid, config = %cfg_path.display(), "transfer process started");
        children.push(child);
        Ok(MigrationHandle {
            pid: Some(pid),
            config_path: cfg_path.clone(),
        })
    }

    fn on_completion(&self, ack_code: u32) {
        if ack_code != ack::OK {
            error!(ack_code, "migration reported failure");
            return;
        }
        info!("migration finished, stepping down");
        std::thread::sleep(self.grace);
        // Transfer children are reparented to init once we are gone
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_core::Endpoint;
    use tempfile::TempDir;

    fn sample_config() -> MigrationConfig {
        MigrationConfig {
            options: MigrationOptions {
                old_sgw: Endpoint { ip: "10.0.0.1".into(), port: 7788 },
                new_sgw: Endpoint { ip: "10.0.0.2".into(), port: 7789 },
                old_mds: Endpoint { ip: "10.0.0.3".into(), port: 8000 },
                new_mds: Endpoint { ip: "10.0.0.4".into(), port: 8001 },
            },
            backend_dir: PathBuf::from("/sgw.1"),
        }
    }

    #[test]
    fn state_only_moves_forward() {
        let gate = MigrationGate::default();
        assert_eq!(gate.state(), MigrationState::Normal);
        assert_eq!(gate.complete(), Err(MigrationState::Normal));
        gate.begin().unwrap();
        assert_eq!(gate.begin(), Err(MigrationState::Migrating));
        gate.complete().unwrap();
        assert_eq!(gate.state(), MigrationState::Migrated);
        assert_eq!(gate.begin(), Err(MigrationState::Migrated));
    }

    #[test]
    fn gate_restricts_commands_while_migrating() {
        let gate = MigrationGate::default();
        assert!(gate.allows(command::START_UPLOAD_REQ));
        assert!(gate.allows(command::DELETE_REQ));
        gate.begin().unwrap();
        assert!(!gate.allows(command::START_UPLOAD_REQ));
        assert!(!gate.allows(command::DELETE_REQ));
        assert!(gate.allows(command::MIGRATION_START_REQ));
        assert!(!gate.allows(command::SEQ_DOWNLOAD_REQ));
        assert!(gate.allows(command::START_DOWNLOAD_REQ));
        assert!(gate.allows(command::DOWNLOAD_DATA_REQ));
        assert!(gate.allows(command::MIGRATION_FINISHED_REQ));
        assert!(gate.allows(command::START_DOWNLOAD_RSP));
        assert!(gate.allows(command::DOWNLOAD_DATA_RSP));
        assert!(!gate.allows(command::UPLOAD_DATA_RSP));
        gate.complete().unwrap();
        assert!(gate.allows(command::DOWNLOAD_FINISH_REQ));
        assert!(gate.allows(command::DOWNLOAD_FINISH_RSP));
        assert!(!gate.allows(command::GET_FILE_LIST_REQ));
    }

    #[test]
    fn ini_lists_every_endpoint() {
        let ini = sample_config().to_ini();
        assert!(ini.starts_with("[client]\n"));
        assert!(ini.contains("old_sgw_ipv4=10.0.0.1\n"));
        assert!(ini.contains("new_mds_port=8001\n"));
        assert!(ini.ends_with("backend_directory=/sgw.1\n"));
    }

    #[test]
    fn script_launcher_writes_config_and_caps_launches() {
        let temp_dir = TempDir::new().unwrap();
        let cfg_path = temp_dir.path().join("client/config.ini");
        let launcher = ScriptLauncher::new(MigrationSettings {
            python: PathBuf::from("true"),
            script: PathBuf::from("main.py"),
            config_path: cfg_path.clone(),
        });
        for _ in 0..MAX_LAUNCHES {
            let handle = launcher.launch(&sample_config()).unwrap();
            assert!(handle.pid.is_some());
        }
        assert!(launcher.launch(&sample_config()).is_err());
        assert_eq!(launcher.launched(), MAX_LAUNCHES);
        let written = std::fs::read_to_string(&cfg_path).unwrap();
        assert_eq!(written, sample_config().to_ini());
        // Failure reports never stop the process
        launcher.on_completion(ack::FAILED);
    }
}
