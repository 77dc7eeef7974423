//! Worker configuration.

use kiln_core::capability::{Arch, CapabilitySet, Platform};
use kiln_core::worker::WorkerRegistration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name (must be unique per master).
    #[serde(default = "default_name")]
    pub name: String,
    /// WebSocket URL of the master's worker endpoint.
    #[serde(default = "default_master_url")]
    pub master_url: String,
    /// Shared secret presented in the hello frame.
    pub credential: String,
    /// Extra capability tags beyond the detected platform and arch.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Directory build workspaces live under.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "kiln-worker".to_string())
}

fn default_master_url() -> String {
    "ws://127.0.0.1:8010/ws/worker".to_string()
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/var/kiln/workspace")
}

fn default_heartbeat_interval() -> u64 {
    15
}

impl WorkerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Detect the platform this worker runs on.
    pub fn detect_platform() -> Platform {
        #[cfg(target_os = "linux")]
        return Platform::Linux;
        #[cfg(target_os = "macos")]
        return Platform::Macos;
        #[cfg(target_os = "windows")]
        return Platform::Windows;
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return Platform::Linux;
    }

    /// Detect the architecture this worker runs on.
    pub fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::X64;
        #[cfg(target_arch = "x86")]
        return Arch::X32;
        #[cfg(target_arch = "arm")]
        return Arch::Arm5;
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "arm")))]
        return Arch::X64;
    }

    /// The full capability set to advertise: detected platform and arch plus
    /// the configured tags.
    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            platform: Self::detect_platform(),
            arch: Self::detect_arch(),
            tags: self.tags.clone(),
        }
    }

    /// The registration payload for the hello frame.
    pub fn registration(&self) -> WorkerRegistration {
        WorkerRegistration {
            name: self.name.clone(),
            credential: self.credential.clone(),
            capabilities: self.capabilities(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}
