//! Worker capability vocabulary.
//!
//! A worker declares a capability set at connect time; a builder declares a
//! capability requirement. Dispatch only pairs the two when the worker's set
//! is a superset of the requirement.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Windows => "windows",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X64,
    X32,
    Arm5,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::X32 => "x32",
            Arch::Arm5 => "arm5",
        }
    }
}

/// What a worker can do: its platform, architecture, and free-form tags
/// (tool versions, interpreter paths, and similar).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub platform: Platform,
    pub arch: Arch,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CapabilitySet {
    pub fn satisfies(&self, requirement: &CapabilityRequirement) -> bool {
        self.platform == requirement.platform
            && self.arch == requirement.arch
            && requirement.tags.iter().all(|tag| self.tags.contains(tag))
    }
}

/// What a builder needs from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    pub platform: Platform,
    pub arch: Arch,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(platform: Platform, arch: Arch, tags: &[&str]) -> CapabilitySet {
        CapabilitySet {
            platform,
            arch,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn req(platform: Platform, arch: Arch, tags: &[&str]) -> CapabilityRequirement {
        CapabilityRequirement {
            platform,
            arch,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_superset_satisfies() {
        let caps = set(Platform::Linux, Arch::X64, &["python3", "gcc"]);
        assert!(caps.satisfies(&req(Platform::Linux, Arch::X64, &["python3"])));
        assert!(caps.satisfies(&req(Platform::Linux, Arch::X64, &[])));
    }

    #[test]
    fn test_missing_tag_does_not_satisfy() {
        let caps = set(Platform::Linux, Arch::X64, &["python3"]);
        assert!(!caps.satisfies(&req(Platform::Linux, Arch::X64, &["python3", "valgrind"])));
    }

    #[test]
    fn test_platform_and_arch_must_match() {
        let caps = set(Platform::Linux, Arch::X64, &[]);
        assert!(!caps.satisfies(&req(Platform::Windows, Arch::X64, &[])));
        assert!(!caps.satisfies(&req(Platform::Linux, Arch::X32, &[])));
    }

    #[test]
    fn test_serde_names() {
        let arch: Arch = serde_json::from_str("\"arm5\"").unwrap();
        assert_eq!(arch, Arch::Arm5);
        assert_eq!(serde_json::to_string(&Platform::Macos).unwrap(), "\"macos\"");
    }
}
