//! Host-supplied system snapshot.
//!
//! The host fills this in per request; the planner only reads it to resolve
//! fuzzy resource names. Every field defaults so partial JSON is accepted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// One container as reported by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Runtime status text, e.g. `Up 3 hours` or `Exited (0) 2 days ago`
    pub status: String,
}

impl ContainerInfo {
    /// Name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.to_lowercase().starts_with("up")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerInventory {
    pub all: Vec<ContainerInfo>,
    pub running: Vec<ContainerInfo>,
    pub images: Vec<String>,
}

/// One systemd unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    pub name: String,
    pub description: String,
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemContext {
    pub hostname: Option<String>,
    pub containers: ContainerInventory,
    pub container_names: Vec<String>,
    pub services: Vec<ServiceInfo>,
    pub service_names: Vec<String>,
    pub package_manager: Option<String>,
    pub installed_packages: Vec<String>,
}

impl SystemContext {
    /// Every known container name, detailed entries first, deduplicated
    pub fn container_candidates(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let detailed = self.containers.all.iter().chain(self.containers.running.iter());
        for name in detailed
            .map(|c| c.display_name().to_string())
            .chain(self.container_names.iter().cloned())
        {
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Every known service name, with any `.service` suffix removed, deduplicated
    pub fn service_candidates(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self
            .services
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.service_names.iter().map(String::as_str))
        {
            let name = name.strip_suffix(".service").unwrap_or(name).to_string();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    pub fn is_package_installed(&self, package: &str) -> bool {
        self.installed_packages.iter().any(|p| p == package)
    }
}

// =============================================================================
// Package managers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Pacman,
    Zypper,
}

/// Probe order when the snapshot does not name a manager
const PROBE_ORDER: &[(PackageManager, &str)] = &[
    (PackageManager::Apt, "usr/bin/apt"),
    (PackageManager::Dnf, "usr/bin/dnf"),
    (PackageManager::Yum, "usr/bin/yum"),
    (PackageManager::Pacman, "usr/bin/pacman"),
    (PackageManager::Zypper, "usr/bin/zypper"),
];

impl PackageManager {
    pub fn from_name(name: &str) -> Option<Self> {
        let base = name
            .split_whitespace()
            .find(|t| *t != "sudo")?
            .rsplit('/')
            .next()?;
        match base.to_lowercase().as_str() {
            "apt" | "apt-get" => Some(Self::Apt),
            "dnf" => Some(Self::Dnf),
            "yum" => Some(Self::Yum),
            "pacman" => Some(Self::Pacman),
            "zypper" => Some(Self::Zypper),
            _ => None,
        }
    }

    /// Probe `<root>/usr/bin` for a known manager
    pub fn probe(root: &Path) -> Option<Self> {
        PROBE_ORDER
            .iter()
            .find(|(_, rel)| root.join(rel).exists())
            .map(|(pm, _)| *pm)
    }

    /// Snapshot first, then the filesystem under `probe_root`
    pub fn detect(context: &SystemContext, probe_root: Option<&Path>) -> Option<Self> {
        context
            .package_manager
            .as_deref()
            .and_then(Self::from_name)
            .or_else(|| probe_root.and_then(Self::probe))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Pacman => "pacman",
            Self::Zypper => "zypper",
        }
    }

    /// Non-interactive install prefix; package names are appended
    pub fn install_command(&self) -> &'static str {
        match self {
            Self::Apt => "sudo apt-get install -y",
            Self::Dnf => "sudo dnf install -y",
            Self::Yum => "sudo yum install -y",
            Self::Pacman => "sudo pacman -S --noconfirm",
            Self::Zypper => "sudo zypper --non-interactive install",
        }
    }

    /// Non-interactive removal prefix; package names are appended
    pub fn remove_command(&self) -> &'static str {
        match self {
            Self::Apt => "sudo apt-get remove -y",
            Self::Dnf => "sudo dnf remove -y",
            Self::Yum => "sudo yum remove -y",
            Self::Pacman => "sudo pacman -R --noconfirm",
            Self::Zypper => "sudo zypper --non-interactive remove",
        }
    }

    /// Read-only check that succeeds when the package is installed
    pub fn query_command(&self) -> &'static str {
        match self {
            Self::Apt => "dpkg -s",
            Self::Dnf | Self::Yum | Self::Zypper => "rpm -q",
            Self::Pacman => "pacman -Q",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
