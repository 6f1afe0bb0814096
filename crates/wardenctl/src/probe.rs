//! Host probe
//!
//! Builds a `SystemContext` from the live machine: hostname, docker
//! containers, systemd services and the package manager. Every source is
//! optional; a host without docker simply reports no containers.

use std::path::Path;
use std::time::Duration;

use tracing::debug;
use warden_core::{
    CommandRunner, ContainerInfo, ContainerInventory, PackageManager, ServiceInfo, SystemContext,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DOCKER_PS: &str =
    "docker ps -a --no-trunc --format '{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}'";
pub const DOCKER_IMAGES: &str = "docker images --format '{{.Repository}}:{{.Tag}}'";
pub const SYSTEMCTL_UNITS: &str =
    "systemctl list-units --type=service --all --no-pager --plain --no-legend";

/// Collect everything the planner can use to resolve names
pub fn probe_host(runner: &dyn CommandRunner, root: &Path) -> SystemContext {
    let mut context = SystemContext {
        hostname: hostname(runner),
        package_manager: PackageManager::probe(root).map(|pm| pm.as_str().to_string()),
        ..SystemContext::default()
    };

    let ps = runner.run(DOCKER_PS, PROBE_TIMEOUT);
    if ps.success() {
        let all = parse_docker_ps(&ps.stdout);
        context.container_names = all.iter().map(|c| c.display_name().to_string()).collect();
        context.containers = ContainerInventory {
            running: all.iter().filter(|c| c.is_running()).cloned().collect(),
            all,
            images: Vec::new(),
        };
        let images = runner.run(DOCKER_IMAGES, PROBE_TIMEOUT);
        if images.success() {
            context.containers.images = images
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.contains("<none>"))
                .map(str::to_string)
                .collect();
        }
    } else {
        debug!("No container runtime: {}", ps.error_message());
    }

    let units = runner.run(SYSTEMCTL_UNITS, PROBE_TIMEOUT);
    if units.success() {
        context.services = parse_service_units(&units.stdout);
        context.service_names = context.services.iter().map(|s| s.name.clone()).collect();
    } else {
        debug!("No systemd: {}", units.error_message());
    }

    debug!(
        "Probed host: {} containers, {} services, package manager {:?}",
        context.container_names.len(),
        context.service_names.len(),
        context.package_manager
    );
    context
}

fn hostname(runner: &dyn CommandRunner) -> Option<String> {
    let out = runner.run("hostname", PROBE_TIMEOUT);
    let name = out.stdout.trim();
    (out.success() && !name.is_empty()).then(|| name.to_string())
}

/// Parse tab-separated `docker ps` rows (id, names, image, status)
pub fn parse_docker_ps(stdout: &str) -> Vec<ContainerInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim_end().split('\t');
            let id = fields.next()?.trim();
            if id.is_empty() {
                return None;
            }
            Some(ContainerInfo {
                id: id.to_string(),
                name: fields.next().unwrap_or_default().trim().to_string(),
                image: fields.next().unwrap_or_default().trim().to_string(),
                status: fields.next().unwrap_or_default().trim().to_string(),
            })
        })
        .collect()
}

/// Parse `systemctl list-units --plain --no-legend` rows
///
/// Columns are UNIT LOAD ACTIVE SUB DESCRIPTION; the description may contain spaces.
pub fn parse_service_units(stdout: &str) -> Vec<ServiceInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let unit = parts.next()?;
            if !unit.ends_with(".service") {
                return None;
            }
            let _load = parts.next()?;
            let active = parts.next()?;
            let _sub = parts.next();
            let description = parts.collect::<Vec<_>>().join(" ");
            Some(ServiceInfo {
                name: unit.to_string(),
                description,
                active: active == "active",
            })
        })
        .collect()
}
