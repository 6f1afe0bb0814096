//! Heuristic intent parsing for requests no template covers.
//!
//! Extracts `(action, resource type, filter)` with regexes, then resolves the
//! filter against the snapshot. Anything that cannot be pinned down becomes a
//! clarification question instead of a guess.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::context::{PackageManager, SystemContext};
use crate::plan::{Probe, StepAction, TaskStep};
use crate::resolve::{match_all, singular};
use crate::shell::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentAction {
    Start,
    Stop,
    Restart,
    Remove,
    StopAndRemove,
    Install,
    Uninstall,
}

impl IntentAction {
    fn from_verb(verb: &str) -> Option<Self> {
        let verb = verb.split_whitespace().collect::<Vec<_>>().join(" ");
        match verb.as_str() {
            "start" | "launch" => Some(Self::Start),
            "stop" | "kill" | "halt" => Some(Self::Stop),
            "restart" | "reload" | "bounce" => Some(Self::Restart),
            "remove" | "delete" | "destroy" => Some(Self::Remove),
            "stop and remove" | "stop and delete" => Some(Self::StopAndRemove),
            "install" | "add" => Some(Self::Install),
            "uninstall" | "purge" => Some(Self::Uninstall),
            _ => None,
        }
    }

    fn is_package_only(&self) -> bool {
        matches!(self, Self::Install | Self::Uninstall)
    }
}

impl fmt::Display for IntentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Remove => "remove",
            Self::StopAndRemove => "stop and remove",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Container,
    Service,
    Package,
}

impl ResourceType {
    fn from_word(word: &str) -> Option<Self> {
        match singular(word) {
            "container" => Some(Self::Container),
            "service" | "unit" | "daemon" => Some(Self::Service),
            "package" | "program" | "app" => Some(Self::Package),
            _ => None,
        }
    }

    fn plural(&self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::Service => "services",
            Self::Package => "packages",
        }
    }
}

/// What the request asks for, before matching against the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIntent {
    pub action: IntentAction,
    /// None when the request named no resource type
    pub resource: Option<ResourceType>,
    pub filters: Vec<String>,
    /// "all"/"every" with no filter selects everything of the type
    pub select_all: bool,
}

/// Steps, or a question to ask instead
#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    Steps(Vec<TaskStep>),
    Clarify(String),
}

// =============================================================================
// Parsing
// =============================================================================

static ACTION_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:please\s+)?(?:(?:can|could|would)\s+you\s+)?(?:please\s+)?(?P<verb>stop\s+and\s+(?:remove|delete)|start|launch|stop|kill|halt|restart|reload|bounce|remove|delete|destroy|uninstall|purge|install|add)\s+(?P<rest>.+)$",
    )
    .ok()
});

static BODY_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?P<before>.+?)\s+)?(?P<res>containers?|services?|units?|daemons?|packages?|programs?|apps?)(?:\s+(?:named|called|matching|containing|like|with\s+names?(?:\s+like)?)\s+(?P<after>.+))?$",
    )
    .ok()
});

/// Words that never narrow the selection
const NOISE: &[&str] = &[
    "the", "my", "a", "an", "of", "docker", "podman", "systemd", "running", "stopped", "old",
    "those", "these", "them", "it", "please", "now",
];

const QUANTIFIERS: &[&str] = &["all", "every", "each", "any"];

pub fn parse_intent(request: &str) -> Option<ParsedIntent> {
    let text = request
        .trim()
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?'))
        .trim();
    let action_re = ACTION_RE.as_ref()?;
    let caps = action_re.captures(text)?;
    let action = IntentAction::from_verb(&caps["verb"].to_lowercase())?;
    let rest = caps["rest"].trim().to_lowercase();

    let (resource, phrase) = match BODY_RE.as_ref().and_then(|re| re.captures(&rest)) {
        Some(body) => {
            let resource = ResourceType::from_word(&body["res"]);
            let mut phrase = String::new();
            for part in ["before", "after"] {
                if let Some(m) = body.name(part) {
                    phrase.push(' ');
                    phrase.push_str(m.as_str());
                }
            }
            (resource, phrase)
        }
        None => (None, rest.clone()),
    };

    let mut select_all = false;
    let mut filters = Vec::new();
    for term in split_terms(&phrase) {
        if QUANTIFIERS.contains(&term.as_str()) {
            select_all = true;
        } else if !NOISE.contains(&term.as_str()) {
            filters.push(term);
        }
    }

    let resource = if action.is_package_only() {
        Some(ResourceType::Package)
    } else {
        resource
    };

    let intent = ParsedIntent {
        action,
        resource,
        filters,
        select_all,
    };
    debug!("Parsed intent {:?}", intent);
    Some(intent)
}

/// Split a phrase into terms on commas, "and", and whitespace
fn split_terms(phrase: &str) -> Vec<String> {
    phrase
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(|t| t.trim_matches(|c: char| c == '"' || c == '\''))
        .filter(|t| !t.is_empty() && *t != "and" && *t != "or")
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Planning
// =============================================================================

/// Turn an intent into concrete steps against the snapshot
pub fn plan_intent(
    intent: &ParsedIntent,
    context: &SystemContext,
    package_manager: Option<PackageManager>,
) -> IntentOutcome {
    let resource = match intent.resource {
        Some(resource) => resource,
        None => match infer_resource(intent, context) {
            Some(resource) => resource,
            None => {
                return IntentOutcome::Clarify(format!(
                    "I couldn't tell what '{}' refers to. Is it a container, a service, or a package?",
                    intent.filters.join(" ")
                ))
            }
        },
    };

    match resource {
        ResourceType::Package => plan_packages(intent, package_manager),
        ResourceType::Container | ResourceType::Service => {
            let candidates = candidates_for(resource, context);
            let targets = select_targets(intent, &candidates);
            if targets.is_empty() {
                return IntentOutcome::Clarify(no_match_question(intent, resource, &candidates));
            }
            info!(
                "Intent {} on {} {:?}",
                intent.action,
                resource.plural(),
                targets
            );
            match resource {
                ResourceType::Container => plan_containers(intent.action, &targets),
                _ => plan_services(intent.action, &targets),
            }
        }
    }
}

fn candidates_for(resource: ResourceType, context: &SystemContext) -> Vec<String> {
    match resource {
        ResourceType::Container => context.container_candidates(),
        ResourceType::Service => context.service_candidates(),
        ResourceType::Package => context.installed_packages.clone(),
    }
}

/// Pick the resource type from which snapshot list the filter matches
fn infer_resource(intent: &ParsedIntent, context: &SystemContext) -> Option<ResourceType> {
    if intent.filters.is_empty() {
        return None;
    }
    let hits = |resource| !select_targets(intent, &candidates_for(resource, context)).is_empty();
    let containers = hits(ResourceType::Container);
    let services = hits(ResourceType::Service);
    match (containers, services) {
        (true, false) => Some(ResourceType::Container),
        (false, true) => Some(ResourceType::Service),
        (true, true) => {
            debug!("Filter matches both containers and services, asking");
            None
        }
        (false, false) => {
            let installed = intent
                .filters
                .iter()
                .all(|f| context.is_package_installed(f));
            (installed && intent.action == IntentAction::Remove).then_some(ResourceType::Package)
        }
    }
}

fn select_targets(intent: &ParsedIntent, candidates: &[String]) -> Vec<String> {
    if intent.filters.is_empty() {
        return if intent.select_all {
            candidates.to_vec()
        } else {
            Vec::new()
        };
    }
    let mut targets: Vec<String> = Vec::new();
    for filter in &intent.filters {
        for name in match_all(filter, candidates) {
            if !targets.contains(&name) {
                targets.push(name);
            }
        }
    }
    targets
}

fn no_match_question(intent: &ParsedIntent, resource: ResourceType, candidates: &[String]) -> String {
    let what = if intent.filters.is_empty() {
        format!("Which {} should I {}?", resource.plural(), intent.action)
    } else {
        format!(
            "I couldn't find any {} matching '{}'. Which ones should I {}?",
            resource.plural(),
            intent.filters.join(" "),
            intent.action
        )
    };
    if candidates.is_empty() {
        what
    } else {
        format!("{} Known {}: {}", what, resource.plural(), candidates.join(", "))
    }
}

fn plan_containers(action: IntentAction, targets: &[String]) -> IntentOutcome {
    let mut steps = Vec::new();
    for name in targets {
        let q = shell_quote(name);
        match action {
            IntentAction::Stop => steps.push(stop_container(name, &q)),
            IntentAction::Start => steps.push(
                TaskStep::new(
                    format!("start_{}", name),
                    format!("Start {}", name),
                    StepAction::command(format!("docker start {}", q)),
                )
                .with_description(format!("Start the {} container", name))
                .with_explanation(format!("Starts the stopped container {}", name))
                .with_rollback(format!("docker stop {}", q)),
            ),
            IntentAction::Remove | IntentAction::StopAndRemove => {
                let stop = stop_container(name, &q);
                let remove = TaskStep::new(
                    format!("remove_{}", name),
                    format!("Remove {}", name),
                    StepAction::command(format!("docker rm {}", q)),
                )
                .with_description(format!("Remove the {} container", name))
                .with_explanation(format!(
                    "Deletes the container {}. Its image and named volumes are kept",
                    name
                ))
                .depends_on([stop.id.clone()]);
                steps.push(stop);
                steps.push(remove);
            }
            IntentAction::Restart => {
                let restart = TaskStep::new(
                    format!("restart_{}", name),
                    format!("Restart {}", name),
                    StepAction::command(format!("docker restart {}", q)),
                )
                .with_description(format!("Restart the {} container", name))
                .with_explanation(format!("Stops and starts the container {}", name));
                let verify = verification(
                    name,
                    &restart.id,
                    format!("docker inspect -f '{{{{.State.Running}}}}' {}", q),
                    "true",
                );
                steps.push(restart);
                steps.push(verify);
            }
            IntentAction::Install | IntentAction::Uninstall => {
                return IntentOutcome::Clarify(
                    "Containers are created from images, not installed. Which image should I run?"
                        .to_string(),
                )
            }
        }
    }
    IntentOutcome::Steps(steps)
}

fn stop_container(name: &str, quoted: &str) -> TaskStep {
    TaskStep::new(
        format!("stop_{}", name),
        format!("Stop {}", name),
        StepAction::command(format!("docker stop {}", quoted)),
    )
    .with_description(format!("Stop the {} container", name))
    .with_explanation(format!("Stops the running container {}", name))
    .with_rollback(format!("docker start {}", quoted))
}

fn plan_services(action: IntentAction, targets: &[String]) -> IntentOutcome {
    let mut steps = Vec::new();
    for name in targets {
        let q = shell_quote(name);
        match action {
            IntentAction::Stop => steps.push(
                TaskStep::new(
                    format!("stop_{}", name),
                    format!("Stop {}", name),
                    StepAction::command(format!("sudo systemctl stop {}", q)),
                )
                .with_description(format!("Stop the {} service", name))
                .with_explanation(format!("Stops {} until it is started again", name))
                .with_rollback(format!("sudo systemctl start {}", q)),
            ),
            IntentAction::Start => steps.push(
                TaskStep::new(
                    format!("start_{}", name),
                    format!("Start {}", name),
                    StepAction::command(format!("sudo systemctl start {}", q)),
                )
                .with_description(format!("Start the {} service", name))
                .with_explanation(format!("Starts {}", name))
                .with_rollback(format!("sudo systemctl stop {}", q)),
            ),
            IntentAction::Restart => {
                let restart = TaskStep::new(
                    format!("restart_{}", name),
                    format!("Restart {}", name),
                    StepAction::command(format!("sudo systemctl restart {}", q)),
                )
                .with_description(format!("Restart the {} service", name))
                .with_explanation(format!("Restarts {} to pick up changes", name))
                .with_rollback(format!("sudo systemctl start {}", q));
                let verify = verification(
                    name,
                    &restart.id,
                    format!("systemctl show -p ActiveState {}", q),
                    "ActiveState=active",
                );
                steps.push(restart);
                steps.push(verify);
            }
            IntentAction::Remove
            | IntentAction::StopAndRemove
            | IntentAction::Install
            | IntentAction::Uninstall => {
                return IntentOutcome::Clarify(format!(
                    "Services are removed by uninstalling the package that provides them. Which package provides {}?",
                    name
                ))
            }
        }
    }
    IntentOutcome::Steps(steps)
}

fn verification(name: &str, after: &str, command: String, expected: &str) -> TaskStep {
    TaskStep::new(
        format!("verify_{}", name),
        format!("Verify {} is running", name),
        StepAction::Verification {
            check: Probe::command(command),
            expected: Some(expected.to_string()),
        },
    )
    .with_description(format!("Confirm {} came back up", name))
    .with_explanation(format!("Checks that {} is running again", name))
    .depends_on([after.to_string()])
}

fn plan_packages(intent: &ParsedIntent, package_manager: Option<PackageManager>) -> IntentOutcome {
    let Some(pm) = package_manager else {
        return IntentOutcome::Clarify(
            "I couldn't detect a package manager on this system. Which one should I use (apt, dnf, yum, pacman, zypper)?"
                .to_string(),
        );
    };
    if intent.filters.is_empty() {
        return IntentOutcome::Clarify(format!("Which packages should I {}?", intent.action));
    }

    let names = intent.filters.join(", ");
    let quoted = intent
        .filters
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");

    let step = match intent.action {
        IntentAction::Install => TaskStep::new(
            "install_packages",
            format!("Install {}", names),
            StepAction::command(format!("{} {}", pm.install_command(), quoted)),
        )
        .with_description(format!("Install {} with {}", names, pm))
        .with_explanation(format!("Installs {} from the {} repositories", names, pm))
        .with_rollback(format!("{} {}", pm.remove_command(), quoted)),
        IntentAction::Remove | IntentAction::Uninstall | IntentAction::StopAndRemove => {
            TaskStep::new(
                "remove_packages",
                format!("Remove {}", names),
                StepAction::command(format!("{} {}", pm.remove_command(), quoted)),
            )
            .with_description(format!("Remove {} with {}", names, pm))
            .with_explanation(format!("Uninstalls {}", names))
            .with_rollback(format!("{} {}", pm.install_command(), quoted))
        }
        IntentAction::Start | IntentAction::Stop | IntentAction::Restart => {
            return IntentOutcome::Clarify(format!(
                "Packages can't be started or stopped directly. Which service does {} provide?",
                names
            ))
        }
    };
    IntentOutcome::Steps(vec![step])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SystemContext {
        SystemContext {
            container_names: vec![
                "nextcloud-app".to_string(),
                "nextcloud-redis".to_string(),
                "nginx-proxy".to_string(),
            ],
            service_names: vec!["sshd.service".to_string(), "cups.service".to_string()],
            installed_packages: vec!["vlc".to_string()],
            ..Default::default()
        }
    }

    fn steps(outcome: IntentOutcome) -> Vec<TaskStep> {
        match outcome {
            IntentOutcome::Steps(steps) => steps,
            IntentOutcome::Clarify(q) => panic!("unexpected clarification: {}", q),
        }
    }

    #[test]
    fn test_parse_bulk_container_removal() {
        let intent = parse_intent("remove all nextcloud containers").unwrap();
        assert_eq!(intent.action, IntentAction::Remove);
        assert_eq!(intent.resource, Some(ResourceType::Container));
        assert_eq!(intent.filters, vec!["nextcloud"]);
        assert!(intent.select_all);
    }

    #[test]
    fn test_parse_named_filter_form() {
        let intent = parse_intent("Please stop the containers named nextcloud.").unwrap();
        assert_eq!(intent.action, IntentAction::Stop);
        assert_eq!(intent.resource, Some(ResourceType::Container));
        assert_eq!(intent.filters, vec!["nextcloud"]);
    }

    #[test]
    fn test_parse_packages() {
        let intent = parse_intent("install vim, git and tmux").unwrap();
        assert_eq!(intent.resource, Some(ResourceType::Package));
        assert_eq!(intent.filters, vec!["vim", "git", "tmux"]);
    }

    #[test]
    fn test_parse_unknown_verb() {
        assert!(parse_intent("make my computer faster").is_none());
        assert!(parse_intent("stop").is_none());
    }

    #[test]
    fn test_bulk_removal_pairs() {
        let intent = parse_intent("remove all nextcloud containers").unwrap();
        let steps = steps(plan_intent(&intent, &ctx(), None));
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "stop_nextcloud-app",
                "remove_nextcloud-app",
                "stop_nextcloud-redis",
                "remove_nextcloud-redis"
            ]
        );
        assert!(steps[1].depends_on.contains("stop_nextcloud-app"));
        assert!(steps.iter().all(|s| !s.id.contains("nginx")));
    }

    #[test]
    fn test_all_without_filter_selects_everything() {
        let intent = parse_intent("stop all containers").unwrap();
        assert_eq!(steps(plan_intent(&intent, &ctx(), None)).len(), 3);
    }

    #[test]
    fn test_infers_service_without_resource_word() {
        let intent = parse_intent("restart sshd").unwrap();
        assert_eq!(intent.resource, None);
        let steps = steps(plan_intent(&intent, &ctx(), None));
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[0].action.shell_command(),
            Some("sudo systemctl restart sshd")
        );
        assert!(steps[1].depends_on.contains("restart_sshd"));
    }

    #[test]
    fn test_infers_container_without_resource_word() {
        let intent = parse_intent("restart the proxy").unwrap();
        let steps = steps(plan_intent(&intent, &ctx(), None));
        assert_eq!(steps[0].action.shell_command(), Some("docker restart nginx-proxy"));
        match &steps[1].action {
            StepAction::Verification { check, expected } => {
                assert_eq!(
                    check,
                    &Probe::command("docker inspect -f '{{.State.Running}}' nginx-proxy")
                );
                assert_eq!(expected.as_deref(), Some("true"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unmatched_filter_asks() {
        let intent = parse_intent("remove all postgres containers").unwrap();
        match plan_intent(&intent, &ctx(), None) {
            IntentOutcome::Clarify(q) => {
                assert!(q.contains("postgres"));
                assert!(q.contains("nextcloud-app"));
            }
            other => panic!("expected clarification, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_target_asks() {
        let intent = parse_intent("restart frobnicator").unwrap();
        assert!(matches!(
            plan_intent(&intent, &ctx(), None),
            IntentOutcome::Clarify(_)
        ));
    }

    #[test]
    fn test_packages_need_manager() {
        let intent = parse_intent("install vim and git").unwrap();
        assert!(matches!(
            plan_intent(&intent, &ctx(), None),
            IntentOutcome::Clarify(_)
        ));

        let steps = steps(plan_intent(&intent, &ctx(), Some(PackageManager::Dnf)));
        assert_eq!(steps.len(), 1);
        assert_eq!(
            steps[0].action.shell_command(),
            Some("sudo dnf install -y vim git")
        );
    }

    #[test]
    fn test_remove_installed_package_inferred() {
        let intent = parse_intent("remove vlc").unwrap();
        let steps = steps(plan_intent(&intent, &ctx(), Some(PackageManager::Apt)));
        assert_eq!(steps[0].id, "remove_packages");
        assert_eq!(
            steps[0].rollback_command.as_deref(),
            Some("sudo apt-get install -y vlc")
        );
    }
}
