//! Fixed operation archetypes.
//!
//! Each template is a list of anchored patterns plus a step skeleton. `{name}`
//! is substituted raw into titles, descriptions and explanations, and
//! shell-quoted into commands. `{install}`, `{remove}` and `{query}` expand to
//! trusted package-manager fragments.

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::context::{PackageManager, SystemContext};
use crate::plan::{Probe, StepAction, TaskStep};
use crate::resolve::resolve_name;
use crate::shell::shell_quote;

/// What the captured name refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subject {
    Package,
    Service,
    Container,
}

#[derive(Debug, Clone, Copy)]
enum SkeletonAction {
    Command(&'static str),
    Diagnostic(&'static str),
    Verify {
        command: &'static str,
        expected: Option<&'static str>,
    },
}

#[derive(Debug, Clone, Copy)]
struct StepSkeleton {
    id: &'static str,
    title: &'static str,
    description: &'static str,
    action: SkeletonAction,
    depends_on: &'static [&'static str],
    rollback: Option<&'static str>,
}

struct TemplateDef {
    name: &'static str,
    subject: Subject,
    patterns: &'static [&'static str],
    steps: &'static [StepSkeleton],
}

const NAME: &str = r"(?P<name>[A-Za-z0-9][\w.@+-]*)";

// Patterns are written with `{NAME}` and expanded at compile time of the table.
const TEMPLATES: &[TemplateDef] = &[
    TemplateDef {
        name: "install_package",
        subject: Subject::Package,
        patterns: &[r"^(?:please\s+)?install\s+(?:the\s+)?(?:package\s+)?{NAME}(?:\s+package)?$"],
        steps: &[
            StepSkeleton {
                id: "install_{name}",
                title: "Install {name}",
                description: "Install the {name} package",
                action: SkeletonAction::Command("{install} {name}"),
                depends_on: &[],
                rollback: Some("{remove} {name}"),
            },
            StepSkeleton {
                id: "verify_{name}",
                title: "Verify {name} is installed",
                description: "Check that {name} is installed",
                action: SkeletonAction::Verify {
                    command: "{query} {name}",
                    expected: None,
                },
                depends_on: &["install_{name}"],
                rollback: None,
            },
        ],
    },
    TemplateDef {
        name: "remove_package",
        subject: Subject::Package,
        patterns: &[
            r"^(?:please\s+)?(?:uninstall|purge)\s+(?:the\s+)?(?:package\s+)?{NAME}(?:\s+package)?$",
            r"^(?:please\s+)?remove\s+(?:the\s+)?package\s+{NAME}$",
            r"^(?:please\s+)?remove\s+(?:the\s+)?{NAME}\s+package$",
        ],
        steps: &[
            StepSkeleton {
                id: "check_{name}",
                title: "Check {name} is installed",
                description: "Confirm {name} is installed before removing it",
                action: SkeletonAction::Diagnostic("{query} {name}"),
                depends_on: &[],
                rollback: None,
            },
            StepSkeleton {
                id: "remove_{name}",
                title: "Remove {name}",
                description: "Remove the {name} package",
                action: SkeletonAction::Command("{remove} {name}"),
                depends_on: &["check_{name}"],
                rollback: Some("{install} {name}"),
            },
        ],
    },
    TemplateDef {
        name: "restart_service",
        subject: Subject::Service,
        patterns: &[
            r"^(?:please\s+)?restart\s+(?:the\s+)?{NAME}\s+service$",
            r"^(?:please\s+)?restart\s+(?:the\s+)?service\s+{NAME}$",
        ],
        steps: &[
            StepSkeleton {
                id: "check_{name}",
                title: "Check {name} exists",
                description: "Verify the {name} unit exists",
                action: SkeletonAction::Diagnostic("systemctl cat {name} --no-pager"),
                depends_on: &[],
                rollback: None,
            },
            StepSkeleton {
                id: "restart_{name}",
                title: "Restart {name}",
                description: "Restart the {name} service",
                action: SkeletonAction::Command("sudo systemctl restart {name}"),
                depends_on: &["check_{name}"],
                rollback: Some("sudo systemctl start {name}"),
            },
            StepSkeleton {
                id: "verify_{name}",
                title: "Verify {name} is running",
                description: "Confirm {name} is active after the restart",
                action: SkeletonAction::Verify {
                    command: "systemctl show -p ActiveState {name}",
                    expected: Some("ActiveState=active"),
                },
                depends_on: &["restart_{name}"],
                rollback: None,
            },
        ],
    },
    // Before the single-verb container templates so "stop and remove" wins
    TemplateDef {
        name: "stop_and_remove_container",
        subject: Subject::Container,
        patterns: &[
            r"^(?:please\s+)?stop\s+and\s+(?:remove|delete)\s+(?:the\s+)?container\s+{NAME}$",
            r"^(?:please\s+)?stop\s+and\s+(?:remove|delete)\s+(?:the\s+)?{NAME}\s+container$",
        ],
        steps: &[
            StepSkeleton {
                id: "stop_{name}",
                title: "Stop {name}",
                description: "Stop the {name} container",
                action: SkeletonAction::Command("docker stop {name}"),
                depends_on: &[],
                rollback: Some("docker start {name}"),
            },
            StepSkeleton {
                id: "remove_{name}",
                title: "Remove {name}",
                description: "Remove the {name} container",
                action: SkeletonAction::Command("docker rm {name}"),
                depends_on: &["stop_{name}"],
                rollback: None,
            },
        ],
    },
    TemplateDef {
        name: "stop_container",
        subject: Subject::Container,
        patterns: &[
            r"^(?:please\s+)?stop\s+(?:the\s+)?container\s+{NAME}$",
            r"^(?:please\s+)?stop\s+(?:the\s+)?{NAME}\s+container$",
        ],
        steps: &[StepSkeleton {
            id: "stop_{name}",
            title: "Stop {name}",
            description: "Stop the {name} container",
            action: SkeletonAction::Command("docker stop {name}"),
            depends_on: &[],
            rollback: Some("docker start {name}"),
        }],
    },
    TemplateDef {
        name: "remove_container",
        subject: Subject::Container,
        patterns: &[
            r"^(?:please\s+)?(?:remove|delete)\s+(?:the\s+)?container\s+{NAME}$",
            r"^(?:please\s+)?(?:remove|delete)\s+(?:the\s+)?{NAME}\s+container$",
        ],
        steps: &[StepSkeleton {
            id: "remove_{name}",
            title: "Remove {name}",
            description: "Remove the {name} container",
            action: SkeletonAction::Command("docker rm {name}"),
            depends_on: &[],
            rollback: None,
        }],
    },
];

struct CompiledTemplate {
    def: &'static TemplateDef,
    patterns: Vec<Regex>,
}

static COMPILED: LazyLock<Vec<CompiledTemplate>> = LazyLock::new(|| {
    TEMPLATES
        .iter()
        .map(|def| CompiledTemplate {
            def,
            patterns: def
                .patterns
                .iter()
                .filter_map(|p| {
                    let source = format!("(?i){}", p.replace("{NAME}", NAME));
                    Regex::new(&source)
                        .map_err(|e| warn!("Skipping invalid template pattern {}: {}", p, e))
                        .ok()
                })
                .collect(),
        })
        .collect()
});

/// A template that fired, with its instantiated steps
#[derive(Debug, Clone)]
pub struct TemplateMatch {
    pub template: &'static str,
    pub name: String,
    pub steps: Vec<TaskStep>,
}

/// Try every template in table order.
///
/// Package templates are skipped when no package manager is known.
pub fn match_template(
    request: &str,
    context: &SystemContext,
    package_manager: Option<PackageManager>,
) -> Option<TemplateMatch> {
    let text = request
        .trim()
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?'))
        .trim();

    for template in COMPILED.iter() {
        let Some(captured) = template
            .patterns
            .iter()
            .find_map(|re| re.captures(text))
            .and_then(|caps| caps.name("name").map(|m| m.as_str().to_string()))
        else {
            continue;
        };

        let def = template.def;
        let name = match def.subject {
            Subject::Package => {
                if package_manager.is_none() {
                    debug!(
                        "Template {} matched but no package manager is known",
                        def.name
                    );
                    continue;
                }
                captured
            }
            Subject::Service => resolve_name(&captured, &context.service_candidates()),
            Subject::Container => resolve_name(&captured, &context.container_candidates()),
        };

        debug!("Matched template {} for '{}'", def.name, name);
        let vars = Vars {
            name: &name,
            package_manager,
        };
        let steps = def.steps.iter().map(|s| instantiate(s, &vars)).collect();
        return Some(TemplateMatch {
            template: def.name,
            name,
            steps,
        });
    }
    None
}

struct Vars<'a> {
    name: &'a str,
    package_manager: Option<PackageManager>,
}

impl Vars<'_> {
    fn text(&self, template: &str) -> String {
        template.replace("{name}", self.name)
    }

    fn command(&self, template: &str) -> String {
        let mut command = template.replace("{name}", &shell_quote(self.name));
        if let Some(pm) = self.package_manager {
            command = command
                .replace("{install}", pm.install_command())
                .replace("{remove}", pm.remove_command())
                .replace("{query}", pm.query_command());
        }
        command
    }
}

fn instantiate(skeleton: &StepSkeleton, vars: &Vars<'_>) -> TaskStep {
    let action = match skeleton.action {
        SkeletonAction::Command(command) => StepAction::command(vars.command(command)),
        SkeletonAction::Diagnostic(command) => StepAction::Diagnostic {
            probe: Probe::command(vars.command(command)),
        },
        SkeletonAction::Verify { command, expected } => StepAction::Verification {
            check: Probe::command(vars.command(command)),
            expected: expected.map(str::to_string),
        },
    };

    let description = vars.text(skeleton.description);
    let mut step = TaskStep::new(vars.text(skeleton.id), vars.text(skeleton.title), action)
        .with_explanation(format!("This step will {}", lowercase_first(&description)))
        .with_description(description)
        .depends_on(skeleton.depends_on.iter().map(|d| vars.text(d)));
    if let Some(rollback) = skeleton.rollback {
        step = step.with_rollback(vars.command(rollback));
    }
    step
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
