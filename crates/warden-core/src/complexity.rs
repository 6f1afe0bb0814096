//! Request complexity classification.
//!
//! Four pattern tables evaluated in fixed priority order: RISKY, DIAGNOSTIC,
//! COMPLEX, SIMPLE. The first table with any match wins, so safety concerns
//! override everything else. Word-count heuristics cover the rest.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    /// Direct execution, single command
    Simple,
    /// Needs planning, multiple steps
    Complex,
    /// Potentially destructive, needs confirmation
    Risky,
    /// Needs investigation before action
    Diagnostic,
}

impl ComplexityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Complex => "complex",
            Self::Risky => "risky",
            Self::Diagnostic => "diagnostic",
        }
    }
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityResult {
    pub level: ComplexityLevel,
    /// 0.0 to 1.0
    pub confidence: f32,
    pub reason: String,
    pub suggested_approach: String,
    pub keywords_matched: Vec<String>,
}

impl ComplexityResult {
    fn new(
        level: ComplexityLevel,
        confidence: f32,
        reason: impl Into<String>,
        approach: &str,
        keywords: Vec<String>,
    ) -> Self {
        Self {
            level,
            confidence,
            reason: reason.into(),
            suggested_approach: approach.to_string(),
            keywords_matched: keywords,
        }
    }
}

// =============================================================================
// Pattern Tables
// =============================================================================

type PatternTable = Vec<(Regex, &'static str)>;

const RISKY_PATTERNS: &[(&str, &str)] = &[
    (r"\b(delete|remove|erase)\s+(all|every)\b", "bulk deletion"),
    (r"\brm\s+-rf\b", "recursive delete"),
    (r"\bformat\b.*\b(disk|drive|partition)\b", "disk formatting"),
    (r"\b(wipe|destroy)\b", "data destruction"),
    (r"\bupgrade\b.*\bkernel\b", "kernel upgrade"),
    (r"\bdistro\s*upgrade\b", "distribution upgrade"),
    (r"\b(disable|stop)\b.*\b(firewall|security)\b", "security reduction"),
    (r"\bchmod\s+777\b", "permissive permissions"),
    (r"\bsudo\s+rm\b", "root deletion"),
    (r"\brepartition\b", "disk repartitioning"),
    (r"\breinstall\b.*\b(os|system)\b", "system reinstall"),
    (r"\bpurge\b", "package purge"),
    (r"\b(downgrade|rollback)\b", "version rollback"),
];

const DIAGNOSTIC_PATTERNS: &[(&str, &str)] = &[
    (r"\bwhy\s+(is|does|isn't|won't)\b", "diagnostic question"),
    (r"\b(isn't|not)\s+working\b", "troubleshooting"),
    (r"\b(slow|sluggish|laggy|unresponsive)\b", "performance issue"),
    (r"\b(hot|overheating|fan\s+(loud|noisy|running))\b", "thermal issue"),
    (r"\b(error|problem|issue|bug|crash)\b", "error diagnosis"),
    (r"\bwhat's\s+(wrong|happening|going\s+on)\b", "diagnostic question"),
    (r"\bcan't\s+(connect|access|open|run)\b", "connectivity/access issue"),
    (r"\b(broken|failed|failing)\b", "failure diagnosis"),
    (r"\bdebug\b", "debugging"),
    (r"\btroubleshoot\b", "troubleshooting"),
    (r"\b(wifi|network|internet)\s+(down|not working|disconnected)\b", "network issue"),
    (r"\b(boot|startup)\s+(slow|problem|hang)\b", "boot issue"),
];

const COMPLEX_PATTERNS: &[(&str, &str)] = &[
    (r"\bset\s*up\b.*\b(environment|development|server)\b", "environment setup"),
    (r"\bconfigure\b.*\b(for|to)\b", "system configuration"),
    (r"\bswitch\s+(from|to)\b", "system migration"),
    (r"\bmigrate\b", "data/system migration"),
    (r"\bupgrade\b.*\b(system|distribution|os)\b", "major upgrade"),
    (r"\b(speed|make)\b.*\b(up|faster|quicker)\b", "performance optimization"),
    (r"\boptimize\b", "optimization"),
    (r"\b(clean|free)\s*(up)?\b.*\b(disk|space|storage)\b", "cleanup operation"),
    (r"\bbackup\b", "backup operation"),
    (r"\brestore\b", "restore operation"),
    (r"\binstall\b.*\band\b.*\bconfigure\b", "install with config"),
    (r"\b(secure|harden)\b.*\b(system|server)\b", "security hardening"),
    (r"\bset\s*up\b.*\b(ssh|firewall|vpn|nginx|apache)\b", "service setup"),
    (r"\bcreate\b.*\b(user|account)\b.*\bwith\b", "user creation with config"),
    (r"\bautomate\b", "automation setup"),
    (r"\bschedule\b", "scheduled task setup"),
];

const SIMPLE_PATTERNS: &[(&str, &str)] = &[
    (r"\b(open|launch|start|run)\s+\w+\b", "application launch"),
    (
        r"\b(show|display|what('s| is)|tell me)\s+(my\s+)?(ip|disk|memory|cpu|ram)\b",
        "info query",
    ),
    (r"\b(list|show)\s+(running\s+)?(processes|services|packages)\b", "listing"),
    (r"\binstall\s+\w+\b", "single package install"),
    (r"\b(is|check if)\s+\w+\s+(running|installed|active)\b", "status check"),
    (r"\bhow much\s+(ram|memory|disk|space)\b", "resource query"),
    (r"\bwhat time\b", "simple query"),
    (r"\bwho am i\b", "identity query"),
    (r"\bwhat's my (username|hostname)\b", "identity query"),
    (r"\b(ping|traceroute|nslookup)\s+", "network diagnostic"),
    (r"\b(cat|head|tail|less)\s+", "file viewing"),
    (r"\bls\s+", "directory listing"),
    (r"\bdf\b", "disk space"),
    (r"\bfree\b", "memory info"),
    (r"\btop\b", "process monitor"),
    (r"\buptime\b", "uptime query"),
    (r"\bdate\b", "date query"),
];

/// Words that chain several actions in one request
const ACTION_WORDS: &[&str] = &["and", "then", "after", "before", "also", "plus"];

fn compile_table(patterns: &[(&str, &'static str)]) -> PatternTable {
    patterns
        .iter()
        .filter_map(|(pattern, description)| {
            match Regex::new(&format!("(?i){}", pattern)) {
                Ok(re) => Some((re, *description)),
                Err(e) => {
                    warn!("Skipping invalid complexity pattern {}: {}", pattern, e);
                    None
                }
            }
        })
        .collect()
}

static RISKY: LazyLock<PatternTable> = LazyLock::new(|| compile_table(RISKY_PATTERNS));
static DIAGNOSTIC: LazyLock<PatternTable> = LazyLock::new(|| compile_table(DIAGNOSTIC_PATTERNS));
static COMPLEX: LazyLock<PatternTable> = LazyLock::new(|| compile_table(COMPLEX_PATTERNS));
static SIMPLE: LazyLock<PatternTable> = LazyLock::new(|| compile_table(SIMPLE_PATTERNS));

fn match_table(text: &str, table: &PatternTable) -> Vec<String> {
    table
        .iter()
        .filter(|(re, _)| re.is_match(text))
        .map(|(_, description)| description.to_string())
        .collect()
}

// =============================================================================
// Assessor
// =============================================================================

/// Pure, deterministic request classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityAssessor;

impl ComplexityAssessor {
    pub fn new() -> Self {
        Self
    }

    pub fn assess(&self, request: &str) -> ComplexityResult {
        let text = request.trim();
        if text.is_empty() {
            return ComplexityResult::new(
                ComplexityLevel::Simple,
                1.0,
                "Empty request",
                "Ask for clarification",
                Vec::new(),
            );
        }

        let tables: [(&PatternTable, ComplexityLevel, f32, &str, &str); 4] = [
            (
                &*RISKY,
                ComplexityLevel::Risky,
                0.9,
                "Potentially destructive operation",
                "Present clear plan with warnings before execution",
            ),
            (
                &*DIAGNOSTIC,
                ComplexityLevel::Diagnostic,
                0.85,
                "Needs investigation",
                "Gather system information before suggesting solutions",
            ),
            (
                &*COMPLEX,
                ComplexityLevel::Complex,
                0.85,
                "Multi-step operation",
                "Create step-by-step plan with verification",
            ),
            (
                &*SIMPLE,
                ComplexityLevel::Simple,
                0.9,
                "Direct operation",
                "Execute directly and report result",
            ),
        ];

        for (table, level, confidence, reason, approach) in tables {
            let matched = match_table(text, table);
            if let Some(first) = matched.first() {
                debug!("Classified '{}' as {} ({})", text, level, first);
                let reason = format!("{}: {}", reason, first);
                return ComplexityResult::new(level, confidence, reason, approach, matched);
            }
        }

        self.heuristic_assessment(text)
    }

    fn heuristic_assessment(&self, request: &str) -> ComplexityResult {
        let lower = request.to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();

        if words.len() <= 3 {
            return ComplexityResult::new(
                ComplexityLevel::Simple,
                0.6,
                "Short request, likely simple operation",
                "Execute and verify",
                Vec::new(),
            );
        }

        let action_count = words.iter().filter(|w| ACTION_WORDS.contains(w)).count();
        if action_count >= 2 {
            let mut keywords: Vec<String> = ACTION_WORDS
                .iter()
                .filter(|a| words.contains(a))
                .map(|a| a.to_string())
                .collect();
            keywords.sort();
            return ComplexityResult::new(
                ComplexityLevel::Complex,
                0.7,
                "Multiple sequential actions implied",
                "Break down into steps",
                keywords,
            );
        }

        if lower.starts_with("how") {
            return ComplexityResult::new(
                ComplexityLevel::Complex,
                0.6,
                "How-to question may need multi-step explanation",
                "Provide steps with explanations",
                vec!["how".to_string()],
            );
        }

        ComplexityResult::new(
            ComplexityLevel::Simple,
            0.5,
            "No clear complexity indicators",
            "Execute and adapt if needed",
            Vec::new(),
        )
    }

    /// Whether a request at this level goes through the planner
    pub fn should_plan(&self, result: &ComplexityResult) -> bool {
        matches!(
            result.level,
            ComplexityLevel::Complex | ComplexityLevel::Risky | ComplexityLevel::Diagnostic
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(request: &str) -> ComplexityLevel {
        ComplexityAssessor::new().assess(request).level
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(RISKY.len(), RISKY_PATTERNS.len());
        assert_eq!(DIAGNOSTIC.len(), DIAGNOSTIC_PATTERNS.len());
        assert_eq!(COMPLEX.len(), COMPLEX_PATTERNS.len());
        assert_eq!(SIMPLE.len(), SIMPLE_PATTERNS.len());
    }

    #[test]
    fn test_empty_request() {
        let result = ComplexityAssessor::new().assess("   ");
        assert_eq!(result.level, ComplexityLevel::Simple);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.suggested_approach, "Ask for clarification");
    }

    #[test]
    fn test_simple_requests() {
        assert_eq!(level("install htop"), ComplexityLevel::Simple);
        assert_eq!(level("show my ip"), ComplexityLevel::Simple);
        assert_eq!(level("list running services"), ComplexityLevel::Simple);
        assert_eq!(level("ping example.com"), ComplexityLevel::Simple);
    }

    #[test]
    fn test_risky_overrides_everything() {
        // "remove all" is risky even though "containers" would not be
        assert_eq!(level("remove all nextcloud containers"), ComplexityLevel::Risky);
        assert_eq!(level("sudo rm -rf /var/cache"), ComplexityLevel::Risky);
        // Risky beats diagnostic
        assert_eq!(
            level("wipe the disk because of an error"),
            ComplexityLevel::Risky
        );
    }

    #[test]
    fn test_diagnostic_requests() {
        let result = ComplexityAssessor::new().assess("why is my wifi not working");
        assert_eq!(result.level, ComplexityLevel::Diagnostic);
        assert_eq!(result.confidence, 0.85);
        assert!(result.keywords_matched.contains(&"diagnostic question".to_string()));
        assert!(result.keywords_matched.contains(&"troubleshooting".to_string()));
    }

    #[test]
    fn test_complex_requests() {
        assert_ne!(
            level("set up a secure nginx reverse proxy with TLS and firewall rules"),
            ComplexityLevel::Simple
        );
        assert_eq!(level("optimize my boot time"), ComplexityLevel::Complex);
        assert_eq!(level("Migrate my photos to the NAS"), ComplexityLevel::Complex);
    }

    #[test]
    fn test_heuristics() {
        let assessor = ComplexityAssessor::new();

        let short = assessor.assess("hello there");
        assert_eq!(short.level, ComplexityLevel::Simple);
        assert_eq!(short.confidence, 0.6);

        let chained = assessor.assess("fetch the repo then build it and package it");
        assert_eq!(chained.level, ComplexityLevel::Complex);
        assert_eq!(chained.keywords_matched, vec!["and", "then"]);

        let how = assessor.assess("how would I get nicer fonts");
        assert_eq!(how.level, ComplexityLevel::Complex);
        assert_eq!(how.confidence, 0.6);

        let vague = assessor.assess("I would like nicer fonts please");
        assert_eq!(vague.level, ComplexityLevel::Simple);
        assert_eq!(vague.confidence, 0.5);
    }

    #[test]
    fn test_should_plan() {
        let assessor = ComplexityAssessor::new();
        assert!(!assessor.should_plan(&assessor.assess("install htop")));
        assert!(assessor.should_plan(&assessor.assess("purge old kernels")));
        assert!(assessor.should_plan(&assessor.assess("my laptop is slow")));
    }
}
