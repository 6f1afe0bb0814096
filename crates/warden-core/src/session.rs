//! Per-conversation engines owned by the host.
//!
//! Each conversation id maps to its own `ReasoningEngine`, so pending plans and
//! suspended executions never leak between conversations.

use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::WardenConfig;
use crate::engine::ReasoningEngine;
use crate::error::Result;
use crate::safety::SafetyManager;
use crate::shell::CommandRunner;

/// Builds the engine for a new conversation id
pub type EngineFactory = Box<dyn Fn(&str) -> Result<ReasoningEngine> + Send + Sync>;

struct SessionEntry {
    engine: ReasoningEngine,
    last_activity: Instant,
}

pub struct SessionStore {
    sessions: HashMap<String, SessionEntry>,
    factory: EngineFactory,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl SessionStore {
    pub fn new(factory: EngineFactory) -> Self {
        Self {
            sessions: HashMap::new(),
            factory,
        }
    }

    /// Engines on the configured backup root, one subdirectory per session
    pub fn with_defaults(config: WardenConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let root = config.safety.backup_dir();
        Self::new(Box::new(move |id| {
            let dir = session_backup_dir(&root, id);
            let safety = SafetyManager::open(dir, runner.clone())?.with_rollback_timeout(
                Duration::from_secs(config.safety.rollback_timeout_secs),
            );
            Ok(ReasoningEngine::new(&config, safety))
        }))
    }

    /// The engine for `id`, created on first use. Marks the session active.
    pub fn get_or_create(&mut self, id: &str) -> Result<&mut ReasoningEngine> {
        let entry = match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let engine = (self.factory)(id)?;
                info!("Opened session {}", id);
                slot.insert(SessionEntry {
                    engine,
                    last_activity: Instant::now(),
                })
            }
        };
        entry.last_activity = Instant::now();
        Ok(&mut entry.engine)
    }

    pub fn get(&self, id: &str) -> Option<&ReasoningEngine> {
        self.sessions.get(id).map(|e| &e.engine)
    }

    pub fn close(&mut self, id: &str) -> bool {
        let closed = self.sessions.remove(id).is_some();
        if closed {
            info!("Closed session {}", id);
        }
        closed
    }

    /// Drop sessions idle for at least `max_idle`. Returns their ids, sorted.
    pub fn evict_idle(&mut self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) >= max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        for id in &expired {
            self.sessions.remove(id);
            debug!("Evicted idle session {}", id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Session ids are untrusted; only a safe subset reaches the filesystem
fn session_backup_dir(root: &std::path::Path, id: &str) -> PathBuf {
    let name: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = if name.is_empty() { "default".to_string() } else { name };
    // Sanitizing is lossy; the digest keeps distinct ids in distinct dirs
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    root.join("sessions").join(format!("{}-{}", name, &digest[..12]))
}
