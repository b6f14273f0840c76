//! Path policy: which files a patch may touch.
//!
//! Every path is normalized the same way on both sides of a comparison
//! (configured lists and incoming patch paths), then checked in order:
//!
//! 1. lexical escape (absolute or `..` above the root) is always rejected,
//!    and reserved engine paths are always protected;
//! 2. an allow-list prefix permits the path outright;
//! 3. a protected prefix rejects it;
//! 4. when a scope list is supplied, the path must equal a scope entry or
//!    live under a scope entry declared as a directory (trailing `/`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical textual form of a workspace-relative path.
///
/// Backslashes become `/`, empty and `.` segments are dropped. A leading `/`
/// and a trailing `/` are kept so absolute paths stay detectable and
/// directory prefixes stay directory prefixes. Idempotent.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let absolute = unified.starts_with('/');
    let directory = unified.ends_with('/');

    let segments: Vec<&str> = unified
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect();

    let mut out = String::with_capacity(unified.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    if directory && !segments.is_empty() {
        out.push('/');
    }
    out
}

/// Whether a normalized path points outside the workspace root lexically.
pub fn escapes_root(normalized: &str) -> bool {
    if normalized.starts_with('/') || has_drive_prefix(normalized) {
        return true;
    }
    let mut depth: isize = 0;
    for segment in normalized.split('/').filter(|s| !s.is_empty()) {
        if segment == ".." {
            depth -= 1;
            if depth < 0 {
                return true;
            }
        } else {
            depth += 1;
        }
    }
    false
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Protected/allowed prefix lists plus the maintenance unlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub protected: Vec<String>,
    pub allowed: Vec<String>,
    /// Protected entry lifted in internal (maintenance) mode.
    pub maintenance_unlock: Option<String>,
    /// Exact paths the engine itself owns (its config file, temp and debug
    /// patches). Always protected: not configurable, not overridden by
    /// `allowed`, not lifted in internal mode.
    #[serde(skip)]
    pub reserved: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            protected: [
                "src/",
                ".git/",
                ".github/workflows/",
                "src/policy.rs",
                "src/engine/",
                "Cargo.lock",
                ".env",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allowed: Vec::new(),
            maintenance_unlock: Some("src/".to_string()),
            reserved: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Copy with per-call protected and allowed entries appended.
    pub fn with_extra(&self, protected: &[String], allowed: &[String]) -> Self {
        let mut next = self.clone();
        next.protected.extend(protected.iter().cloned());
        next.allowed.extend(allowed.iter().cloned());
        next
    }

    /// Copy with `entries` added to the reserved paths.
    pub fn with_reserved<I, S>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.reserved.extend(entries.into_iter().map(Into::into));
        next
    }

    pub fn is_protected(&self, path: &str) -> bool {
        matches!(self.decide(path, None), PolicyDecision::Protected)
    }

    /// Verdict for a single path.
    pub fn decide(&self, path: &str, scope: Option<&[String]>) -> PolicyDecision {
        let path = normalize_path(path);

        if escapes_root(&path) {
            return PolicyDecision::OutsideWorkspace;
        }
        if self.reserved.iter().any(|entry| normalize_path(entry) == path) {
            return PolicyDecision::Protected;
        }
        if prefix_match(&self.allowed, &path) {
            return PolicyDecision::Allowed;
        }
        if prefix_match(&self.protected, &path) {
            return PolicyDecision::Protected;
        }
        match scope {
            Some(entries) if !in_scope(entries, &path) => PolicyDecision::OutOfScope,
            _ => PolicyDecision::InScope,
        }
    }
}

/// The policy in force for one call.
///
/// In internal mode exactly the `maintenance_unlock` entry is removed, so
/// narrower entries under it (`src/engine/`, `src/policy.rs`) stay protected.
pub fn effective_protected(base: &PolicyConfig, internal_mode: bool) -> PolicyConfig {
    let mut policy = base.clone();
    if !internal_mode {
        return policy;
    }
    let unlock = base
        .maintenance_unlock
        .as_deref()
        .map(normalize_path)
        .filter(|u| !u.is_empty());
    if let Some(unlock) = unlock {
        policy
            .protected
            .retain(|entry| normalize_path(entry) != unlock);
    }
    policy
}

fn prefix_match(entries: &[String], path: &str) -> bool {
    entries.iter().any(|entry| {
        let entry = normalize_path(entry);
        !entry.is_empty() && path.starts_with(&entry)
    })
}

fn in_scope(entries: &[String], path: &str) -> bool {
    entries.iter().any(|entry| {
        let entry = normalize_path(entry);
        if entry.is_empty() {
            return false;
        }
        path == entry || (entry.ends_with('/') && path.starts_with(&entry))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Protected,
    Allowed,
    InScope,
    OutOfScope,
    OutsideWorkspace,
}

impl PolicyDecision {
    pub fn is_permitted(self) -> bool {
        matches!(self, PolicyDecision::Allowed | PolicyDecision::InScope)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Violation {
    Protected(String),
    OutOfScope(String),
    OutsideWorkspace(String),
}

impl Violation {
    pub fn path(&self) -> &str {
        match self {
            Violation::Protected(p) | Violation::OutOfScope(p) | Violation::OutsideWorkspace(p) => {
                p
            }
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Protected(p) => write!(f, "Protected path: {p}"),
            Violation::OutOfScope(p) => write!(f, "Outside scope: {p}"),
            Violation::OutsideWorkspace(p) => write!(f, "Outside workspace: {p}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyReport {
    pub ok: bool,
    pub violations: Vec<Violation>,
}

impl PolicyReport {
    pub fn protected_paths(&self) -> Vec<String> {
        self.violations
            .iter()
            .filter_map(|v| match v {
                Violation::Protected(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_protected(&self) -> bool {
        self.violations
            .iter()
            .any(|v| matches!(v, Violation::Protected(_)))
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Check every path and collect one violation per offending path.
pub fn validate_paths<S: AsRef<str>>(
    paths: &[S],
    policy: &PolicyConfig,
    scope: Option<&[String]>,
) -> PolicyReport {
    let mut violations: Vec<Violation> = Vec::new();

    for raw in paths {
        let path = normalize_path(raw.as_ref());
        let violation = match policy.decide(&path, scope) {
            PolicyDecision::Protected => Violation::Protected(path),
            PolicyDecision::OutOfScope => Violation::OutOfScope(path),
            PolicyDecision::OutsideWorkspace => Violation::OutsideWorkspace(path),
            PolicyDecision::Allowed | PolicyDecision::InScope => continue,
        };
        if !violations.contains(&violation) {
            violations.push(violation);
        }
    }

    PolicyReport {
        ok: violations.is_empty(),
        violations,
    }
}
