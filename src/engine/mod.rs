//! The apply orchestrator.
//!
//! [`PatchEngine::apply`] drives one patch through sanitizing, policy,
//! backup, quality gates and an escalating sequence of apply strategies:
//!
//! ```text
//! strict -> lenient (--ignore-whitespace -C1) -> three-way (-3) -> direct write
//! ```
//!
//! Direct write is only reachable in full-file mode and only when every
//! target is a new file. After any mutation the touched files are checked
//! for corruption and restored (savepoint first, backups otherwise).
//! Every failure comes back as an [`ApplyError`] inside [`ApplyOutcome`];
//! nothing here panics or returns early without cleanup.

pub mod savepoint;
pub mod tool;

pub use savepoint::{GitSavepoint, Savepoint, SavepointError};
pub use tool::{ApplyTool, GitApply, ToolError};

use crate::config::{EngineConfig, CONFIG_FILE_NAME};
use crate::fs_util::{atomic_write, remove_if_exists};
use crate::patch::{self, FileKind, Patch};
use crate::policy::{
    effective_protected, normalize_path, validate_paths, PolicyConfig, PolicyReport, Violation,
};
use crate::quality::{
    backup_files, restore_file, validate_applied_files, validate_content_changes,
    validate_context, validate_patch_quality, BackupSet, FileExpectation, QualityError,
    QualityThresholds,
};
use crate::safety::WorkspaceGuard;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// First line of a patch whose operations were already applied elsewhere.
pub const NDJSON_MARKER: &str = "# NDJSON Operations Applied";

/// Lines scanned for a human-written justification.
const JUSTIFICATION_SCAN_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    Strict,
    Lenient,
    ThreeWay,
    DirectWrite,
}

impl ApplyMode {
    /// Modes handed to the apply tool, cheapest first.
    pub const ESCALATION: [ApplyMode; 3] = [ApplyMode::Strict, ApplyMode::Lenient, ApplyMode::ThreeWay];

    pub fn flags(self) -> &'static [&'static str] {
        match self {
            ApplyMode::Strict | ApplyMode::DirectWrite => &[],
            ApplyMode::Lenient => &["--ignore-whitespace", "-C1"],
            ApplyMode::ThreeWay => &["-3"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApplyMode::Strict => "strict",
            ApplyMode::Lenient => "lenient",
            ApplyMode::ThreeWay => "three_way",
            ApplyMode::DirectWrite => "direct_write",
        }
    }
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Governance escalation for a patch that touches protected paths.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Protected paths require approval: {}", .paths.join(", "))]
pub struct ProtectedPathError {
    pub paths: Vec<String>,
    pub justification: Option<String>,
    pub violations: Vec<String>,
}

impl ProtectedPathError {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    ProtectedPath(ProtectedPathError),

    #[error("Patch outside declared scope: {}", .violations.join("; "))]
    OutOfScope { violations: Vec<String> },

    #[error("Patch escapes the workspace: {}", .violations.join("; "))]
    OutsideWorkspace { violations: Vec<String> },

    #[error("New file already exists: {path}")]
    NewFileConflict { path: String },

    #[error("New file would overwrite protected path: {}", .0.paths.join(", "))]
    UnsafeNewFileConflict(ProtectedPathError),

    #[error("Patch failed quality checks: {}", .issues.join("; "))]
    Quality { issues: Vec<String> },

    #[error("diff_mode_patch_failed: {detail}")]
    DiffModePatchFailed { detail: String },

    #[error("no fallback for existing files: {}", .paths.join(", "))]
    NoFallbackForExistingFiles { paths: Vec<String> },

    #[error("no new files for fallback")]
    NoNewFilesForFallback,

    #[error("Direct write failed for {path}: {detail}")]
    DirectWriteFailed { path: String, detail: String },

    #[error(
        "Post-apply validation failed for {}: {}",
        .paths.join(", "),
        corrupted_summary(.restored, .failed, .rolled_back)
    )]
    Corrupted {
        paths: Vec<String>,
        restored: usize,
        failed: usize,
        rolled_back: bool,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Backup(#[from] QualityError),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn corrupted_summary(restored: &usize, failed: &usize, rolled_back: &bool) -> String {
    if *rolled_back {
        "rolled back to savepoint".to_string()
    } else {
        format!("restored {restored}, failed to restore {failed}")
    }
}

impl ApplyError {
    /// Stable machine-readable identifier.
    pub fn code(&self) -> &'static str {
        match self {
            ApplyError::ProtectedPath(_) => "protected_path",
            ApplyError::OutOfScope { .. } => "out_of_scope",
            ApplyError::OutsideWorkspace { .. } => "outside_workspace",
            ApplyError::NewFileConflict { .. } => "new_file_conflict",
            ApplyError::UnsafeNewFileConflict(_) => "unsafe_new_file_conflict",
            ApplyError::Quality { .. } => "quality_rejected",
            ApplyError::DiffModePatchFailed { .. } => "diff_mode_patch_failed",
            ApplyError::NoFallbackForExistingFiles { .. } => "no fallback for existing files",
            ApplyError::NoNewFilesForFallback => "no new files for fallback",
            ApplyError::DirectWriteFailed { .. } => "direct_write_failed",
            ApplyError::Corrupted { .. } => "post_apply_corruption",
            ApplyError::Io(_) => "io_error",
            ApplyError::Backup(_) => "backup_failed",
            ApplyError::Internal(_) => "internal_error",
        }
    }

    /// The governance payload, if this failure needs human approval.
    pub fn escalation(&self) -> Option<&ProtectedPathError> {
        match self {
            ApplyError::ProtectedPath(payload) | ApplyError::UnsafeNewFileConflict(payload) => {
                Some(payload)
            }
            _ => None,
        }
    }
}

/// Result of one [`PatchEngine::apply`] call.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub success: bool,
    pub error: Option<ApplyError>,
    /// Strategy that landed the patch. `None` for no-ops, synthetic patches
    /// and failures.
    pub mode: Option<ApplyMode>,
}

impl ApplyOutcome {
    fn succeeded(mode: Option<ApplyMode>) -> Self {
        Self {
            success: true,
            error: None,
            mode,
        }
    }

    fn failed(error: ApplyError) -> Self {
        Self {
            success: false,
            error: Some(error),
            mode: None,
        }
    }

    pub fn into_parts(self) -> (bool, Option<ApplyError>) {
        (self.success, self.error)
    }
}

/// Per-call knobs.
#[derive(Default)]
pub struct ApplyOptions<'a> {
    /// Allow writing new files directly when every diff mode fails.
    pub full_file_mode: bool,
    /// When set, every touched path must fall inside it.
    pub scope: Option<Vec<String>>,
    /// Maintenance mode: lifts the broad source-root protection.
    pub internal_mode: bool,
    pub extra_protected: Vec<String>,
    pub extra_allowed: Vec<String>,
    pub savepoint: Option<&'a mut dyn Savepoint>,
}

impl fmt::Debug for ApplyOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyOptions")
            .field("full_file_mode", &self.full_file_mode)
            .field("scope", &self.scope)
            .field("internal_mode", &self.internal_mode)
            .field("extra_protected", &self.extra_protected)
            .field("extra_allowed", &self.extra_allowed)
            .field("savepoint", &self.savepoint.is_some())
            .finish()
    }
}

/// Engine-wide settings, usually built from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: PolicyConfig,
    pub quality: QualityThresholds,
    pub temp_patch_name: String,
    pub debug_patch_name: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            quality: QualityThresholds::default(),
            temp_patch_name: "temp_patch.diff".to_string(),
            debug_patch_name: "last_patch_debug.diff".to_string(),
        }
    }
}

/// Temp patch file handed to the apply tool; deleted on drop.
struct TempPatchFile {
    path: PathBuf,
}

impl TempPatchFile {
    fn create(dir: &Path, name: &str, content: &str) -> std::io::Result<Self> {
        let path = dir.join(name);
        fs::write(&path, content)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPatchFile {
    fn drop(&mut self) {
        if let Err(e) = remove_if_exists(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove temp patch");
        }
    }
}

pub struct PatchEngine<T: ApplyTool = GitApply> {
    tool: T,
    settings: EngineSettings,
}

impl Default for PatchEngine<GitApply> {
    fn default() -> Self {
        Self::new(GitApply::default(), EngineSettings::default())
    }
}

impl PatchEngine<GitApply> {
    pub fn from_config(config: &EngineConfig) -> Self {
        let timeout = config.apply.timeout_secs.map(Duration::from_secs);
        Self::new(
            GitApply::new(config.apply.git.clone(), timeout),
            EngineSettings {
                policy: config.policy.clone(),
                quality: config.quality,
                temp_patch_name: config.apply.temp_patch_name.clone(),
                debug_patch_name: config.apply.debug_patch_name.clone(),
            },
        )
    }
}

impl<T: ApplyTool> PatchEngine<T> {
    pub fn new(tool: T, settings: EngineSettings) -> Self {
        Self { tool, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The policy in force for a call with these options.
    pub fn policy_for(&self, options: &ApplyOptions<'_>) -> PolicyConfig {
        effective_protected(&self.settings.policy, options.internal_mode)
            .with_extra(&options.extra_protected, &options.extra_allowed)
            .with_reserved([
                CONFIG_FILE_NAME,
                self.settings.temp_patch_name.as_str(),
                self.settings.debug_patch_name.as_str(),
            ])
    }

    /// Apply `patch_text` to `workspace`.
    pub fn apply(
        &self,
        patch_text: &str,
        workspace: &Path,
        mut options: ApplyOptions<'_>,
    ) -> ApplyOutcome {
        match self.run(patch_text, workspace, &mut options) {
            Ok(mode) => {
                match mode {
                    Some(mode) => info!(mode = %mode, "patch applied"),
                    None => info!("patch accepted without changes"),
                }
                ApplyOutcome::succeeded(mode)
            }
            Err(error) => {
                warn!(code = error.code(), error = %error, "patch not applied");
                ApplyOutcome::failed(error)
            }
        }
    }

    fn run(
        &self,
        patch_text: &str,
        workspace: &Path,
        options: &mut ApplyOptions<'_>,
    ) -> Result<Option<ApplyMode>, ApplyError> {
        if patch_text.trim().is_empty() {
            debug!("empty patch");
            return Ok(None);
        }

        let text = patch::parser::normalize_line_endings(patch_text);
        let policy = self.policy_for(options);
        let scope = options.scope.as_deref();

        let guard = WorkspaceGuard::new(workspace)
            .map_err(|e| ApplyError::Internal(format!("workspace unusable: {e}")))?;
        let root = guard.workspace_root().to_path_buf();

        if text.lines().next().map(str::trim) == Some(NDJSON_MARKER) {
            let paths = synthetic_paths(&text);
            info!(files = paths.len(), "validating already-applied operations");
            check_policy(&paths, &policy, scope, &text)?;
            check_workspace(&guard, &paths)?;
            return Ok(None);
        }

        let sanitized = patch::sanitize(&text);
        check_new_file_conflicts(&patch::parse(&sanitized), &root, &policy, &text)?;

        let repaired = patch::repair_hunk_headers(&sanitized, Some(&root));
        let parsed = patch::parse(&repaired);
        let paths: Vec<String> = parsed
            .touched_paths()
            .iter()
            .map(|p| normalize_path(p))
            .collect();

        check_policy(&paths, &policy, scope, &text)?;
        check_workspace(&guard, &paths)?;

        let backups = backup_files(&root, &paths)?;

        let mut savepoint = options.savepoint.as_deref_mut();
        if let Some(sp) = savepoint.as_deref_mut() {
            if let Err(e) = sp.create(&root, "patchgate savepoint") {
                warn!(error = %e, "savepoint unavailable, continuing with file backups only");
                savepoint = None;
            }
        }

        let attempt = Attempt {
            root: &root,
            parsed: &parsed,
            backups: &backups,
            policy: &policy,
            full_file_mode: options.full_file_mode,
            has_savepoint: savepoint.is_some(),
        };
        let mut result = self.apply_guarded(&text, &repaired, &attempt);

        if let Some(sp) = savepoint {
            let rollback = matches!(
                result,
                Err(ApplyError::Quality { .. }
                    | ApplyError::Internal(_)
                    | ApplyError::Io(_)
                    | ApplyError::DirectWriteFailed { .. }
                    | ApplyError::Corrupted { .. })
            );
            let cleanup = if rollback {
                info!("rolling back to savepoint");
                sp.rollback(&root)
            } else {
                sp.release(&root)
            };
            if let Err(e) = cleanup {
                warn!(error = %e, rollback, "savepoint cleanup failed");
                if let Err(ApplyError::Corrupted {
                    paths,
                    rolled_back: true,
                    ..
                }) = result
                {
                    result = Err(restore_corrupted(&attempt, paths));
                }
            }
        }

        result.map(Some)
    }

    /// Everything after backups exist: quality gate, escalation, corruption
    /// check.
    fn apply_guarded(
        &self,
        raw: &str,
        repaired: &str,
        attempt: &Attempt<'_>,
    ) -> Result<ApplyMode, ApplyError> {
        let issues = validate_patch_quality(raw);
        if !issues.is_empty() {
            return Err(ApplyError::Quality { issues });
        }

        let root = attempt.root;
        let temp = TempPatchFile::create(root, &self.settings.temp_patch_name, repaired)?;
        if let Err(e) = atomic_write(&root.join(&self.settings.debug_patch_name), repaired.as_bytes())
        {
            warn!(error = %e, "could not write debug copy of patch");
        }

        for warning in validate_context(root, attempt.parsed) {
            warn!("{warning}");
        }

        let mode = match self.escalate(root, temp.path()) {
            Ok(mode) => mode,
            Err(detail) => {
                // A failed attempt (three-way conflicts in particular) can
                // leave partial edits behind.
                restore_all(attempt);
                self.direct_write(attempt, detail)?
            }
        };
        drop(temp);

        self.post_validate(attempt, mode)?;
        Ok(mode)
    }

    /// Try each diff mode in order; `Err` carries the last failure detail.
    fn escalate(&self, root: &Path, patch_file: &Path) -> Result<ApplyMode, String> {
        let mut detail = String::from("no apply attempt made");
        for mode in ApplyMode::ESCALATION {
            if let Err(e) = self.tool.check(root, patch_file, mode) {
                debug!(mode = %mode, error = %e, "dry run failed");
                detail = e.to_string();
                continue;
            }
            match self.tool.apply(root, patch_file, mode) {
                Ok(()) => return Ok(mode),
                Err(e) => {
                    warn!(mode = %mode, error = %e, "apply failed after passing dry run");
                    detail = e.to_string();
                }
            }
        }
        Err(detail)
    }

    /// Last resort: write new files from their Addition lines.
    fn direct_write(&self, attempt: &Attempt<'_>, detail: String) -> Result<ApplyMode, ApplyError> {
        if !attempt.full_file_mode {
            return Err(ApplyError::DiffModePatchFailed { detail });
        }

        let sections = &attempt.parsed.sections;
        let existing: Vec<String> = sections
            .iter()
            .filter(|s| s.kind() != FileKind::New)
            .filter_map(|s| s.path())
            .collect();
        if !existing.is_empty() {
            return Err(ApplyError::NoFallbackForExistingFiles { paths: existing });
        }

        let new_files: Vec<(String, String)> = sections
            .iter()
            .filter_map(|s| s.path().map(|p| (normalize_path(&p), s.new_file_content())))
            .collect();
        if new_files.is_empty() {
            return Err(ApplyError::NoNewFilesForFallback);
        }

        info!(files = new_files.len(), "falling back to direct write");
        for (path, content) in &new_files {
            if let Err(e) = atomic_write(&attempt.root.join(path), content.as_bytes()) {
                restore_all(attempt);
                return Err(ApplyError::DirectWriteFailed {
                    path: path.clone(),
                    detail: e.to_string(),
                });
            }
        }
        Ok(ApplyMode::DirectWrite)
    }

    fn post_validate(&self, attempt: &Attempt<'_>, mode: ApplyMode) -> Result<(), ApplyError> {
        let root = attempt.root;
        let check = validate_applied_files(root, &FileExpectation::from_patch(attempt.parsed));

        if !check.all_valid {
            let paths: Vec<String> = check.corrupted.iter().map(|c| c.path.clone()).collect();
            for file in &check.corrupted {
                warn!(path = %file.path, reason = %file.reason, mode = %mode, "corrupted after apply");
            }
            if attempt.has_savepoint {
                return Err(ApplyError::Corrupted {
                    paths,
                    restored: 0,
                    failed: 0,
                    rolled_back: true,
                });
            }
            return Err(restore_corrupted(attempt, paths));
        }

        let modified: Vec<String> = attempt
            .parsed
            .sections
            .iter()
            .filter(|s| s.kind() == FileKind::Modified)
            .filter_map(|s| s.path())
            .map(|p| normalize_path(&p))
            .collect();
        let content = validate_content_changes(root, &modified, attempt.backups, &self.settings.quality);
        for problem in &content.problems {
            warn!(advisory = true, "{problem}");
        }
        Ok(())
    }
}

/// Borrowed state shared by the post-backup phases.
struct Attempt<'a> {
    root: &'a Path,
    parsed: &'a Patch,
    backups: &'a BackupSet,
    policy: &'a PolicyConfig,
    full_file_mode: bool,
    has_savepoint: bool,
}

/// Restore each corrupted file after a failed post-apply check: from its
/// backup when one exists, otherwise by removing it. Counts cover only the
/// corrupted files.
fn restore_corrupted(attempt: &Attempt<'_>, paths: Vec<String>) -> ApplyError {
    let (mut restored, mut failed) = (0, 0);
    for path in &paths {
        let ok = match attempt.backups.get(path) {
            Some(entry) => restore_file(attempt.root, path, entry),
            None => remove_orphan(attempt, path),
        };
        if ok {
            restored += 1;
        } else {
            failed += 1;
        }
    }
    debug!(restored, failed, "corrupted files restored");
    ApplyError::Corrupted {
        paths,
        restored,
        failed,
        rolled_back: false,
    }
}

/// Put every backed-up file back after a failed escalation.
fn restore_all(attempt: &Attempt<'_>) {
    let mut failed = 0;
    for (path, entry) in attempt.backups.iter() {
        if !restore_file(attempt.root, path, entry) {
            failed += 1;
        }
    }
    debug!(files = attempt.backups.len(), failed, "backups restored");
}

/// Remove a corrupted file that had no backup. Protected files are left
/// alone and count as a failed restore.
fn remove_orphan(attempt: &Attempt<'_>, path: &str) -> bool {
    if attempt.policy.is_protected(path) {
        warn!(path = %path, "refusing to delete protected file without a backup");
        return false;
    }
    match remove_if_exists(&attempt.root.join(path)) {
        Ok(_) => true,
        Err(e) => {
            warn!(path = %path, error = %e, "failed to remove corrupted file");
            false
        }
    }
}

/// Symlink-aware containment check for every declared path.
fn check_workspace(guard: &WorkspaceGuard, paths: &[String]) -> Result<(), ApplyError> {
    let escapes: Vec<String> = paths
        .iter()
        .filter_map(|p| guard.validate_path(p).err().map(|e| format!("{p}: {e}")))
        .collect();
    if escapes.is_empty() {
        Ok(())
    } else {
        Err(ApplyError::OutsideWorkspace { violations: escapes })
    }
}

fn check_policy(
    paths: &[String],
    policy: &PolicyConfig,
    scope: Option<&[String]>,
    text: &str,
) -> Result<(), ApplyError> {
    let report = validate_paths(paths, policy, scope);
    if report.ok {
        return Ok(());
    }
    Err(policy_error(&report, text))
}

fn policy_error(report: &PolicyReport, text: &str) -> ApplyError {
    if report.has_protected() {
        return ApplyError::ProtectedPath(ProtectedPathError {
            paths: report.protected_paths(),
            justification: extract_justification(text),
            violations: report.messages(),
        });
    }
    let outside = report
        .violations
        .iter()
        .any(|v| matches!(v, Violation::OutsideWorkspace(_)));
    if outside {
        ApplyError::OutsideWorkspace {
            violations: report.messages(),
        }
    } else {
        ApplyError::OutOfScope {
            violations: report.messages(),
        }
    }
}

/// New-file sections must not clobber existing files.
fn check_new_file_conflicts(
    parsed: &Patch,
    root: &Path,
    policy: &PolicyConfig,
    text: &str,
) -> Result<(), ApplyError> {
    for section in parsed.sections.iter().filter(|s| s.kind() == FileKind::New) {
        let Some(path) = section.path().map(|p| normalize_path(&p)) else {
            continue;
        };
        if crate::policy::escapes_root(&path) || !root.join(&path).exists() {
            continue;
        }
        if policy.is_protected(&path) {
            return Err(ApplyError::UnsafeNewFileConflict(ProtectedPathError {
                violations: vec![format!("Protected path: {path}")],
                paths: vec![path],
                justification: extract_justification(text),
            }));
        }
        return Err(ApplyError::NewFileConflict { path });
    }
    Ok(())
}

/// Paths referenced by an already-applied NDJSON patch: diff headers plus
/// `path`/`file`/`target` fields of JSON object lines.
pub fn synthetic_paths(text: &str) -> Vec<String> {
    let mut paths: Vec<String> = patch::parse(text)
        .touched_paths()
        .into_iter()
        .map(|p| normalize_path(&p))
        .collect();

    for line in text.lines().map(str::trim).filter(|l| l.starts_with('{')) {
        let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(line)
        else {
            continue;
        };
        for key in ["path", "file", "target"] {
            if let Some(value) = map.get(key).and_then(|v| v.as_str()) {
                let value = normalize_path(value);
                if !value.is_empty() && !paths.contains(&value) {
                    paths.push(value);
                }
            }
        }
    }
    paths
}

/// Human-readable reason for the change, from `# ` comments and
/// `Subject:`/`Summary:` headers near the top of the patch.
pub fn extract_justification(text: &str) -> Option<String> {
    let mut parts = Vec::new();
    for line in text.lines().take(JUSTIFICATION_SCAN_LINES) {
        let line = line.trim();
        if line == NDJSON_MARKER {
            continue;
        }
        let piece = line
            .strip_prefix("# ")
            .or_else(|| line.strip_prefix("Subject:"))
            .or_else(|| line.strip_prefix("Summary:"))
            .map(str::trim);
        if let Some(piece) = piece.filter(|p| !p.is_empty()) {
            parts.push(piece.to_string());
        }
    }
    (!parts.is_empty()).then(|| parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Tool double: each mode either passes or fails, and a passing apply
    /// runs a caller-supplied mutation.
    struct ScriptedTool {
        passing: Vec<ApplyMode>,
        on_apply: Box<dyn Fn(&Path)>,
        calls: RefCell<Vec<(ApplyMode, bool)>>,
    }

    impl ScriptedTool {
        fn new(passing: Vec<ApplyMode>, on_apply: impl Fn(&Path) + 'static) -> Self {
            Self {
                passing,
                on_apply: Box::new(on_apply),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn verdict(&self, mode: ApplyMode, dry_run: bool) -> Result<(), ToolError> {
            self.calls.borrow_mut().push((mode, dry_run));
            if self.passing.contains(&mode) {
                Ok(())
            } else {
                Err(ToolError::Rejected {
                    mode,
                    stderr: "patch does not apply".into(),
                })
            }
        }
    }

    impl ApplyTool for ScriptedTool {
        fn check(&self, _: &Path, _: &Path, mode: ApplyMode) -> Result<(), ToolError> {
            self.verdict(mode, true)
        }

        fn apply(&self, workspace: &Path, _: &Path, mode: ApplyMode) -> Result<(), ToolError> {
            self.verdict(mode, false)?;
            (self.on_apply)(workspace);
            Ok(())
        }
    }

    fn open_policy() -> EngineSettings {
        EngineSettings {
            policy: PolicyConfig {
                protected: vec!["config/".into()],
                allowed: Vec::new(),
                maintenance_unlock: None,
                reserved: Vec::new(),
            },
            ..EngineSettings::default()
        }
    }

    const MODIFY: &str = "--- a/notes.txt\n+++ b/notes.txt\n@@ -1,2 +1,2 @@\n alpha\n-beta\n+BETA\n";

    #[test]
    fn test_empty_patch_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());

        let outcome = engine.apply("  \n", dir.path(), ApplyOptions::default());
        assert!(outcome.success);
        assert!(outcome.mode.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_escalates_until_a_mode_passes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
        let tool = ScriptedTool::new(vec![ApplyMode::ThreeWay], |ws| {
            fs::write(ws.join("notes.txt"), "alpha\nBETA\n").unwrap();
        });
        let engine = PatchEngine::new(tool, open_policy());

        let outcome = engine.apply(MODIFY, dir.path(), ApplyOptions::default());
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.mode, Some(ApplyMode::ThreeWay));
        assert_eq!(
            *engine.tool.calls.borrow(),
            vec![
                (ApplyMode::Strict, true),
                (ApplyMode::Lenient, true),
                (ApplyMode::ThreeWay, true),
                (ApplyMode::ThreeWay, false),
            ]
        );
        assert!(!dir.path().join("temp_patch.diff").exists());
        assert!(dir.path().join("last_patch_debug.diff").exists());
    }

    #[test]
    fn test_all_modes_fail_without_full_file_mode() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());

        let (ok, error) = engine
            .apply(MODIFY, dir.path(), ApplyOptions::default())
            .into_parts();
        assert!(!ok);
        let error = error.unwrap();
        assert_eq!(error.code(), "diff_mode_patch_failed");
        assert!(error.to_string().contains("patch does not apply"));
    }

    #[test]
    fn test_fallback_refuses_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());

        let outcome = engine.apply(
            MODIFY,
            dir.path(),
            ApplyOptions {
                full_file_mode: true,
                ..Default::default()
            },
        );
        assert!(!outcome.success);
        assert!(matches!(
            outcome.error,
            Some(ApplyError::NoFallbackForExistingFiles { .. })
        ));
        assert_eq!(
            fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "alpha\nbeta\n"
        );
    }

    #[test]
    fn test_direct_write_for_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());
        let text = "\
diff --git a/pkg/new.py b/pkg/new.py
new file mode 100644
--- /dev/null
+++ b/pkg/new.py
@@ -0,0 +1,2 @@
+def f():
+    return 1
@@ -10,0 +10,1 @@
+VALUE = 2
";
        let outcome = engine.apply(
            text,
            dir.path(),
            ApplyOptions {
                full_file_mode: true,
                ..Default::default()
            },
        );
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.mode, Some(ApplyMode::DirectWrite));
        assert_eq!(
            fs::read_to_string(dir.path().join("pkg/new.py")).unwrap(),
            "def f():\n    return 1\nVALUE = 2\n"
        );
    }

    #[test]
    fn test_new_file_conflict() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("exists.txt"), "x").unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(dir.path().join("config/app.yaml"), "x").unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());

        let plain = "--- /dev/null\n+++ b/exists.txt\n@@ -0,0 +1 @@\n+y\n";
        let error = engine
            .apply(plain, dir.path(), ApplyOptions::default())
            .error
            .unwrap();
        assert!(matches!(error, ApplyError::NewFileConflict { ref path } if path == "exists.txt"));

        let protected = "--- /dev/null\n+++ b/config/app.yaml\n@@ -0,0 +1 @@\n+y\n";
        let error = engine
            .apply(protected, dir.path(), ApplyOptions::default())
            .error
            .unwrap();
        assert_eq!(error.code(), "unsafe_new_file_conflict");
        assert!(error.escalation().is_some());
    }

    #[test]
    fn test_quality_rejection_leaves_tree_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
        let engine = PatchEngine::new(
            ScriptedTool::new(ApplyMode::ESCALATION.to_vec(), |_| {}),
            open_policy(),
        );

        let text = "--- a/notes.txt\n+++ b/notes.txt\n@@ -1,2 +1,2 @@\n alpha\n-beta\n+// ... existing code ...\n";
        let outcome = engine.apply(text, dir.path(), ApplyOptions::default());
        assert!(matches!(outcome.error, Some(ApplyError::Quality { .. })));
        assert!(engine.tool.calls.borrow().is_empty());
        assert!(!dir.path().join("temp_patch.diff").exists());
    }

    #[test]
    fn test_scope_and_workspace_violations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());

        let outcome = engine.apply(
            MODIFY,
            dir.path(),
            ApplyOptions {
                scope: Some(vec!["docs/".into()]),
                ..Default::default()
            },
        );
        let error = outcome.error.unwrap();
        assert_eq!(error.code(), "out_of_scope");
        assert!(error.to_string().contains("Outside scope: notes.txt"));

        let escape = "--- a/../outside.txt\n+++ b/../outside.txt\n@@ -1 +1 @@\n-a\n+b\n";
        let error = engine
            .apply(escape, dir.path(), ApplyOptions::default())
            .error
            .unwrap();
        assert_eq!(error.code(), "outside_workspace");
    }

    #[test]
    fn test_corruption_restores_backup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
        let tool = ScriptedTool::new(vec![ApplyMode::Strict], |ws| {
            fs::write(ws.join("notes.txt"), "").unwrap();
        });
        let engine = PatchEngine::new(tool, open_policy());

        let (ok, error) = engine
            .apply(MODIFY, dir.path(), ApplyOptions::default())
            .into_parts();
        assert!(!ok);
        let message = error.unwrap().to_string();
        assert!(message.contains("restored 1"), "{message}");
        assert_eq!(
            fs::read(dir.path().join("notes.txt")).unwrap(),
            b"alpha\nbeta\n"
        );
    }

    #[test]
    fn test_corruption_restores_only_corrupted_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        fs::write(dir.path().join("b.txt"), "b\n").unwrap();
        let tool = ScriptedTool::new(vec![ApplyMode::Strict], |ws| {
            fs::write(ws.join("a.txt"), "A\n").unwrap();
            fs::write(ws.join("b.txt"), "").unwrap();
        });
        let engine = PatchEngine::new(tool, open_policy());

        let text = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-a\n+A\n--- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-b\n+B\n";
        let error = engine
            .apply(text, dir.path(), ApplyOptions::default())
            .error
            .unwrap();

        match &error {
            ApplyError::Corrupted {
                paths,
                restored,
                failed,
                rolled_back,
            } => {
                assert_eq!(paths, &vec!["b.txt".to_string()]);
                assert_eq!((*restored, *failed, *rolled_back), (1, 0, false));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "A\n");
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), "b\n");
    }

    #[test]
    fn test_engine_files_are_always_protected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());

        let config = "--- /dev/null\n+++ b/patchgate.toml\n@@ -0,0 +1,2 @@\n+[policy]\n+protected = []\n";
        let options = ApplyOptions {
            internal_mode: true,
            extra_allowed: vec!["patchgate.toml".into()],
            ..Default::default()
        };
        let error = engine.apply(config, dir.path(), options).error.unwrap();
        assert_eq!(error.code(), "protected_path");
        assert_eq!(error.escalation().unwrap().paths, vec!["patchgate.toml"]);

        let debug = "--- /dev/null\n+++ b/last_patch_debug.diff\n@@ -0,0 +1 @@\n+x\n";
        let error = engine
            .apply(debug, dir.path(), ApplyOptions::default())
            .error
            .unwrap();
        assert_eq!(error.code(), "protected_path");
        assert!(engine.tool.calls.borrow().is_empty());
        assert!(!dir.path().join("patchgate.toml").exists());
    }

    #[test]
    fn test_overflowing_hunk_start_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());

        let text = format!(
            "--- a/notes.txt\n+++ b/notes.txt\n@@ -{max},2 +1,2 @@\n gamma\n-beta\n+BETA\n",
            max = usize::MAX
        );
        let outcome = engine.apply(&text, dir.path(), ApplyOptions::default());
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().code(), "diff_mode_patch_failed");
    }

    struct RecordingSavepoint {
        events: Vec<&'static str>,
        fail_create: bool,
    }

    impl Savepoint for RecordingSavepoint {
        fn create(&mut self, _: &Path, _: &str) -> Result<(), SavepointError> {
            if self.fail_create {
                return Err(SavepointError::NotCreated);
            }
            self.events.push("create");
            Ok(())
        }

        fn rollback(&mut self, _: &Path) -> Result<(), SavepointError> {
            self.events.push("rollback");
            Ok(())
        }

        fn release(&mut self, _: &Path) -> Result<(), SavepointError> {
            self.events.push("release");
            Ok(())
        }
    }

    #[test]
    fn test_savepoint_released_on_success_and_rolled_back_on_quality() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
        let tool = ScriptedTool::new(vec![ApplyMode::Strict], |ws| {
            fs::write(ws.join("notes.txt"), "alpha\nBETA\n").unwrap();
        });
        let engine = PatchEngine::new(tool, open_policy());

        let mut savepoint = RecordingSavepoint {
            events: Vec::new(),
            fail_create: false,
        };
        let outcome = engine.apply(
            MODIFY,
            dir.path(),
            ApplyOptions {
                savepoint: Some(&mut savepoint),
                ..Default::default()
            },
        );
        assert!(outcome.success);
        assert_eq!(savepoint.events, vec!["create", "release"]);

        let mut savepoint = RecordingSavepoint {
            events: Vec::new(),
            fail_create: false,
        };
        let bad = MODIFY.replace("+BETA", "+[truncated]");
        let outcome = engine.apply(
            &bad,
            dir.path(),
            ApplyOptions {
                savepoint: Some(&mut savepoint),
                ..Default::default()
            },
        );
        assert!(!outcome.success);
        assert_eq!(savepoint.events, vec!["create", "rollback"]);
    }

    #[test]
    fn test_savepoint_creation_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
        let tool = ScriptedTool::new(vec![ApplyMode::Strict], |ws| {
            fs::write(ws.join("notes.txt"), "alpha\nBETA\n").unwrap();
        });
        let engine = PatchEngine::new(tool, open_policy());

        let mut savepoint = RecordingSavepoint {
            events: Vec::new(),
            fail_create: true,
        };
        let outcome = engine.apply(
            MODIFY,
            dir.path(),
            ApplyOptions {
                savepoint: Some(&mut savepoint),
                ..Default::default()
            },
        );
        assert!(outcome.success);
        assert!(savepoint.events.is_empty());
    }

    #[test]
    fn test_synthetic_patch_checks_paths_only() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());

        let ok = format!("{NDJSON_MARKER}\n{{\"op\":\"write\",\"path\":\"docs/a.md\"}}\n");
        let outcome = engine.apply(&ok, dir.path(), ApplyOptions::default());
        assert!(outcome.success);
        assert!(engine.tool.calls.borrow().is_empty());

        let blocked = format!(
            "{NDJSON_MARKER}\n# reason: rotate credentials\n{{\"target\":\"config/db.yaml\"}}\n"
        );
        let error = engine
            .apply(&blocked, dir.path(), ApplyOptions::default())
            .error
            .unwrap();
        let payload = error.escalation().unwrap();
        assert_eq!(payload.paths, vec!["config/db.yaml"]);
        assert_eq!(
            payload.justification.as_deref(),
            Some("reason: rotate credentials")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_synthetic_patch_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let engine = PatchEngine::new(ScriptedTool::new(vec![], |_| {}), open_policy());

        let text = format!("{NDJSON_MARKER}\n{{\"path\":\"link/file.txt\"}}\n");
        let error = engine
            .apply(&text, dir.path(), ApplyOptions::default())
            .error
            .unwrap();
        assert_eq!(error.code(), "outside_workspace");
    }

    #[test]
    fn test_synthetic_paths_sources() {
        let text = format!(
            "{NDJSON_MARKER}\n{{\"file\":\".\\\\a\\\\b.txt\"}}\nnot json {{\n{{\"path\": 3}}\n--- a/c.txt\n+++ b/c.txt\n"
        );
        assert_eq!(synthetic_paths(&text), vec!["c.txt", "a/b.txt"]);
    }

    #[test]
    fn test_extract_justification() {
        let text = "Subject: fix login\nSummary:   handle empty password \n# ticket 42\n#nospace\ndiff --git a/x b/x\n";
        assert_eq!(
            extract_justification(text).as_deref(),
            Some("fix login\nhandle empty password\nticket 42")
        );
        assert_eq!(extract_justification("diff --git a/x b/x\n"), None);
    }

    #[test]
    fn test_protected_payload_serializes() {
        let payload = ProtectedPathError {
            paths: vec!["config/app.yaml".into()],
            justification: None,
            violations: vec!["Protected path: config/app.yaml".into()],
        };
        let json: serde_json::Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();
        assert_eq!(json["paths"][0], "config/app.yaml");
        assert!(json["justification"].is_null());
    }
}
