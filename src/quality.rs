//! Pre- and post-apply quality gates, plus the backup set used for rollback.
//!
//! [`validate_patch_quality`] is fatal: any issue rejects the attempt.
//! [`validate_context`] and [`validate_content_changes`] are advisory and only
//! feed warnings. [`validate_applied_files`] is the authoritative
//! post-apply corruption check that triggers a restore.

use crate::fs_util::{atomic_write, remove_if_exists};
use crate::patch::{self, FileKind, HunkLine, Patch};
use crate::policy::normalize_path;
use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

#[derive(Error, Debug)]
pub enum QualityError {
    #[error("Failed to back up {path}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Markers generators leave behind when they elide part of a file.
const TRUNCATION_MARKERS: &[&str] = &[
    "... (truncated)",
    "[truncated]",
    "<truncated>",
    "rest of file unchanged",
    "rest of the file unchanged",
    "rest of file remains unchanged",
    "... existing code ...",
    "... remaining code ...",
];

fn is_truncation_marker(line: &str) -> bool {
    let lower = line.to_lowercase();
    TRUNCATION_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn is_conflict_marker(line: &str) -> bool {
    line.starts_with("<<<<<<< ")
        || line == "<<<<<<<"
        || line.starts_with(">>>>>>> ")
        || line == ">>>>>>>"
        || line == "======="
}

/// Structural defects that make a patch unsafe to apply.
///
/// Works on the raw text so that headers the sanitizer would paper over
/// (no range at all) are still visible.
pub fn validate_patch_quality(text: &str) -> Vec<String> {
    let parsed = patch::parse(text);
    let mut issues = Vec::new();

    if parsed.sections.is_empty() {
        if !text.trim().is_empty() {
            issues.push("Patch contains no file sections".to_string());
        }
        return issues;
    }

    for section in &parsed.sections {
        let label = section.path().unwrap_or_else(|| "<unknown>".to_string());

        if section.hunks.is_empty() && !is_headers_only_section(section) {
            issues.push(format!("File section for {label} has no hunks"));
        }

        for (idx, hunk) in section.hunks.iter().enumerate() {
            let ordinal = idx + 1;
            if !hunk.header.ranged {
                issues.push(format!(
                    "Malformed hunk header in {label} (hunk {ordinal}): {}",
                    hunk.header
                ));
            }
            if hunk.lines.is_empty() {
                issues.push(format!("Empty hunk in {label} (hunk {ordinal})"));
            }
            for line in hunk.additions() {
                if is_truncation_marker(line) {
                    issues.push(format!(
                        "Truncation marker in {label} (hunk {ordinal}): {}",
                        line.trim()
                    ));
                } else if is_conflict_marker(line) {
                    issues.push(format!(
                        "Merge conflict marker in {label} (hunk {ordinal}): {}",
                        line.trim()
                    ));
                }
            }
        }
    }

    issues
}

/// Sections that legitimately carry no hunks: mode changes, renames,
/// binary stubs, and empty new or deleted files.
fn is_headers_only_section(section: &patch::FileSection) -> bool {
    const PURE: &[&str] = &[
        "old mode",
        "new mode",
        "rename from",
        "rename to",
        "copy from",
        "copy to",
        "similarity index",
        "new file mode",
        "deleted file mode",
        "Binary files",
        "GIT binary patch",
    ];
    PURE.iter().any(|prefix| section.has_extended(prefix))
}

/// Advisory: hunks of existing files whose context cannot be found.
pub fn validate_context(workspace: &Path, patch: &Patch) -> Vec<String> {
    let mut warnings = Vec::new();

    for section in &patch.sections {
        if section.kind() != FileKind::Modified {
            continue;
        }
        let Some(path) = section.old_path() else {
            continue;
        };
        let Ok(content) = fs::read_to_string(workspace.join(&path)) else {
            warnings.push(format!("Cannot read {path} to verify hunk context"));
            continue;
        };
        let file_lines: Vec<&str> = content.lines().map(str::trim).collect();
        let present: HashSet<&str> = file_lines.iter().copied().collect();

        for hunk in &section.hunks {
            let missing = hunk.lines.iter().find_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Deletion(text) => {
                    let trimmed = text.trim();
                    (!trimmed.is_empty() && !present.contains(trimmed)).then_some(trimmed)
                }
                _ => None,
            });
            let Some(missing) = missing else {
                continue;
            };

            let mut message = format!(
                "Context not found in {path} near line {}: '{missing}'",
                hunk.header.old.start
            );
            if let Some(closest) = closest_line(&file_lines, missing) {
                message.push_str(&format!(" (closest: '{closest}')"));
            }
            warnings.push(message);
        }
    }

    warnings
}

fn closest_line<'a>(file_lines: &[&'a str], wanted: &str) -> Option<&'a str> {
    file_lines
        .iter()
        .filter(|line| !line.is_empty())
        .map(|line| (*line, strsim::normalized_levenshtein(line, wanted)))
        .filter(|(_, score)| *score >= 0.8)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(line, _)| line)
}

/// Pre-apply snapshot of one declared path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub content: Vec<u8>,
    pub existed: bool,
    /// xxh3 of `content`.
    pub digest: u64,
}

impl BackupEntry {
    pub fn captured(content: Vec<u8>) -> Self {
        Self {
            digest: xxh3_64(&content),
            content,
            existed: true,
        }
    }

    pub fn missing() -> Self {
        Self {
            content: Vec::new(),
            existed: false,
            digest: xxh3_64(&[]),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupSet {
    entries: BTreeMap<String, BackupEntry>,
}

impl BackupSet {
    pub fn get(&self, path: &str) -> Option<&BackupEntry> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: BackupEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BackupEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Snapshot every declared path before mutation.
pub fn backup_files<S: AsRef<str>>(
    workspace: &Path,
    paths: &[S],
) -> Result<BackupSet, QualityError> {
    let mut set = BackupSet::default();
    for path in paths {
        let path = path.as_ref();
        let absolute = workspace.join(path);
        let entry = match fs::read(&absolute) {
            Ok(content) => BackupEntry::captured(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BackupEntry::missing(),
            Err(source) => {
                return Err(QualityError::Backup {
                    path: absolute,
                    source,
                })
            }
        };
        set.insert(path, entry);
    }
    debug!(files = set.len(), "captured backups");
    Ok(set)
}

/// Put a file back the way [`backup_files`] found it.
pub fn restore_file(workspace: &Path, path: &str, entry: &BackupEntry) -> bool {
    let absolute = workspace.join(path);

    if !entry.existed {
        return match remove_if_exists(&absolute) {
            Ok(_) => true,
            Err(e) => {
                warn!(path = %path, error = %e, "failed to remove file created by patch");
                false
            }
        };
    }

    if let Ok(current) = fs::read(&absolute) {
        if xxh3_64(&current) == entry.digest {
            debug!(path = %path, "content unchanged, skipping restore");
            return true;
        }
    }

    match atomic_write(&absolute, &entry.content) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path, error = %e, "failed to restore backup");
            false
        }
    }
}

/// What a target should look like after the patch landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExpectation {
    pub path: String,
    pub should_exist: bool,
    /// The file must hold non-whitespace content.
    pub expect_content: bool,
}

impl FileExpectation {
    /// Derive expectations from a sanitized patch.
    pub fn from_patch(patch: &Patch) -> Vec<Self> {
        let mut expectations: Vec<Self> = Vec::new();
        for section in &patch.sections {
            let Some(path) = section.path().map(|p| normalize_path(&p)) else {
                continue;
            };
            let expectation = match section.kind() {
                FileKind::Deleted => Self {
                    path,
                    should_exist: false,
                    expect_content: false,
                },
                FileKind::New => Self {
                    expect_content: !section.new_file_content().trim().is_empty(),
                    path,
                    should_exist: true,
                },
                FileKind::Modified => Self {
                    expect_content: section.hunks.iter().any(|hunk| {
                        hunk.lines.iter().any(|line| match line {
                            HunkLine::Context(t) | HunkLine::Addition(t) => !t.trim().is_empty(),
                            _ => false,
                        })
                    }),
                    path,
                    should_exist: true,
                },
            };
            if !expectations.iter().any(|e| e.path == expectation.path) {
                expectations.push(expectation);
            }
        }
        expectations
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedFilesCheck {
    pub all_valid: bool,
    pub corrupted: Vec<CorruptedFile>,
}

/// Authoritative post-apply check.
pub fn validate_applied_files(
    workspace: &Path,
    expectations: &[FileExpectation],
) -> AppliedFilesCheck {
    let mut corrupted = Vec::new();
    let mut flag = |path: &str, reason: &str| {
        corrupted.push(CorruptedFile {
            path: path.to_string(),
            reason: reason.to_string(),
        })
    };

    for expectation in expectations {
        let path = expectation.path.as_str();
        let absolute = workspace.join(path);
        let exists = absolute.is_file();

        if !expectation.should_exist {
            if exists {
                flag(path, "file should have been deleted");
            }
            continue;
        }
        if !exists {
            flag(path, "file is missing after apply");
            continue;
        }

        let content = match fs::read(&absolute) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                flag(path, &format!("unreadable after apply: {e}"));
                continue;
            }
        };
        if expectation.expect_content && content.trim().is_empty() {
            flag(path, "file is empty but should have content");
        } else if has_conflict_markers(&content) {
            flag(path, "file contains merge conflict markers");
        }
    }

    AppliedFilesCheck {
        all_valid: corrupted.is_empty(),
        corrupted,
    }
}

fn has_conflict_markers(content: &str) -> bool {
    let mut open = false;
    for line in content.lines() {
        if line.starts_with("<<<<<<<") {
            open = true;
        } else if open && line.starts_with(">>>>>>>") {
            return true;
        }
    }
    false
}

/// Thresholds for the advisory content heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// New size below `old * shrink_ratio` is suspicious.
    pub shrink_ratio: f64,
    /// New size above `old * growth_ratio` is suspicious.
    pub growth_ratio: f64,
    /// Minimum line similarity between old and new content.
    pub min_similarity: f64,
    /// Fraction of top-level definitions that may disappear.
    pub symbol_loss_ratio: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            shrink_ratio: 0.5,
            growth_ratio: 5.0,
            min_similarity: 0.2,
            symbol_loss_ratio: 0.5,
        }
    }
}

/// Files below this size are too small for ratio heuristics.
const MIN_HEURISTIC_BYTES: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentCheckOutcome {
    pub ok: bool,
    pub problems: Vec<String>,
}

/// Advisory: compare modified files against their backups.
pub fn validate_content_changes<S: AsRef<str>>(
    workspace: &Path,
    paths: &[S],
    backups: &BackupSet,
    thresholds: &QualityThresholds,
) -> ContentCheckOutcome {
    let mut problems = Vec::new();

    for path in paths {
        let path = path.as_ref();
        let Some(entry) = backups.get(path).filter(|e| e.existed) else {
            continue;
        };
        let Ok(after) = fs::read(workspace.join(path)) else {
            continue;
        };
        if xxh3_64(&after) == entry.digest {
            continue;
        }
        let before = String::from_utf8_lossy(&entry.content);
        let after = String::from_utf8_lossy(&after);
        problems.extend(
            compare_contents(&before, &after, thresholds)
                .into_iter()
                .map(|problem| format!("{path}: {problem}")),
        );
    }

    ContentCheckOutcome {
        ok: problems.is_empty(),
        problems,
    }
}

fn compare_contents(before: &str, after: &str, thresholds: &QualityThresholds) -> Vec<String> {
    let mut problems = Vec::new();
    let (old_len, new_len) = (before.len(), after.len());
    if old_len < MIN_HEURISTIC_BYTES {
        return problems;
    }

    if (new_len as f64) < old_len as f64 * thresholds.shrink_ratio {
        problems.push(format!("shrank from {old_len} to {new_len} bytes"));
    }
    if (new_len as f64) > old_len as f64 * thresholds.growth_ratio {
        problems.push(format!("grew from {old_len} to {new_len} bytes"));
    }

    let similarity = f64::from(TextDiff::from_lines(before, after).ratio());
    if similarity < thresholds.min_similarity {
        problems.push(format!("only {:.0}% similar to original", similarity * 100.0));
    }

    let old_symbols = top_level_symbols(before);
    if old_symbols.len() >= 3 {
        let new_symbols = top_level_symbols(after);
        let lost = old_symbols.difference(&new_symbols).count();
        let ratio = lost as f64 / old_symbols.len() as f64;
        if ratio > thresholds.symbol_loss_ratio {
            problems.push(format!(
                "lost {lost} of {} top-level definitions",
                old_symbols.len()
            ));
        }
    }

    problems
}

fn symbol_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?m)^(?:pub(?:\([^)]*\))?\s+)?(?:export\s+)?(?:async\s+)?(?:fn|struct|enum|trait|mod|class|def|function|interface|type)\s+([A-Za-z_][A-Za-z0-9_]*)",
            )
            .ok()
        })
        .as_ref()
}

fn top_level_symbols(content: &str) -> HashSet<String> {
    let Some(pattern) = symbol_pattern() else {
        return HashSet::new();
    };
    pattern
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_patch_has_no_issues() {
        let text = "--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-a\n+b\n";
        assert!(validate_patch_quality(text).is_empty());
        assert!(validate_patch_quality("").is_empty());
    }

    #[test]
    fn test_truncation_and_conflict_markers() {
        let text = "\
--- a/app.py
+++ b/app.py
@@ -1,2 +1,3 @@
 import os
+# ... existing code ...
+<<<<<<< HEAD
-print(1)
";
        let issues = validate_patch_quality(text);
        assert_eq!(issues.len(), 2, "{issues:?}");
        assert!(issues[0].starts_with("Truncation marker in app.py"));
        assert!(issues[1].starts_with("Merge conflict marker in app.py"));
    }

    #[test]
    fn test_structural_issues() {
        assert_eq!(
            validate_patch_quality("just some prose\n"),
            vec!["Patch contains no file sections"]
        );

        let no_range = "--- a/x\n+++ b/x\n@@\n+a\n";
        let issues = validate_patch_quality(no_range);
        assert!(issues[0].starts_with("Malformed hunk header in x"));

        let empty_hunk = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n\n";
        assert_eq!(
            validate_patch_quality(empty_hunk),
            vec!["Empty hunk in x (hunk 1)"]
        );

        let no_hunks = "diff --git a/x b/x\nindex 1..2 100644\n--- a/x\n+++ b/x\n";
        assert_eq!(
            validate_patch_quality(no_hunks),
            vec!["File section for x has no hunks"]
        );
    }

    #[test]
    fn test_headers_only_sections_pass() {
        let rename = "diff --git a/old.rs b/new.rs\nsimilarity index 100%\nrename from old.rs\nrename to new.rs\n";
        assert!(validate_patch_quality(rename).is_empty());

        let empty_new = "diff --git a/e.txt b/e.txt\nnew file mode 100644\nindex 0000000..e69de29\n";
        assert!(validate_patch_quality(empty_new).is_empty());
    }

    #[test]
    fn test_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path();
        fs::write(ws.join("keep.txt"), "original\n").unwrap();

        let backups = backup_files(ws, &["keep.txt", "created.txt"]).unwrap();
        assert_eq!(backups.len(), 2);
        assert!(backups.get("keep.txt").unwrap().existed);
        assert!(!backups.get("created.txt").unwrap().existed);

        fs::write(ws.join("keep.txt"), "").unwrap();
        fs::write(ws.join("created.txt"), "new").unwrap();

        for (path, entry) in backups.iter() {
            assert!(restore_file(ws, path, entry));
        }
        assert_eq!(fs::read(ws.join("keep.txt")).unwrap(), b"original\n");
        assert!(!ws.join("created.txt").exists());
    }

    #[test]
    fn test_restore_recreates_deleted_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path();
        fs::create_dir_all(ws.join("a/b")).unwrap();
        fs::write(ws.join("a/b/c.txt"), "data").unwrap();

        let backups = backup_files(ws, &["a/b/c.txt"]).unwrap();
        fs::remove_dir_all(ws.join("a")).unwrap();

        assert!(restore_file(ws, "a/b/c.txt", backups.get("a/b/c.txt").unwrap()));
        assert_eq!(fs::read_to_string(ws.join("a/b/c.txt")).unwrap(), "data");
    }

    #[test]
    fn test_validate_applied_files() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path();
        fs::write(ws.join("empty.txt"), "  \n").unwrap();
        fs::write(ws.join("conflict.txt"), "<<<<<<< ours\na\n=======\nb\n>>>>>>> theirs\n").unwrap();
        fs::write(ws.join("deleted.txt"), "still here").unwrap();
        fs::write(ws.join("fine.txt"), "ok").unwrap();

        let expect = |path: &str, should_exist: bool, expect_content: bool| FileExpectation {
            path: path.to_string(),
            should_exist,
            expect_content,
        };
        let check = validate_applied_files(
            ws,
            &[
                expect("empty.txt", true, true),
                expect("conflict.txt", true, true),
                expect("deleted.txt", false, false),
                expect("missing.txt", true, false),
                expect("fine.txt", true, true),
            ],
        );

        assert!(!check.all_valid);
        let paths: Vec<&str> = check.corrupted.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["empty.txt", "conflict.txt", "deleted.txt", "missing.txt"]
        );
    }

    #[test]
    fn test_expectations_from_patch() {
        let text = "\
diff --git a/new.txt b/new.txt
new file mode 100644
--- /dev/null
+++ b/new.txt
@@ -0,0 +1 @@
+hello
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
";
        let expectations = FileExpectation::from_patch(&patch::parse(text));
        assert_eq!(
            expectations,
            vec![
                FileExpectation {
                    path: "new.txt".into(),
                    should_exist: true,
                    expect_content: true,
                },
                FileExpectation {
                    path: "gone.txt".into(),
                    should_exist: false,
                    expect_content: false,
                },
            ]
        );
    }

    #[test]
    fn test_validate_context_reports_missing_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.rs"), "fn main() {\n    run();\n}\n").unwrap();

        let ok = patch::parse("--- a/f.rs\n+++ b/f.rs\n@@ -1,2 +1,2 @@\n fn main() {\n-    run();\n+    go();\n");
        assert!(validate_context(dir.path(), &ok).is_empty());

        let stale = patch::parse("--- a/f.rs\n+++ b/f.rs\n@@ -1,2 +1,2 @@\n fn main() {\n-    run2();\n+    go();\n");
        let warnings = validate_context(dir.path(), &stale);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("run2();"));
        assert!(warnings[0].contains("closest: 'run();'"));
    }

    #[test]
    fn test_content_heuristics() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path();
        let original: String = (0..20)
            .map(|i| format!("fn handler_{i}() {{\n    work({i});\n}}\n"))
            .collect();
        fs::write(ws.join("lib.rs"), &original).unwrap();
        let backups = backup_files(ws, &["lib.rs"]).unwrap();

        fs::write(ws.join("lib.rs"), "fn only() {}\n").unwrap();
        let outcome = validate_content_changes(ws, &["lib.rs"], &backups, &QualityThresholds::default());
        assert!(!outcome.ok);
        assert!(outcome.problems.iter().any(|p| p.contains("shrank")));
        assert!(outcome.problems.iter().any(|p| p.contains("top-level definitions")));

        let tweaked = original.replace("work(3)", "work(33)");
        fs::write(ws.join("lib.rs"), tweaked).unwrap();
        let outcome = validate_content_changes(ws, &["lib.rs"], &backups, &QualityThresholds::default());
        assert!(outcome.ok, "{:?}", outcome.problems);
    }
}
