//! Best-effort repair of generator-produced diffs.
//!
//! [`sanitize`] is pure: it normalizes line endings, synthesizes missing
//! `--- /dev/null` / `+++ b/<path>` headers for new files, restores missing
//! line prefixes (see [`super::parser`]) and recomputes hunk counts.
//! [`repair_hunk_headers`] additionally reads the target files to move hunks
//! whose declared start line no longer matches the file.
//!
//! Neither function fails. Input that cannot be repaired comes back
//! unchanged apart from normalization and is rejected later by validation.

use super::{FileKind, FileSection, Hunk, HunkLine, Patch, DEV_NULL};
use std::fs;
use std::path::{Component, Path};
use tracing::debug;

/// Normalize raw patch text without touching the filesystem.
pub fn sanitize(raw: &str) -> String {
    let mut patch = super::parse(raw);
    ensure_new_file_headers(&mut patch);
    recount_hunks(&mut patch);
    patch.render()
}

/// Recompute hunk counts and, when `workspace` is given, recover the real
/// start line of hunks in existing files.
pub fn repair_hunk_headers(text: &str, workspace: Option<&Path>) -> String {
    let mut patch = super::parse(text);
    recount_hunks(&mut patch);
    if let Some(workspace) = workspace {
        relocate_hunks(&mut patch, workspace);
    }
    patch.render()
}

/// Add the `---`/`+++` pair to `new file mode` sections that lack it.
pub fn ensure_new_file_headers(patch: &mut Patch) {
    for section in &mut patch.sections {
        if !section.has_extended("new file mode") {
            continue;
        }
        let Some((_, new_path)) = section.git_paths() else {
            continue;
        };
        if section.old_header.is_none() {
            section.old_header = Some(format!("--- {DEV_NULL}"));
        }
        if section.new_header.is_none() {
            debug!(path = %new_path, "synthesized new-file header");
            section.new_header = Some(format!("+++ b/{new_path}"));
        }
    }
}

/// Make every hunk header agree with its body.
///
/// New files get `-0,0 +1,n`. Context lines cannot exist in a new file, so
/// they are turned into additions first.
pub fn recount_hunks(patch: &mut Patch) {
    for section in &mut patch.sections {
        let kind = section.kind();
        for hunk in &mut section.hunks {
            if kind == FileKind::New {
                for line in &mut hunk.lines {
                    if let HunkLine::Context(text) = line {
                        *line = HunkLine::Addition(std::mem::take(text));
                    }
                }
            }

            let (old_count, new_count) = hunk.body_counts();
            hunk.header.old.set_count(old_count);
            hunk.header.new.set_count(new_count);

            if kind == FileKind::New {
                hunk.header.old.start = 0;
                hunk.header.old.set_count(0);
                hunk.header.old.implicit_count = false;
                hunk.header.new.start = 1;
            }
        }
    }
}

/// Move hunks of existing files to where their context actually is.
///
/// A hunk whose old side already matches at its declared start is left
/// alone. Otherwise the first context line is searched for (exact, then
/// trimmed), preferring the occurrence nearest the declared start, and both
/// ranges are shifted by the same offset. Unreadable files keep their
/// declared starts.
pub fn relocate_hunks(patch: &mut Patch, workspace: &Path) {
    for section in &mut patch.sections {
        if section.kind() == FileKind::New {
            continue;
        }
        let Some(path) = section.old_path().filter(|p| stays_inside(p)) else {
            continue;
        };
        let Ok(content) = fs::read_to_string(workspace.join(&path)) else {
            debug!(path = %path, "target unreadable, keeping declared hunk starts");
            continue;
        };
        let file_lines: Vec<&str> = content.lines().collect();
        relocate_section(section, &file_lines, &path);
    }
}

fn stays_inside(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn relocate_section(section: &mut FileSection, file_lines: &[&str], path: &str) {
    for hunk in &mut section.hunks {
        let old_side: Vec<&str> = hunk.old_side().collect();
        if old_side.is_empty() || matches_at(file_lines, hunk.header.old.start, &old_side) {
            continue;
        }
        let Some(start) = find_start(hunk, file_lines) else {
            continue;
        };
        let declared = hunk.header.old.start;
        if start == declared {
            continue;
        }

        let floor = usize::from(hunk.header.new.count > 0);
        let new_start = if start >= declared {
            hunk.header.new.start.checked_add(start - declared)
        } else {
            Some(hunk.header.new.start.saturating_sub(declared - start))
        };
        let Some(new_start) = new_start.map(|n| n.max(floor)) else {
            continue;
        };

        debug!(
            path = %path,
            declared,
            recovered = start,
            "relocated hunk start"
        );
        hunk.header.old.start = start;
        hunk.header.new.start = new_start;
    }
}

/// Whether `expected` appears in `file_lines` starting at 1-based `start`.
fn matches_at(file_lines: &[&str], start: usize, expected: &[&str]) -> bool {
    if start == 0 {
        return false;
    }
    let begin = start - 1;
    let Some(end) = begin.checked_add(expected.len()) else {
        return false;
    };
    file_lines
        .get(begin..end)
        .is_some_and(|window| window == expected)
}

/// 1-based old start implied by locating the hunk's first context line.
fn find_start(hunk: &Hunk, file_lines: &[&str]) -> Option<usize> {
    // Old-side lines that precede the anchor shift the start upward.
    let mut offset = 0usize;
    let mut anchor = None;
    for line in &hunk.lines {
        match line {
            HunkLine::Context(text) => {
                anchor = Some(text.as_str());
                break;
            }
            HunkLine::Deletion(_) => offset += 1,
            _ => {}
        }
    }
    let anchor = anchor?;
    let target = hunk.header.old.start.saturating_add(offset).saturating_sub(1);

    let nearest = |candidates: Vec<usize>| {
        candidates
            .into_iter()
            .filter(|&idx| idx >= offset)
            .min_by_key(|&idx| idx.abs_diff(target))
    };

    let exact: Vec<usize> = positions(file_lines, |line| line == anchor);
    let found = nearest(exact).or_else(|| {
        let trimmed = anchor.trim();
        if trimmed.is_empty() {
            return None;
        }
        nearest(positions(file_lines, |line| line.trim() == trimmed))
    })?;

    Some(found - offset + 1)
}

fn positions(file_lines: &[&str], pred: impl Fn(&str) -> bool) -> Vec<usize> {
    file_lines
        .iter()
        .enumerate()
        .filter(|(_, line)| pred(line))
        .map(|(idx, _)| idx)
        .collect()
}
