//! Lenient unified-diff parser.
//!
//! The parser never fails. It walks an immutable line array with an index
//! cursor and peeks ahead where a line's role depends on what follows it.
//! Generator defects are absorbed while parsing:
//!
//! - hunk lines without a prefix become Additions in new files, Deletions
//!   in deleted files and Context elsewhere;
//! - blank lines inside a hunk become empty Context (empty Additions in new
//!   files), while trailing blank lines at the end of a hunk are dropped;
//! - garbled `@@` headers are kept with best-effort ranges.

use super::{FileKind, FileSection, Hunk, HunkHeader, HunkLine, Patch};

/// Parse diff text into a [`Patch`]. Line endings are normalized first.
pub fn parse(text: &str) -> Patch {
    let normalized = normalize_line_endings(text);
    let lines: Vec<&str> = normalized.lines().collect();
    Cursor::new(&lines).parse_patch()
}

/// CRLF and lone CR become LF.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

struct Cursor<'a> {
    lines: &'a [&'a str],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(lines: &'a [&'a str]) -> Self {
        Self { lines, pos: 0 }
    }

    fn peek(&self) -> Option<&'a str> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<&'a str> {
        self.lines.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<&'a str> {
        let line = self.peek()?;
        self.pos += 1;
        Some(line)
    }

    /// `diff --git`, or a `---`/`+++` pair.
    ///
    /// Inside a hunk body a `--- `/`+++ ` pair may just be a deleted line
    /// followed by an added one, so `in_hunk` additionally requires the pair
    /// to be followed by a hunk header.
    fn at_section_start(&self, in_hunk: bool) -> bool {
        match self.peek() {
            Some(line) if line.starts_with("diff --git ") => true,
            Some(line) if line.starts_with("--- ") => {
                let paired = self.peek_at(1).is_some_and(|l| l.starts_with("+++ "));
                if !in_hunk {
                    return paired;
                }
                paired
                    && self
                        .peek_at(2)
                        .map_or(true, |l| l.starts_with("@@") || l.starts_with("diff --git "))
            }
            _ => false,
        }
    }

    fn parse_patch(mut self) -> Patch {
        let mut patch = Patch::default();

        while let Some(line) = self.peek() {
            if self.at_section_start(false) {
                break;
            }
            patch.preamble.push(line.to_string());
            self.pos += 1;
        }

        while self.peek().is_some() {
            let start = self.pos;
            patch.sections.push(self.parse_section());
            if self.pos == start {
                // Unreachable in practice; guarantees progress.
                self.pos += 1;
            }
        }

        patch
    }

    fn parse_section(&mut self) -> FileSection {
        let mut section = FileSection::default();

        if let Some(line) = self.peek().filter(|l| l.starts_with("diff --git ")) {
            section.diff_line = Some(line.to_string());
            self.pos += 1;

            while let Some(line) = self.peek() {
                if line.starts_with("diff --git ")
                    || line.starts_with("--- ")
                    || line.starts_with("+++ ")
                    || line.starts_with("@@")
                {
                    break;
                }
                section.extended.push(line.to_string());
                self.pos += 1;
            }
        }

        if let Some(line) = self.peek().filter(|l| l.starts_with("--- ")) {
            section.old_header = Some(line.to_string());
            self.pos += 1;
        }
        if let Some(line) = self.peek().filter(|l| l.starts_with("+++ ")) {
            section.new_header = Some(line.to_string());
            self.pos += 1;
        }

        let kind = section.kind();
        while let Some(line) = self.peek() {
            if line.starts_with("@@") {
                let hunk = self.parse_hunk(kind);
                section.hunks.push(hunk);
                continue;
            }
            if self.at_section_start(false) {
                break;
            }
            if section.hunks.is_empty() {
                section.loose.push(line.to_string());
            }
            self.pos += 1;
        }

        section
    }

    fn parse_hunk(&mut self, kind: FileKind) -> Hunk {
        let header = HunkHeader::parse(self.bump().unwrap_or("@@"));
        let mut lines = Vec::new();
        let mut pending_blank = 0usize;

        while let Some(line) = self.peek() {
            if line.starts_with("@@") || self.at_section_start(true) {
                break;
            }
            self.pos += 1;

            if line.is_empty() {
                pending_blank += 1;
                continue;
            }
            for _ in 0..pending_blank {
                lines.push(blank_line(kind));
            }
            pending_blank = 0;
            lines.push(classify(line, kind));
        }

        Hunk { header, lines }
    }
}

fn blank_line(kind: FileKind) -> HunkLine {
    match kind {
        FileKind::New => HunkLine::Addition(String::new()),
        _ => HunkLine::Context(String::new()),
    }
}

fn classify(line: &str, kind: FileKind) -> HunkLine {
    let rest = || line[1..].to_string();
    match line.chars().next() {
        Some('+') => HunkLine::Addition(rest()),
        Some('-') => HunkLine::Deletion(rest()),
        Some(' ') => HunkLine::Context(rest()),
        Some('\\') => HunkLine::NoNewline(rest()),
        _ => match kind {
            FileKind::New => HunkLine::Addition(line.to_string()),
            FileKind::Deleted => HunkLine::Deletion(line.to_string()),
            FileKind::Modified => HunkLine::Context(line.to_string()),
        },
    }
}
