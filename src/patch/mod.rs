//! Typed model of a unified diff.
//!
//! Raw generator output is parsed once into a [`Patch`] (file sections,
//! hunks, hunk lines) by a cursor over an immutable line array. Every repair
//! pass in [`sanitize`] operates on this tree and re-serializes it with
//! [`Patch::render`], which is lossless for well-formed input.

pub mod parser;
pub mod sanitize;

pub use parser::parse;
pub use sanitize::{repair_hunk_headers, sanitize};

use std::fmt;

pub const DEV_NULL: &str = "/dev/null";

/// Classification of a file section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    New,
    Modified,
    Deleted,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::New => write!(f, "new"),
            FileKind::Modified => write!(f, "modified"),
            FileKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// One side of a hunk range: `start,count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: usize,
    pub count: usize,
    /// The count was omitted in the source header (`-5` meaning `-5,1`).
    pub implicit_count: bool,
}

impl LineRange {
    pub fn new(start: usize, count: usize) -> Self {
        Self {
            start,
            count,
            implicit_count: false,
        }
    }

    /// Update the count, dropping the implicit form unless it still holds.
    pub fn set_count(&mut self, count: usize) {
        if count != 1 {
            self.implicit_count = false;
        }
        self.count = count;
    }

    fn parse(token: &str) -> Option<Self> {
        match token.split_once(',') {
            Some((start, count)) => Some(Self {
                start: start.trim().parse().ok()?,
                count: count.trim().parse().ok()?,
                implicit_count: false,
            }),
            None => Some(Self {
                start: token.trim().parse().ok()?,
                count: 1,
                implicit_count: true,
            }),
        }
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.implicit_count && self.count == 1 {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{},{}", self.start, self.count)
        }
    }
}

/// Parsed `@@ -o,c +n,c @@ trailer` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkHeader {
    pub old: LineRange,
    pub new: LineRange,
    /// Everything after the closing `@@`, including its leading space.
    pub trailer: String,
    /// Both ranges and the closing `@@` were present and numeric.
    pub well_formed: bool,
    /// At least one numeric range was present.
    pub ranged: bool,
}

impl HunkHeader {
    /// Parse a header line leniently. Missing or garbled ranges fall back to
    /// `1,0` and clear [`HunkHeader::well_formed`]; counts get recomputed by
    /// the sanitizer either way.
    pub fn parse(line: &str) -> Self {
        let rest = line.trim_start_matches('@').trim_start();
        let (ranges, trailer, closed) = match rest.find("@@") {
            Some(idx) => (
                &rest[..idx],
                rest[idx..].trim_start_matches('@').to_string(),
                true,
            ),
            None => (rest, String::new(), false),
        };

        let mut old = None;
        let mut new = None;
        for token in ranges.split_whitespace() {
            if let Some(value) = token.strip_prefix('-') {
                old = LineRange::parse(value);
            } else if let Some(value) = token.strip_prefix('+') {
                new = LineRange::parse(value);
            }
        }

        Self {
            well_formed: closed && old.is_some() && new.is_some(),
            ranged: old.is_some() || new.is_some(),
            old: old.unwrap_or(LineRange::new(1, 0)),
            new: new.unwrap_or(LineRange::new(1, 0)),
            trailer,
        }
    }
}

impl fmt::Display for HunkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@@ -{} +{} @@{}", self.old, self.new, self.trailer)
    }
}

/// A single line inside a hunk body, without its prefix character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Addition(String),
    Deletion(String),
    /// `\ No newline at end of file`; holds the text after the backslash.
    NoNewline(String),
}

impl HunkLine {
    pub fn text(&self) -> &str {
        match self {
            HunkLine::Context(t)
            | HunkLine::Addition(t)
            | HunkLine::Deletion(t)
            | HunkLine::NoNewline(t) => t,
        }
    }

    fn prefix(&self) -> char {
        match self {
            HunkLine::Context(_) => ' ',
            HunkLine::Addition(_) => '+',
            HunkLine::Deletion(_) => '-',
            HunkLine::NoNewline(_) => '\\',
        }
    }
}

impl fmt::Display for HunkLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix(), self.text())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub header: HunkHeader,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// `(old_count, new_count)` as implied by the body.
    pub fn body_counts(&self) -> (usize, usize) {
        self.lines
            .iter()
            .fold((0, 0), |(old, new), line| match line {
                HunkLine::Context(_) => (old + 1, new + 1),
                HunkLine::Deletion(_) => (old + 1, new),
                HunkLine::Addition(_) => (old, new + 1),
                HunkLine::NoNewline(_) => (old, new),
            })
    }

    /// Whether the header counts agree with the body.
    pub fn is_consistent(&self) -> bool {
        self.body_counts() == (self.header.old.count, self.header.new.count)
    }

    /// Lines the hunk expects to find in the original file.
    pub fn old_side(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            HunkLine::Context(t) | HunkLine::Deletion(t) => Some(t.as_str()),
            _ => None,
        })
    }

    pub fn additions(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            HunkLine::Addition(t) => Some(t.as_str()),
            _ => None,
        })
    }
}

/// Everything belonging to one file: `diff --git` line, extended headers,
/// `---`/`+++` pair and hunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSection {
    pub diff_line: Option<String>,
    /// `new file mode`, `index`, `rename from`, ... in source order.
    pub extended: Vec<String>,
    pub old_header: Option<String>,
    pub new_header: Option<String>,
    /// Lines between the file headers and the first hunk that belong to
    /// neither.
    pub loose: Vec<String>,
    pub hunks: Vec<Hunk>,
}

impl FileSection {
    /// Paths from the `diff --git <old> <new>` line, leading component
    /// stripped from each side.
    ///
    /// Unquoted names may contain spaces, so the split is taken where both
    /// sides name the same file, falling back to the last ` b/`.
    pub fn git_paths(&self) -> Option<(String, String)> {
        let rest = self.diff_line.as_deref()?.strip_prefix("diff --git ")?;
        let rest = rest.trim();

        if rest.starts_with('"') {
            let (old, tail) = unquote_name(rest)?;
            let new = parse_name(tail.trim_start())?;
            return Some((strip_component(&old), strip_component(&new)));
        }

        let same_name = rest.match_indices(' ').find_map(|(idx, _)| {
            let old = strip_component(&rest[..idx]);
            (old == strip_component(&rest[idx + 1..])).then_some(old)
        });
        if let Some(name) = same_name {
            return Some((name.clone(), name));
        }

        let (old, new) = match rest.rfind(" b/") {
            Some(split) => (&rest[..split], &rest[split + 1..]),
            None => rest.split_once(' ')?,
        };
        let new = parse_name(new.trim())?;
        Some((strip_component(old.trim()), strip_component(&new)))
    }

    /// Path named by an extended header such as `rename to <path>`.
    ///
    /// These names are repository-relative and carry no `a/`/`b/` side.
    pub fn extended_path(&self, prefix: &str) -> Option<String> {
        self.extended.iter().find_map(|line| {
            let name = line.strip_prefix(prefix)?.strip_prefix(' ')?;
            parse_name(name).filter(|n| !n.is_empty())
        })
    }

    /// Source path, `None` for `/dev/null`.
    pub fn old_path(&self) -> Option<String> {
        if let Some(path) = self
            .extended_path("rename from")
            .or_else(|| self.extended_path("copy from"))
        {
            return Some(path);
        }
        match self.old_header.as_deref() {
            Some(header) => header_path(header, "--- "),
            None if self.has_extended("new file mode") => None,
            None => self.git_paths().map(|(old, _)| old),
        }
    }

    /// Target path, `None` for `/dev/null`.
    pub fn new_path(&self) -> Option<String> {
        if let Some(path) = self
            .extended_path("rename to")
            .or_else(|| self.extended_path("copy to"))
        {
            return Some(path);
        }
        match self.new_header.as_deref() {
            Some(header) => header_path(header, "+++ "),
            None if self.has_extended("deleted file mode") => None,
            None => self.git_paths().map(|(_, new)| new),
        }
    }

    /// The path this section ends up writing (or deleting).
    pub fn path(&self) -> Option<String> {
        self.new_path().or_else(|| self.old_path())
    }

    /// All distinct workspace paths this section touches: both file headers,
    /// rename and copy endpoints, and the `diff --git` names when no header
    /// names a file.
    pub fn touched_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let header_paths = [
            self.old_header.as_deref().and_then(|h| header_path(h, "--- ")),
            self.new_header.as_deref().and_then(|h| header_path(h, "+++ ")),
        ];
        let extended_paths = ["rename from", "rename to", "copy from", "copy to"]
            .map(|prefix| self.extended_path(prefix));
        for path in [self.old_path(), self.new_path()]
            .into_iter()
            .chain(header_paths)
            .chain(extended_paths)
            .flatten()
        {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            if let Some((old, new)) = self.git_paths() {
                paths.push(new.clone());
                if old != new {
                    paths.push(old);
                }
            }
        }
        paths
    }

    pub fn kind(&self) -> FileKind {
        let old_null = self
            .old_header
            .as_deref()
            .is_some_and(|h| header_is_dev_null(h, "--- "));
        let new_null = self
            .new_header
            .as_deref()
            .is_some_and(|h| header_is_dev_null(h, "+++ "));

        if self.has_extended("new file mode") || old_null {
            FileKind::New
        } else if self.has_extended("deleted file mode") || new_null {
            FileKind::Deleted
        } else {
            FileKind::Modified
        }
    }

    pub fn has_extended(&self, prefix: &str) -> bool {
        self.extended.iter().any(|line| line.starts_with(prefix))
    }

    /// Full content of a new file, reconstructed from Addition lines.
    ///
    /// Multiple hunks are concatenated in order.
    pub fn new_file_content(&self) -> String {
        let mut content = String::new();
        let mut trailing_newline = true;
        for hunk in &self.hunks {
            for line in &hunk.lines {
                match line {
                    HunkLine::Addition(text) => {
                        content.push_str(text);
                        content.push('\n');
                        trailing_newline = true;
                    }
                    HunkLine::NoNewline(_) => trailing_newline = false,
                    _ => {}
                }
            }
        }
        if !trailing_newline && content.ends_with('\n') {
            content.pop();
        }
        content
    }

    fn render_into(&self, out: &mut Vec<String>) {
        out.extend(self.diff_line.iter().cloned());
        out.extend(self.extended.iter().cloned());
        out.extend(self.old_header.iter().cloned());
        out.extend(self.new_header.iter().cloned());
        out.extend(self.loose.iter().cloned());
        for hunk in &self.hunks {
            out.push(hunk.header.to_string());
            out.extend(hunk.lines.iter().map(HunkLine::to_string));
        }
    }
}

fn header_is_dev_null(header: &str, marker: &str) -> bool {
    header
        .strip_prefix(marker)
        .map(|rest| rest.split('\t').next().unwrap_or("").trim() == DEV_NULL)
        .unwrap_or(false)
}

fn header_path(header: &str, marker: &str) -> Option<String> {
    let path = parse_name(header.strip_prefix(marker)?)?;
    if path.is_empty() || path == DEV_NULL {
        return None;
    }
    Some(strip_component(&path))
}

/// One file name from a header line: C-quoted, or everything up to the
/// tab that introduces a timestamp.
fn parse_name(raw: &str) -> Option<String> {
    if raw.starts_with('"') {
        return unquote_name(raw).map(|(name, _)| name);
    }
    Some(raw.split('\t').next().unwrap_or("").trim().to_string())
}

/// Decode a git C-quoted name. Returns the name and the text after the
/// closing quote, or `None` when the quoting is broken.
fn unquote_name(raw: &str) -> Option<(String, &str)> {
    let body = raw.strip_prefix('"')?;
    let mut bytes = Vec::new();
    let mut iter = body.char_indices();
    while let Some((idx, ch)) = iter.next() {
        match ch {
            '"' => {
                let name = String::from_utf8_lossy(&bytes).into_owned();
                return Some((name, &body[idx + 1..]));
            }
            '\\' => {
                let (_, esc) = iter.next()?;
                let byte = match esc {
                    'a' => 0x07,
                    'b' => 0x08,
                    'f' => 0x0c,
                    'n' => b'\n',
                    'r' => b'\r',
                    't' => b'\t',
                    'v' => 0x0b,
                    '\\' => b'\\',
                    '"' => b'"',
                    '0'..='7' => {
                        let mut value = esc.to_digit(8)?;
                        for _ in 0..2 {
                            let (_, digit) = iter.next()?;
                            value = value * 8 + digit.to_digit(8)?;
                        }
                        u8::try_from(value).ok()?
                    }
                    _ => return None,
                };
                bytes.push(byte);
            }
            _ => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    None
}

/// Drop the leading path component the way `git apply` does by default
/// (`-p1`). A name without a separator is returned unchanged.
pub fn strip_component(name: &str) -> String {
    match name.split_once('/') {
        Some((_, rest)) => rest.trim_start_matches('/').to_string(),
        None => name.to_string(),
    }
}

/// A parsed patch: free-form preamble followed by file sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub preamble: Vec<String>,
    pub sections: Vec<FileSection>,
}

impl Patch {
    /// Every distinct path touched by the patch, in first-seen order.
    pub fn touched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for path in self.sections.iter().flat_map(FileSection::touched_paths) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    pub fn hunks(&self) -> impl Iterator<Item = &Hunk> {
        self.sections.iter().flat_map(|s| s.hunks.iter())
    }

    /// Serialize back to diff text, one trailing newline.
    pub fn render(&self) -> String {
        let mut lines = self.preamble.clone();
        for section in &self.sections {
            section.render_into(&mut lines);
        }
        if lines.is_empty() {
            return String::new();
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}
