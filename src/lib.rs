//! Patchgate: governed application of generated unified diffs
//!
//! Patches produced by an unreliable generator are repaired, checked against
//! a path policy, applied through an escalating sequence of `git apply`
//! strategies, and verified afterwards. Anything that goes wrong after the
//! workspace was touched is rolled back.
//!
//! # Pipeline
//!
//! 1. [`patch`]: typed diff model, lenient parser, sanitizer and hunk header
//!    repair.
//! 2. [`policy`]: protected / allowed / scope decisions on normalized paths.
//! 3. [`quality`]: truncation and structure gates, backups, post-apply
//!    corruption checks.
//! 4. [`engine`]: the state machine tying it together.
//!
//! # Safety
//!
//! - Every declared path is checked lexically and through symlinks
//! - Backups of every declared path before the first write
//! - Atomic file writes (tempfile + fsync + rename)
//! - Direct writes only for brand new files
//!
//! # Example
//!
//! ```no_run
//! use patchgate::{ApplyOptions, PatchEngine};
//! use std::path::Path;
//!
//! let engine = PatchEngine::default();
//! let patch = std::fs::read_to_string("change.diff").unwrap();
//! let outcome = engine.apply(&patch, Path::new("."), ApplyOptions::default());
//!
//! match outcome.error {
//!     None => println!("applied via {:?}", outcome.mode),
//!     Some(e) => eprintln!("rejected ({}): {}", e.code(), e),
//! }
//! ```

pub mod config;
pub mod engine;
pub mod fs_util;
pub mod patch;
pub mod policy;
pub mod quality;
pub mod safety;

// Re-exports
pub use config::{load_from_path, load_from_str, ConfigError, EngineConfig};
pub use engine::{
    ApplyError, ApplyMode, ApplyOptions, ApplyOutcome, ApplyTool, EngineSettings, GitApply,
    GitSavepoint, PatchEngine, ProtectedPathError, Savepoint,
};
pub use patch::{repair_hunk_headers, sanitize, FileKind, Patch};
pub use policy::{
    effective_protected, normalize_path, validate_paths, PolicyConfig, PolicyDecision,
    PolicyReport, Violation,
};
pub use quality::{
    validate_applied_files, validate_content_changes, validate_patch_quality, BackupSet,
    FileExpectation, QualityThresholds,
};
pub use safety::{SafetyError, WorkspaceGuard};
