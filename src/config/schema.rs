use crate::policy::{normalize_path, PolicyConfig};
use crate::quality::QualityThresholds;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Contents of `patchgate.toml`. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub policy: PolicyConfig,
    pub apply: ApplySettings,
    pub quality: QualityThresholds,
}

/// `[apply]`: how the external apply tool is driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApplySettings {
    /// Program used for `apply` and savepoints.
    pub git: String,
    pub temp_patch_name: String,
    pub debug_patch_name: String,
    /// Wall-clock limit per apply attempt.
    pub timeout_secs: Option<u64>,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            temp_patch_name: "temp_patch.diff".to_string(),
            debug_patch_name: "last_patch_debug.diff".to_string(),
            timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        let names = [
            ("apply.git", &self.apply.git),
            ("apply.temp_patch_name", &self.apply.temp_patch_name),
            ("apply.debug_patch_name", &self.apply.debug_patch_name),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                issues.push(ValidationIssue::MissingField { field });
            }
        }
        for (field, name) in [
            ("apply.temp_patch_name", &self.apply.temp_patch_name),
            ("apply.debug_patch_name", &self.apply.debug_patch_name),
        ] {
            if name.contains('/') || name.contains('\\') {
                issues.push(ValidationIssue::InvalidValue {
                    field,
                    message: "must be a bare file name".to_string(),
                });
            }
        }
        if self.apply.temp_patch_name == self.apply.debug_patch_name {
            issues.push(ValidationIssue::InvalidValue {
                field: "apply.debug_patch_name",
                message: "must differ from apply.temp_patch_name".to_string(),
            });
        }
        if self.apply.timeout_secs == Some(0) {
            issues.push(ValidationIssue::InvalidValue {
                field: "apply.timeout_secs",
                message: "must be greater than zero".to_string(),
            });
        }

        // An empty unlock disables maintenance mode.
        let unlock = self
            .policy
            .maintenance_unlock
            .as_deref()
            .map(normalize_path)
            .filter(|u| !u.is_empty());
        if let Some(unlock) = unlock {
            let listed = self
                .policy
                .protected
                .iter()
                .any(|entry| normalize_path(entry) == unlock);
            if !listed {
                issues.push(ValidationIssue::InvalidValue {
                    field: "policy.maintenance_unlock",
                    message: format!("'{unlock}' is not a protected entry"),
                });
            }
        }
        for (field, entries) in [
            ("policy.protected", &self.policy.protected),
            ("policy.allowed", &self.policy.allowed),
        ] {
            if entries.iter().any(|e| normalize_path(e).is_empty()) {
                issues.push(ValidationIssue::InvalidValue {
                    field,
                    message: "entries must not be empty".to_string(),
                });
            }
        }

        let q = &self.quality;
        let unit_ranges = [
            ("quality.shrink_ratio", q.shrink_ratio),
            ("quality.min_similarity", q.min_similarity),
            ("quality.symbol_loss_ratio", q.symbol_loss_ratio),
        ];
        for (field, value) in unit_ranges {
            if !(0.0..=1.0).contains(&value) {
                issues.push(ValidationIssue::InvalidValue {
                    field,
                    message: format!("{value} is outside 0.0..=1.0"),
                });
            }
        }
        if q.growth_ratio.is_nan() || q.growth_ratio < 1.0 {
            issues.push(ValidationIssue::InvalidValue {
                field: "quality.growth_ratio",
                message: format!("{} must be at least 1.0", q.growth_ratio),
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    MissingField { field: &'static str },
    InvalidValue { field: &'static str, message: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingField { field } => {
                write!(f, "missing required value for '{field}'")
            }
            ValidationIssue::InvalidValue { field, message } => {
                write!(f, "invalid value for '{field}': {message}")
            }
        }
    }
}
