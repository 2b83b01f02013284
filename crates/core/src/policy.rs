//! Privilege classification policy.
//!
//! Section and symbol naming conventions differ between toolchains and
//! platforms, so the mapping from names to privilege levels is data. A policy
//! is a list of regex rules evaluated in order; the first match wins.
//!
//! Policies can be written as YAML or JSON:
//!
//! ```yaml
//! default_executable: unprivileged
//! section_rules:
//!   - pattern: '^\.ktext'
//!     level: privileged
//! symbol_rules:
//!   - pattern: '^__syscall_entry$'
//!     level: gate
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::PrivilegeLevel;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse policy: {0}")]
    Parse(String),
    #[error("Invalid rule pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Single name-pattern rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRule {
    /// Regular expression matched against the section or symbol name.
    pub pattern: String,
    pub level: PrivilegeLevel,
}

impl NameRule {
    pub fn new(pattern: impl Into<String>, level: PrivilegeLevel) -> Self {
        Self { pattern: pattern.into(), level }
    }
}

/// Serializable policy description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Level for executable sections no section rule matches.
    #[serde(default = "default_executable_level")]
    pub default_executable: PrivilegeLevel,
    #[serde(default)]
    pub section_rules: Vec<NameRule>,
    /// Evaluated after section inheritance; a match overrides it.
    #[serde(default)]
    pub symbol_rules: Vec<NameRule>,
}

fn default_executable_level() -> PrivilegeLevel {
    PrivilegeLevel::Unprivileged
}

impl Default for PolicyConfig {
    /// Conventions for kernels that split supervisor code into `.ktext`-style
    /// sections, plus common secure-monitor and trampoline section names.
    fn default() -> Self {
        Self {
            default_executable: PrivilegeLevel::Unprivileged,
            section_rules: vec![
                NameRule::new(r"^\.(gate|trampoline|entry\.text)(\.|$)", PrivilegeLevel::Gate),
                NameRule::new(
                    r"^\.text\.(gate|trampoline|syscall_entry)(\.|$)",
                    PrivilegeLevel::Gate,
                ),
                NameRule::new(r"^\.k(text|init)(\.|$)", PrivilegeLevel::Privileged),
                NameRule::new(
                    r"^\.(privileged|kernel|secure|monitor)(\.|$)",
                    PrivilegeLevel::Privileged,
                ),
                NameRule::new(
                    r"^\.text\.(privileged|kernel|secure|monitor|el[123])(\.|$)",
                    PrivilegeLevel::Privileged,
                ),
            ],
            symbol_rules: vec![
                NameRule::new(
                    r"^__(syscall|smc|svc|hvc)_(entry|gate|stub|trampoline)$",
                    PrivilegeLevel::Gate,
                ),
                NameRule::new(r"_gate$", PrivilegeLevel::Gate),
            ],
        }
    }
}

impl PolicyConfig {
    pub fn from_yaml_str(body: &str) -> Result<Self, PolicyError> {
        serde_yaml::from_str(body).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    pub fn from_json_str(body: &str) -> Result<Self, PolicyError> {
        serde_json::from_str(body).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    /// Load a policy file, choosing the parser by extension (`.json` is JSON,
    /// anything else is YAML).
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let body = fs::read_to_string(path)
            .map_err(|source| PolicyError::Io { path: path.to_path_buf(), source })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&body)
        } else {
            Self::from_yaml_str(&body)
        }
    }

    pub fn to_yaml(&self) -> Result<String, PolicyError> {
        serde_yaml::to_string(self).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, PolicyError> {
        serde_json::to_string_pretty(self).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    /// Compile all patterns.
    pub fn compile(&self) -> Result<PrivilegePolicy, PolicyError> {
        Ok(PrivilegePolicy {
            default_executable: self.default_executable,
            section_rules: compile_rules(&self.section_rules)?,
            symbol_rules: compile_rules(&self.symbol_rules)?,
        })
    }
}

fn compile_rules(rules: &[NameRule]) -> Result<Vec<(Regex, PrivilegeLevel)>, PolicyError> {
    rules
        .iter()
        .map(|rule| {
            Regex::new(&rule.pattern)
                .map(|re| (re, rule.level))
                .map_err(|source| PolicyError::Pattern { pattern: rule.pattern.clone(), source })
        })
        .collect()
}

/// Compiled, ready-to-evaluate policy.
#[derive(Debug, Clone)]
pub struct PrivilegePolicy {
    default_executable: PrivilegeLevel,
    section_rules: Vec<(Regex, PrivilegeLevel)>,
    symbol_rules: Vec<(Regex, PrivilegeLevel)>,
}

impl Default for PrivilegePolicy {
    fn default() -> Self {
        // The built-in patterns are constants and always compile.
        match PolicyConfig::default().compile() {
            Ok(policy) => policy,
            Err(_) => Self {
                default_executable: PrivilegeLevel::Unprivileged,
                section_rules: Vec::new(),
                symbol_rules: Vec::new(),
            },
        }
    }
}

impl PrivilegePolicy {
    /// Level for a section. Total: every input yields exactly one level.
    pub fn section_level(&self, name: &str, executable: bool) -> PrivilegeLevel {
        if !executable {
            return PrivilegeLevel::Unknown;
        }
        self.section_rules
            .iter()
            .find(|(re, _)| re.is_match(name))
            .map(|(_, level)| *level)
            .unwrap_or(self.default_executable)
    }

    /// Level override for a symbol name, if any rule matches.
    pub fn symbol_override(&self, name: &str) -> Option<PrivilegeLevel> {
        self.symbol_rules.iter().find(|(re, _)| re.is_match(name)).map(|(_, level)| *level)
    }

    pub fn default_executable(&self) -> PrivilegeLevel {
        self.default_executable
    }
}
