//! Host-side static code validation
//!
//! Rejects obviously unsafe Python before it ever reaches a backend. The
//! validator is deliberately language-neutral on the host: plain substring
//! and import-line scanning, no Python parser required.

use std::collections::BTreeSet;

use crate::error::SandboxError;

/// Substrings that always reject a code block
const BLOCKED_PATTERNS: &[&str] = &[
    "eval(",
    "exec(",
    "__import__(",
    "open(",
    "os.system",
    "subprocess.",
    "os.popen",
];

/// Modules that may never be imported, nor appear in the authorised set
pub const DANGEROUS_MODULES: &[&str] = &["os", "sys", "subprocess", "socket", "shutil"];

/// Default import allow-list for sandboxed code
pub const DEFAULT_AUTHORIZED_IMPORTS: &[&str] = &[
    "json",
    "re",
    "collections",
    "datetime",
    "time",
    "math",
    "itertools",
    "copy",
    "requests",
    "bs4",
    "urllib",
    "html",
    "io",
    "aiohttp",
    "asyncio",
    "dotenv",
];

/// Union of the default allow-list and a caller-supplied extension, with the
/// dangerous modules always removed
pub fn merge_authorized_imports(additional: &[String]) -> BTreeSet<String> {
    let mut merged: BTreeSet<String> = DEFAULT_AUTHORIZED_IMPORTS
        .iter()
        .map(|s| s.to_string())
        .collect();
    merged.extend(additional.iter().cloned());
    for dangerous in DANGEROUS_MODULES {
        merged.remove(*dangerous);
    }
    merged
}

/// Statically screens code blocks before execution
#[derive(Debug, Default, Clone, Copy)]
pub struct CodeValidator;

impl CodeValidator {
    /// Create a validator
    pub fn new() -> Self {
        CodeValidator
    }

    /// Check a code block; `Err` carries `unsafe_code` and names the first
    /// blocked pattern found. The backend is never contacted on rejection.
    pub fn validate(&self, code: &str) -> Result<(), SandboxError> {
        for pattern in BLOCKED_PATTERNS {
            if code.contains(pattern) {
                return Err(SandboxError::unsafe_code(format!(
                    "blocked pattern: {}",
                    pattern
                )));
            }
        }

        for line in code.lines() {
            for module in imported_modules(line) {
                if DANGEROUS_MODULES.contains(&module.as_str()) {
                    return Err(SandboxError::unsafe_code(format!(
                        "blocked import: {}",
                        module
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Top-level module names imported by one source line
fn imported_modules(line: &str) -> Vec<String> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("import ") {
        // `import a, b.c as d` → [a, b]
        rest.split(',')
            .filter_map(|part| {
                part.trim()
                    .split_whitespace()
                    .next()
                    .map(|name| name.split('.').next().unwrap_or(name).to_string())
            })
            .filter(|name| !name.is_empty())
            .collect()
    } else if let Some(rest) = trimmed.strip_prefix("from ") {
        // `from a.b import c` → [a]
        rest.split_whitespace()
            .next()
            .map(|name| vec![name.split('.').next().unwrap_or(name).to_string()])
            .unwrap_or_default()
    } else {
        Vec::new()
    }
}
