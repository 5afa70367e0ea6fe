//! Temporary-file and editor-artifact filter
//!
//! Names matching an exclude pattern are never synchronized in either
//! direction. Patterns are matched against the file name only.

use std::path::Path;

use glob::Pattern;
use tracing::{debug, trace, warn};

/// Directory names used by HydraSync itself inside the sync root
pub const INTERNAL_DIR_NAMES: &[&str] = &[".hydrasync"];

pub struct NoiseFilter {
    patterns: Vec<Pattern>,
}

impl NoiseFilter {
    /// Compile `patterns`; invalid ones are logged and skipped
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let compiled: Vec<Pattern> = patterns
            .iter()
            .filter_map(|p| match Pattern::new(p.as_ref()) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p.as_ref(), error = %e, "Skipping invalid exclude pattern");
                    None
                }
            })
            .collect();
        debug!(patterns = compiled.len(), "Noise filter initialized");
        Self { patterns: compiled }
    }

    /// True if the name is a temporary or lock artifact
    pub fn is_excluded_name(&self, name: &str) -> bool {
        match self.patterns.iter().find(|p| p.matches(name)) {
            Some(pattern) => {
                trace!(name, pattern = %pattern, "Excluded by pattern");
                true
            }
            None => false,
        }
    }

    /// True if the path must be ignored: excluded file name, or anything
    /// inside an internal directory
    pub fn is_excluded(&self, path: &Path) -> bool {
        let internal = path.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|s| INTERNAL_DIR_NAMES.contains(&s))
        });
        if internal {
            return true;
        }
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.is_excluded_name(n))
    }

    pub fn patterns_count(&self) -> usize {
        self.patterns.len()
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new(hydrasync_core::config::DEFAULT_EXCLUDE_PATTERNS)
    }
}
