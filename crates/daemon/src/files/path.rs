//! Request path containment and exclusion matching.
//!
//! Every path a remote peer sends goes through [`secure_path`] before the
//! filesystem is touched. The result is a [`JailPath`]: a clean, relative,
//! `/`-separated path that contains no `..` segment and matches no
//! exclusion pattern.

use std::fmt;

use super::jail::JailError;

/// A validated path relative to the jail root. `"."` is the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JailPath(String);

impl JailPath {
    /// The jail root.
    pub fn root() -> Self {
        JailPath(".".to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == "."
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, empty for the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty() && *s != ".")
    }

    /// Last segment, or `"/"` for the root.
    pub fn file_name(&self) -> &str {
        if self.is_root() {
            "/"
        } else {
            self.0.rsplit('/').next().unwrap_or(&self.0)
        }
    }

    /// Child path. `name` must be a single directory entry name.
    pub(crate) fn join(&self, name: &str) -> Self {
        if self.is_root() {
            JailPath(name.to_string())
        } else {
            JailPath(format!("{}/{}", self.0, name))
        }
    }

    /// Absolute form presented to peers (`/docs/a.txt`, `/` for the root).
    pub fn to_absolute(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.0)
        }
    }
}

impl fmt::Display for JailPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static set of exclusion patterns.
///
/// A path is excluded when it, or any of its ancestors, equals a pattern,
/// has a component equal to a pattern, or ends with `"/" + pattern`.
/// Component matching applies anywhere in the tree: excluding `config`
/// hides every entry named `config`.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    patterns: Vec<String>,
}

impl ExclusionSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether a normalized relative path is hidden.
    pub fn is_excluded(&self, normalized: &str) -> bool {
        if self.patterns.is_empty() || normalized == "." || normalized.is_empty() {
            return false;
        }

        let segments: Vec<&str> = normalized.split('/').collect();
        for pattern in &self.patterns {
            if segments.iter().any(|segment| segment == pattern) {
                return true;
            }

            let suffix = format!("/{}", pattern);
            let mut end = normalized.len();
            // Walk the path and each ancestor, longest first.
            loop {
                let prefix = &normalized[..end];
                if prefix == pattern || prefix.ends_with(&suffix) {
                    return true;
                }
                match prefix.rfind('/') {
                    Some(idx) => end = idx,
                    None => break,
                }
            }
        }
        false
    }
}

/// Validate and normalize a peer-supplied path.
///
/// `""`, `"/"` and `"."` map to the root. Leading, repeated and trailing
/// separators and `.` segments are dropped. Only `/` separates segments; a
/// `\` is an ordinary name character. A `..` segment is rejected, including
/// one delimited by `\` in the original request.
pub fn secure_path(request: &str, exclusions: &ExclusionSet) -> Result<JailPath, JailError> {
    if has_parent_segment(request) {
        return Err(JailError::PathTraversalDenied(request.to_string()));
    }

    let normalized = request
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");

    if normalized.is_empty() {
        return Ok(JailPath::root());
    }

    if exclusions.is_excluded(&normalized) {
        return Err(JailError::ExcludedPath(normalized));
    }

    Ok(JailPath(normalized))
}

fn has_parent_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}
