//! Gitignore-style exclusion patterns: `*`, `**`, `?`, `[]`, leading `!`
//! negation, trailing `/` to require a directory.
//!
//! Hand-rolled rather than pulling in a dedicated gitignore crate — the
//! match surface here (a handful of user patterns evaluated per batch, not
//! per file in a hot loop) doesn't earn a new dependency, following the
//! same judgment the reference daemon applies to its own small matchers
//! (`security::sanitize_tool_input`).

use once_cell::sync::OnceCell;
use regex::Regex;

pub struct GlobPattern {
    raw: String,
    negate: bool,
    dir_only: bool,
    regex: OnceCell<Regex>,
}

impl GlobPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut pat = raw.trim();
        if pat.is_empty() {
            return Err("empty pattern".to_string());
        }
        let negate = pat.starts_with('!');
        if negate {
            pat = &pat[1..];
        }
        let dir_only = pat.ends_with('/') && pat.len() > 1;
        let body = if dir_only { &pat[..pat.len() - 1] } else { pat };

        Ok(Self {
            raw: raw.to_string(),
            negate,
            dir_only,
            regex: {
                let compiled = translate(body)
                    .map_err(|e| format!("invalid pattern {raw:?}: {e}"))?;
                let cell = OnceCell::new();
                let _ = cell.set(compiled);
                cell
            },
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn negate(&self) -> bool {
        self.negate
    }

    /// `rel_path` is '/'-separated, relative to the repository root.
    /// `is_dir` tells us whether the candidate is itself a directory (for
    /// trailing-slash patterns); pass `false` for plain file classification.
    pub fn matches(&self, rel_path: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            // A dir-only pattern also excludes files *underneath* a matching directory;
            // the caller (GlobSet) handles the ancestor check, this is the leaf test.
            return false;
        }
        self.regex
            .get()
            .map(|re| re.is_match(rel_path))
            .unwrap_or(false)
    }
}

pub struct GlobSet {
    patterns: Vec<GlobPattern>,
}

impl GlobSet {
    pub fn new(raw_patterns: &[String]) -> Result<Self, String> {
        let patterns = raw_patterns
            .iter()
            .map(|p| GlobPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Ordered evaluation: later patterns override earlier ones, matching
    /// gitignore's "last match wins" semantics. `ancestors` are the '/'-
    /// separated relative paths of every directory between the repo root
    /// and `rel_path` (exclusive of `rel_path` itself), used so a
    /// trailing-slash directory pattern excludes everything beneath it.
    pub fn is_excluded(&self, rel_path: &str, ancestors: &[String]) -> bool {
        let mut excluded = false;
        for pattern in &self.patterns {
            let hit = pattern.matches(rel_path, false)
                || (pattern.dir_only && ancestors.iter().any(|a| pattern.matches(a, true)));
            if hit {
                excluded = !pattern.negate();
            }
        }
        excluded
    }
}

fn translate(glob: &str) -> Result<Regex, regex::Error> {
    let anchored = glob.contains('/') && !glob.starts_with("**/");
    let mut out = String::from("^");
    if !anchored {
        out.push_str("(?:.*/)?");
    } else if let Some(stripped) = glob.strip_prefix('/') {
        return translate(stripped);
    }

    let chars: Vec<char> = glob.trim_start_matches('/').chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    out.push_str(".*");
                    i += 2;
                    if i < chars.len() && chars[i] == '/' {
                        i += 1;
                    }
                } else {
                    out.push_str("[^/]*");
                    i += 1;
                }
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            '[' => {
                out.push('[');
                i += 1;
                if i < chars.len() && (chars[i] == '!' || chars[i] == '^') {
                    out.push('^');
                    i += 1;
                }
                while i < chars.len() && chars[i] != ']' {
                    out.push(chars[i]);
                    i += 1;
                }
                out.push(']');
                i += 1;
            }
            c => {
                out.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    out.push('$');
    Regex::new(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_does_not_cross_slash() {
        let set = GlobSet::new(&["*.log".to_string()]).unwrap();
        assert!(set.is_excluded("a.log", &[]));
        assert!(set.is_excluded("sub/a.log", &[]));
        assert!(!set.is_excluded("sub/a.log.txt", &[]));
    }

    #[test]
    fn doublestar_crosses_slash() {
        let set = GlobSet::new(&["vendor/**/generated.rs".to_string()]).unwrap();
        assert!(set.is_excluded("vendor/a/b/generated.rs", &[]));
    }

    #[test]
    fn directory_only_pattern_excludes_descendants() {
        let set = GlobSet::new(&["build/".to_string()]).unwrap();
        assert!(set.is_excluded(
            "build/out.o",
            &["build".to_string()]
        ));
        assert!(!set.is_excluded("rebuild/out.o", &["rebuild".to_string()]));
    }

    #[test]
    fn negation_overrides_earlier_match() {
        let set = GlobSet::new(&["*.log".to_string(), "!keep.log".to_string()]).unwrap();
        assert!(set.is_excluded("a.log", &[]));
        assert!(!set.is_excluded("keep.log", &[]));
    }
}
