//! Glob compilation for file reads.
//!
//! A glob compiles into two parts: a literal path prefix that lets the
//! storage engine narrow the range of index entries it reads, and an
//! anchored match predicate applied to each surviving path. `*` matches
//! within one path segment, `**` crosses segments, `?` matches a single
//! character, `[...]` is a character class and `{a,b}` an alternation.

use std::fmt;

use regex::Regex;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    prefix: String,
    regex: Regex,
}

/// Error for patterns that do not compile.
#[derive(Debug, Clone)]
pub struct GlobError {
    pub pattern: String,
    pub reason: String,
}

impl fmt::Display for GlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid glob {:?}: {}", self.pattern, self.reason)
    }
}

impl std::error::Error for GlobError {}

impl Glob {
    /// Compiles `pattern` into a prefix hint and a match predicate.
    pub fn parse(pattern: &str) -> Result<Glob, GlobError> {
        let normalized = if pattern.starts_with('/') {
            pattern.to_string()
        } else {
            format!("/{pattern}")
        };
        let prefix = literal_prefix(&normalized);
        let source = translate(&normalized).map_err(|reason| GlobError {
            pattern: pattern.to_string(),
            reason,
        })?;
        let regex = Regex::new(&source).map_err(|e| GlobError {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Glob {
            pattern: pattern.to_string(),
            prefix,
            regex,
        })
    }

    /// The literal prefix shared by every path the glob can match. Used to
    /// narrow the initial index read before the predicate runs.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The original pattern text.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Tests a path against the glob. Directory paths may carry a trailing
    /// slash; it is ignored for matching purposes.
    pub fn matches(&self, path: &str) -> bool {
        let path = if path.len() > 1 {
            path.strip_suffix('/').unwrap_or(path)
        } else {
            path
        };
        self.regex.is_match(path)
    }
}

/// Longest literal prefix of the pattern, cut back to the last `/` so it
/// is always a whole-segment prefix.
fn literal_prefix(pattern: &str) -> String {
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' | '[' | '{' | '\\' => break,
            _ => literal.push(c),
        }
    }
    match literal.rfind('/') {
        Some(idx) => literal[..=idx].to_string(),
        None => String::new(),
    }
}

fn translate(pattern: &str) -> Result<String, String> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    let mut brace_depth = 0usize;
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        out.push(']');
                        closed = true;
                        break;
                    }
                    if matches!(inner, '\\' | '^') {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                if !closed {
                    return Err("unclosed character class".to_string());
                }
            }
            '{' => {
                brace_depth += 1;
                out.push('(');
            }
            '}' => {
                if brace_depth == 0 {
                    return Err("unbalanced '}'".to_string());
                }
                brace_depth -= 1;
                out.push(')');
            }
            ',' if brace_depth > 0 => out.push('|'),
            '\\' => match chars.next() {
                Some(escaped) => {
                    out.push('\\');
                    out.push(escaped);
                }
                None => return Err("trailing escape".to_string()),
            },
            c if "+.^$()|".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    if brace_depth != 0 {
        return Err("unclosed '{'".to_string());
    }
    out.push('$');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_exactly() {
        let g = Glob::parse("/a/b.txt").unwrap();
        assert_eq!(g.prefix(), "/a/");
        assert!(g.matches("/a/b.txt"));
        assert!(!g.matches("/a/b.txt2"));
    }

    #[test]
    fn star_stays_within_a_segment() {
        let g = Glob::parse("/logs/*.txt").unwrap();
        assert_eq!(g.prefix(), "/logs/");
        assert!(g.matches("/logs/a.txt"));
        assert!(!g.matches("/logs/sub/a.txt"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let g = Glob::parse("/data/**").unwrap();
        assert!(g.matches("/data/a"));
        assert!(g.matches("/data/a/b/c"));
        assert!(!g.matches("/other/a"));
    }

    #[test]
    fn alternation_and_classes() {
        let g = Glob::parse("/f/{a,b}/[0-9]").unwrap();
        assert!(g.matches("/f/a/3"));
        assert!(g.matches("/f/b/7"));
        assert!(!g.matches("/f/c/1"));
    }

    #[test]
    fn directory_paths_match_without_trailing_slash() {
        let g = Glob::parse("/a/*").unwrap();
        assert!(g.matches("/a/dir/"));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        assert!(Glob::parse("/a/[x").is_err());
        assert!(Glob::parse("/a/{x,y").is_err());
        assert!(Glob::parse("/a/}").is_err());
    }
}
