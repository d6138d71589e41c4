//! Redis-style glob patterns, matched locally against L1 keys.

use regex::Regex;

use crate::error::CacheError;

/// A compiled glob supporting `*`, `?`, `[...]` classes and `\` escapes,
/// the subset understood by Redis `SCAN MATCH`.
#[derive(Debug, Clone)]
pub struct Glob {
    source: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, CacheError> {
        let mut re = String::with_capacity(pattern.len() * 2 + 2);
        re.push('^');
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                '\\' => match chars.next() {
                    Some(escaped) => re.push_str(&regex::escape(&escaped.to_string())),
                    None => re.push_str(r"\\"),
                },
                '[' => {
                    let mut class = String::new();
                    let mut closed = false;
                    for cc in chars.by_ref() {
                        if cc == ']' {
                            closed = true;
                            break;
                        }
                        class.push(cc);
                    }
                    if !closed {
                        return Err(CacheError::config(format!(
                            "unterminated character class in pattern '{pattern}'"
                        )));
                    }
                    re.push('[');
                    let body = match class.strip_prefix('^') {
                        Some(rest) => {
                            re.push('^');
                            rest
                        }
                        None => class.as_str(),
                    };
                    for cc in body.chars() {
                        // Keep ranges, escape anything regex treats specially inside a class.
                        if matches!(cc, '\\' | '[' | ']' | '&' | '~') {
                            re.push('\\');
                        }
                        re.push(cc);
                    }
                    re.push(']');
                }
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');

        let regex = Regex::new(&re)
            .map_err(|e| CacheError::config(format!("invalid pattern '{pattern}': {e}")))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Escape glob metacharacters so `value` matches only itself.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
