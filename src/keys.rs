//! Cache key construction and glob patterns.
//!
//! Keys are a resource tag followed by identifying parts, joined with `:`.
//! Related keys therefore share a prefix, and a whole family can be dropped
//! with one pattern such as `followings:42:page:*`.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::error::{StoreError, StoreResult};

/// Separator between key parts
pub const SEPARATOR: char = ':';

const GLOB_SPECIAL: [char; 5] = ['*', '?', '[', ']', '\\'];

/// A deterministic cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(tag: impl fmt::Display) -> Self {
        CacheKey(tag.to_string())
    }

    /// Appends one identifying part.
    pub fn part(mut self, part: impl fmt::Display) -> Self {
        self.0.push(SEPARATOR);
        self.0.push_str(&part.to_string());
        self
    }

    /// Appends `page:{page}`.
    pub fn page(self, page: u32) -> Self {
        self.part("page").part(page)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pattern matching every key nested below this one.
    pub fn children(&self) -> String {
        format!("{}{SEPARATOR}*", escape_glob(&self.0))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// What to remove from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Invalidation {
    /// Delete exactly this key
    Key(String),
    /// Delete every key matching this glob
    Pattern(String),
}

impl Invalidation {
    pub fn key(key: impl Into<String>) -> Self {
        Invalidation::Key(key.into())
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Invalidation::Pattern(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Invalidation::Key(key) | Invalidation::Pattern(key) => key,
        }
    }
}

impl From<CacheKey> for Invalidation {
    fn from(key: CacheKey) -> Self {
        Invalidation::Key(key.0)
    }
}

impl From<&CacheKey> for Invalidation {
    fn from(key: &CacheKey) -> Self {
        Invalidation::Key(key.0.clone())
    }
}

/// A key shape with `{name}` placeholders, e.g. `subjects:{grade_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    raw: String,
}

enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

impl KeyTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of the placeholders, in order of appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        self.segments()
            .into_iter()
            .filter_map(|segment| match segment {
                Segment::Placeholder(name) => Some(name),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Fills the placeholders from `params`.
    ///
    /// A placeholder without a value becomes `*`, so the result widens to a
    /// pattern instead of silently targeting the wrong key.
    pub fn render(&self, params: &HashMap<String, String>) -> Invalidation {
        let segments = self.segments();
        let wildcard = segments.iter().any(|segment| match segment {
            Segment::Literal(text) => is_pattern(text),
            Segment::Placeholder(name) => !params.contains_key(*name),
        });

        let mut rendered = String::with_capacity(self.raw.len());
        for segment in segments {
            match segment {
                Segment::Literal(text) if wildcard => rendered.push_str(text),
                Segment::Literal(text) => rendered.push_str(&unescape_glob(text)),
                Segment::Placeholder(name) => match params.get(name) {
                    Some(value) if wildcard => rendered.push_str(&escape_glob(value)),
                    Some(value) => rendered.push_str(value),
                    None => rendered.push('*'),
                },
            }
        }

        if wildcard {
            Invalidation::Pattern(rendered)
        } else {
            Invalidation::Key(rendered)
        }
    }

    fn segments(&self) -> Vec<Segment<'_>> {
        let mut segments = Vec::new();
        let mut rest = self.raw.as_str();
        while let Some(open) = rest.find('{') {
            match rest[open..].find('}') {
                Some(close) => {
                    if open > 0 {
                        segments.push(Segment::Literal(&rest[..open]));
                    }
                    segments.push(Segment::Placeholder(&rest[open + 1..open + close]));
                    rest = &rest[open + close + 1..];
                }
                None => break,
            }
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest));
        }
        segments
    }
}

impl From<&str> for KeyTemplate {
    fn from(raw: &str) -> Self {
        KeyTemplate::new(raw)
    }
}

impl From<String> for KeyTemplate {
    fn from(raw: String) -> Self {
        KeyTemplate::new(raw)
    }
}

/// True if `text` contains an unescaped glob metacharacter.
pub fn is_pattern(text: &str) -> bool {
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if matches!(c, '*' | '?' | '[') {
            return true;
        }
    }
    false
}

/// Escapes glob metacharacters so `text` matches only itself.
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if GLOB_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Drops the escapes from `text`, giving the literal key it matches.
pub fn unescape_glob(text: &str) -> String {
    let mut literal = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => literal.extend(chars.next()),
            other => literal.push(other),
        }
    }
    literal
}

/// Compiles a Redis-style glob (`*`, `?`, `[abc]`, `[^a-z]`, `\x`) into an
/// anchored regex.
pub fn glob_regex(pattern: &str) -> StoreResult<Regex> {
    let invalid = |reason: &str| StoreError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(next) => out.push_str(&regex::escape(&next.to_string())),
                None => return Err(invalid("trailing escape")),
            },
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('^') | Some('!')) {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for class_char in chars.by_ref() {
                    match class_char {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '-' => out.push('-'),
                        other => out.push_str(&regex::escape(&other.to_string())),
                    }
                }
                if !closed {
                    return Err(invalid("unclosed character class"));
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');

    Regex::new(&out).map_err(|err| invalid(&err.to_string()))
}
