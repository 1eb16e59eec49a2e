use crate::types::Identifier;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Layer format used when nothing else is configured.
pub const DEFAULT_LAYER_FORMAT: &str = "Image-%d.%d";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("layer format '{format}' must contain exactly two %d placeholders, found {found}")]
    PlaceholderCount { format: String, found: usize },
    #[error("layer format '{format}' has adjacent placeholders, which cannot be parsed back")]
    AdjacentPlaceholders { format: String },
    #[error("layer format '{format}' contains unsupported directive '%{directive}'")]
    UnsupportedDirective { format: String, directive: char },
    #[error("layer format '{0}' ends with a dangling '%'")]
    DanglingPercent(String),
    #[error("invalid pattern for layer format '{format}': {reason}")]
    Pattern { format: String, reason: String },
    #[error("'{name}' does not match layer format '{format}'")]
    NonConforming { format: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Number,
}

/// Converts between volume names and `(version, release)` identifiers.
///
/// The template is a printf-like string with exactly two `%d` placeholders,
/// version first. `%%` is a literal percent sign. The derived pattern is
/// anchored at both ends, so `Image-1.0-fs` does not match `Image-%d.%d`.
/// Numbers must be written the way `render` writes them: `Image-01.0` is
/// not an image, so every parsed name renders back to itself.
#[derive(Clone)]
pub struct IdentifierCodec {
    format: String,
    segments: Vec<Segment>,
    pattern: Regex,
}

impl IdentifierCodec {
    pub fn new(format: impl Into<String>) -> Result<Self, FormatError> {
        let format = format.into();
        let segments = tokenize(&format)?;

        let mut source = String::from("^");
        for segment in &segments {
            match segment {
                Segment::Literal(text) => source.push_str(&regex::escape(text)),
                Segment::Number => source.push_str(r"(0|[1-9]\d*)"),
            }
        }
        source.push('$');

        let pattern = Regex::new(&source).map_err(|e| FormatError::Pattern {
            format: format.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            format,
            segments,
            pattern,
        })
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// The regular expression the template compiles to.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.parse(name).is_ok()
    }

    pub fn parse(&self, name: &str) -> Result<Identifier, FormatError> {
        let non_conforming = || FormatError::NonConforming {
            format: self.format.clone(),
            name: name.to_owned(),
        };

        let captures = self.pattern.captures(name).ok_or_else(non_conforming)?;
        let number = |idx: usize| -> Result<u64, FormatError> {
            captures
                .get(idx)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .ok_or_else(non_conforming)
        };

        Ok(Identifier::new(number(1)?, number(2)?))
    }

    pub fn render(&self, id: Identifier) -> String {
        let mut numbers = [id.version, id.release].into_iter();
        let mut out = String::with_capacity(self.format.len() + 8);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Number => {
                    if let Some(n) = numbers.next() {
                        out.push_str(&n.to_string());
                    }
                }
            }
        }
        out
    }
}

impl fmt::Debug for IdentifierCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifierCodec")
            .field("format", &self.format)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

impl PartialEq for IdentifierCodec {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format
    }
}

impl Eq for IdentifierCodec {}

fn tokenize(format: &str) -> Result<Vec<Segment>, FormatError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => literal.push('%'),
            Some('d') => {
                if literal.is_empty() && segments.last() == Some(&Segment::Number) {
                    return Err(FormatError::AdjacentPlaceholders {
                        format: format.to_owned(),
                    });
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Number);
            }
            Some(directive) => {
                return Err(FormatError::UnsupportedDirective {
                    format: format.to_owned(),
                    directive,
                })
            }
            None => return Err(FormatError::DanglingPercent(format.to_owned())),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    let found = segments
        .iter()
        .filter(|s| matches!(s, Segment::Number))
        .count();
    if found != 2 {
        return Err(FormatError::PlaceholderCount {
            format: format.to_owned(),
            found,
        });
    }
    Ok(segments)
}
