//! Search filter parser and evaluator for the reference server.
//!
//! Supports the string form of RFC 4515: `&`, `|`, `!`, equality, presence,
//! substrings, `>=`, `<=` and `~=`, with `\XX` hex escapes in values. A filter
//! without enclosing parentheses (`uid=alice`) is accepted as a single item.
//! Matching is case-insensitive; two values that both parse as integers are
//! compared numerically.

use std::cmp::Ordering;

use dirsession_core::{AttributeSet, ProtocolError, ResultCode};
use thiserror::Error;

/// Maximum nesting depth of `&`, `|` and `!`.
const MAX_FILTER_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal { attribute: String, value: String },
    Approx { attribute: String, value: String },
    GreaterOrEqual { attribute: String, value: String },
    LessOrEqual { attribute: String, value: String },
    Present(String),
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filter at offset {position}: {message}")]
pub struct FilterError {
    pub position: usize,
    pub message: String,
}

impl From<FilterError> for ProtocolError {
    fn from(err: FilterError) -> Self {
        ProtocolError::new(ResultCode::FILTER_ERROR, err.to_string())
    }
}

impl Filter {
    pub fn parse(input: &str) -> Result<Filter, FilterError> {
        let trimmed = input.trim();
        let mut parser = Parser {
            input: trimmed.as_bytes(),
            pos: 0,
        };
        let filter = if trimmed.starts_with('(') {
            parser.filter(0)?
        } else {
            parser.item(None)?
        };
        if parser.pos != parser.input.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }

    /// Evaluate against an entry's attributes.
    pub fn matches(&self, attributes: &AttributeSet) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(attributes)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(attributes)),
            Filter::Not(filter) => !filter.matches(attributes),
            // Every entry has an object class.
            Filter::Present(attribute) if attribute.eq_ignore_ascii_case("objectClass") => true,
            Filter::Present(attribute) => attributes
                .get(attribute)
                .is_some_and(|a| !a.values.is_empty()),
            Filter::Equal { attribute, value } => {
                any_value(attributes, attribute, |v| compare_values(v, value) == Ordering::Equal)
            }
            Filter::Approx { attribute, value } => {
                let wanted = squash(value);
                any_value(attributes, attribute, |v| squash(v) == wanted)
            }
            Filter::GreaterOrEqual { attribute, value } => {
                any_value(attributes, attribute, |v| compare_values(v, value) != Ordering::Less)
            }
            Filter::LessOrEqual { attribute, value } => {
                any_value(attributes, attribute, |v| compare_values(v, value) != Ordering::Greater)
            }
            Filter::Substring {
                attribute,
                initial,
                any,
                last,
            } => any_value(attributes, attribute, |v| {
                substring_match(v, initial.as_deref(), any, last.as_deref())
            }),
        }
    }
}

/// Ordering used by filters and server-side sorting: numeric when both sides
/// are integers, otherwise case-insensitive.
pub fn compare_values(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<i64>(), right.trim().parse::<i64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.to_lowercase().cmp(&right.to_lowercase()),
    }
}

fn any_value(attributes: &AttributeSet, name: &str, pred: impl Fn(&str) -> bool) -> bool {
    attributes.get(name).is_some_and(|attribute| {
        attribute
            .values
            .iter()
            .any(|v| pred(&String::from_utf8_lossy(v.as_bytes())))
    })
}

fn squash(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn substring_match(value: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let value = value.to_lowercase();
    let mut rest = value.as_str();
    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        match rest.strip_prefix(initial.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(last.to_lowercase().as_str()),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> FilterError {
        FilterError {
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), FilterError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn filter(&mut self, depth: usize) -> Result<Filter, FilterError> {
        if depth > MAX_FILTER_DEPTH {
            return Err(self.error("filter nesting too deep"));
        }
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list(depth)?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list(depth)?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter(depth + 1)?))
            }
            Some(_) => self.item(Some(b')'))?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn list(&mut self, depth: usize) -> Result<Vec<Filter>, FilterError> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.filter(depth + 1)?);
        }
        Ok(filters)
    }

    /// A simple item, ending at `end` or at the end of input.
    fn item(&mut self, end: Option<u8>) -> Result<Filter, FilterError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'~' | b'>' | b'<') {
                break;
            }
            if b == b'(' || b == b')' {
                return Err(self.error("unexpected parenthesis in attribute name"));
            }
            self.pos += 1;
        }
        let attribute = String::from_utf8_lossy(&self.input[start..self.pos])
            .trim()
            .to_string();
        if attribute.is_empty() {
            return Err(self.error("missing attribute name"));
        }

        let op = match self.peek() {
            Some(b'=') => b'=',
            Some(op) => {
                self.pos += 1;
                if self.peek() != Some(b'=') {
                    return Err(self.error("expected '=' after comparison operator"));
                }
                op
            }
            None => return Err(self.error("missing comparison operator")),
        };
        self.pos += 1;

        let value_start = self.pos;
        while let Some(b) = self.peek() {
            if Some(b) == end {
                break;
            }
            if b == b'(' || b == b')' {
                return Err(self.error("unescaped parenthesis in value"));
            }
            self.pos += 1;
        }
        let raw = &self.input[value_start..self.pos];

        match op {
            b'~' => Ok(Filter::Approx {
                attribute,
                value: self.unescape(raw, value_start)?,
            }),
            b'>' => Ok(Filter::GreaterOrEqual {
                attribute,
                value: self.unescape(raw, value_start)?,
            }),
            b'<' => Ok(Filter::LessOrEqual {
                attribute,
                value: self.unescape(raw, value_start)?,
            }),
            _ if raw == b"*" => Ok(Filter::Present(attribute)),
            _ if raw.contains(&b'*') => self.substring(attribute, raw, value_start),
            _ => Ok(Filter::Equal {
                attribute,
                value: self.unescape(raw, value_start)?,
            }),
        }
    }

    fn substring(&self, attribute: String, raw: &[u8], offset: usize) -> Result<Filter, FilterError> {
        let parts: Vec<&[u8]> = raw.split(|b| *b == b'*').collect();
        let decode = |part: &[u8]| -> Result<Option<String>, FilterError> {
            if part.is_empty() {
                Ok(None)
            } else {
                self.unescape(part, offset).map(Some)
            }
        };
        let last_index = parts.len() - 1;
        let initial = decode(parts[0])?;
        let last = decode(parts[last_index])?;
        let mut any = Vec::new();
        for part in &parts[1..last_index] {
            if let Some(value) = decode(part)? {
                any.push(value);
            }
        }
        Ok(Filter::Substring {
            attribute,
            initial,
            any,
            last,
        })
    }

    fn unescape(&self, raw: &[u8], offset: usize) -> Result<String, FilterError> {
        let mut bytes = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            if raw[i] == b'\\' {
                let hex = raw
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| FilterError {
                        position: offset + i,
                        message: "invalid escape sequence".to_string(),
                    })?;
                bytes.push(hex);
                i += 3;
            } else {
                bytes.push(raw[i]);
                i += 1;
            }
        }
        String::from_utf8(bytes).map_err(|_| FilterError {
            position: offset,
            message: "value is not valid UTF-8".to_string(),
        })
    }
}
