// Line grammar
//
//   MM/DD/YY HH:MM:SS.mmm CATEGORY message
//   <indent>(Above Line Repeated M Times)
//   <indent>(Above N Lines Repeated M Times)

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

const TIMESTAMP_LEN: usize = 21;
const TIMESTAMP_FORMAT: &str = "%m/%d/%y %H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Category {
    #[serde(rename = "TCP/IP")]
    TcpIp,
    #[serde(rename = "DLL-IN")]
    DllIn,
    #[serde(rename = "DLL-EX")]
    DllEx,
    #[serde(rename = "SERIAL")]
    Serial,
    #[serde(rename = "SVREPS")]
    Svreps,
    #[serde(rename = "METRIC")]
    Metric,
    #[serde(rename = "MTXPOS")]
    Mtxpos,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::TcpIp,
        Category::DllIn,
        Category::DllEx,
        Category::Serial,
        Category::Svreps,
        Category::Metric,
        Category::Mtxpos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::TcpIp => "TCP/IP",
            Category::DllIn => "DLL-IN",
            Category::DllEx => "DLL-EX",
            Category::Serial => "SERIAL",
            Category::Svreps => "SVREPS",
            Category::Metric => "METRIC",
            Category::Mtxpos => "MTXPOS",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalEntry {
    /// 1-based line in the source file; expanded copies keep the original's number.
    pub line_number: usize,
    pub timestamp: NaiveDateTime,
    pub category: Category,
    pub message: String,
    pub is_expanded: bool,
    /// Repeat count of the directive that produced this copy, 1 otherwise.
    pub expansion_count: u32,
}

/// `(Above N Lines Repeated M Times)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatDirective {
    pub line_count: usize,
    pub repeat_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Entry(JournalEntry),
    Repeat(RepeatDirective),
}

/// Parse one line (without its terminator). `None` for blank or unrecognized lines.
pub fn parse_line(raw: &str, line_number: usize) -> Option<ParsedLine> {
    if let Some(directive) = parse_repeat(raw) {
        return Some(ParsedLine::Repeat(directive));
    }
    parse_entry(raw, line_number).map(ParsedLine::Entry)
}

/// Timestamp at the start of a line, if it has one.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let stamp = raw.get(..TIMESTAMP_LEN)?;
    if !timestamp_shape_matches(stamp.as_bytes()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

fn timestamp_shape_matches(bytes: &[u8]) -> bool {
    bytes.iter().enumerate().all(|(i, b)| match i {
        2 | 5 => *b == b'/',
        8 => *b == b' ',
        11 | 14 => *b == b':',
        17 => *b == b'.',
        _ => b.is_ascii_digit(),
    })
}

fn parse_entry(raw: &str, line_number: usize) -> Option<JournalEntry> {
    let timestamp = parse_timestamp(raw)?;
    let rest = raw[TIMESTAMP_LEN..].strip_prefix(' ')?;

    Category::ALL.iter().find_map(|category| {
        let after = rest.strip_prefix(category.as_str())?;
        let message = if after.is_empty() {
            ""
        } else {
            after.strip_prefix(' ')?
        };
        Some(JournalEntry {
            line_number,
            timestamp,
            category: *category,
            message: message.trim_end().to_string(),
            is_expanded: false,
            expansion_count: 1,
        })
    })
}

fn parse_repeat(raw: &str) -> Option<RepeatDirective> {
    // Directives are always indented.
    if !raw.starts_with(char::is_whitespace) {
        return None;
    }
    let body = raw.trim().strip_prefix("(Above ")?.strip_suffix(')')?;

    let (line_count, body) = match split_number(body) {
        Some((n, tail)) => (usize::try_from(n).ok()?, tail.strip_prefix(' ')?),
        None => (1, body),
    };
    let body = body.strip_prefix("Line")?;
    let body = body.strip_prefix('s').unwrap_or(body);
    let body = body.strip_prefix(" Repeated ")?;
    let (repeat_count, tail) = split_number(body)?;
    let tail = tail.strip_prefix(" Time")?;
    if !(tail.is_empty() || tail == "s") {
        return None;
    }

    Some(RepeatDirective {
        line_count,
        repeat_count: u32::try_from(repeat_count).ok()?,
    })
}

fn split_number(s: &str) -> Option<(u64, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let n = s[..end].parse().ok()?;
    Some((n, &s[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn entry(raw: &str) -> JournalEntry {
        match parse_line(raw, 1) {
            Some(ParsedLine::Entry(entry)) => entry,
            other => panic!("expected entry for {:?}, got {:?}", raw, other),
        }
    }

    #[test]
    fn parses_standard_line() {
        let e = entry("11/30/25 14:02:07.481 TCP/IP Connected to 10.0.0.5:443  ");
        assert_eq!(e.category, Category::TcpIp);
        assert_eq!(e.message, "Connected to 10.0.0.5:443");
        assert_eq!(e.timestamp.year(), 2025);
        assert_eq!(e.timestamp.month(), 11);
        assert_eq!(e.timestamp.second(), 7);
        assert_eq!(e.timestamp.nanosecond(), 481_000_000);
        assert!(!e.is_expanded);
        assert_eq!(e.expansion_count, 1);
    }

    #[test]
    fn parses_every_category() {
        for category in Category::ALL {
            let raw = format!("01/02/24 03:04:05.006 {} payload", category);
            assert_eq!(entry(&raw).category, category);
        }
    }

    #[test]
    fn rejects_unknown_or_malformed_lines() {
        assert_eq!(parse_line("", 1), None);
        assert_eq!(parse_line("01/02/24 03:04:05.006 HTTP GET /", 1), None);
        assert_eq!(parse_line("1/02/24 03:04:05.006 SERIAL x", 1), None);
        assert_eq!(parse_line("13/40/24 03:04:05.006 SERIAL x", 1), None);
        assert_eq!(parse_line("01/02/24 03:04:05.006 SERIALX x", 1), None);
        assert_eq!(parse_line("\u{fffd}\u{fffd} garbage", 1), None);
    }

    #[test]
    fn parses_repeat_directives() {
        assert_eq!(
            parse_line("                  (Above Line Repeated 609 Times)", 9),
            Some(ParsedLine::Repeat(RepeatDirective {
                line_count: 1,
                repeat_count: 609
            }))
        );
        assert_eq!(
            parse_line("\t(Above 2 Lines Repeated 1 Time)", 9),
            Some(ParsedLine::Repeat(RepeatDirective {
                line_count: 2,
                repeat_count: 1
            }))
        );
        // Must be indented
        assert_eq!(parse_line("(Above Line Repeated 3 Times)", 9), None);
        assert_eq!(parse_line("  (Above Line Repeated many Times)", 9), None);
    }
}
