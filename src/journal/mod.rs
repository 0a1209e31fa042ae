//! Point-of-sale journal log parsing.
//!
//! Policy for damaged input:
//! - blank and unrecognized lines are skipped and counted;
//! - invalid UTF-8 is replaced, never rejected;
//! - a final line without a newline that does not parse is treated as a
//!   truncated upload: the rest of the file is accepted and the dropped
//!   bytes are reported;
//! - a file with content but no recognizable entry is malformed;
//! - a file whose entries, repeats expanded, would exceed
//!   [`ParseOptions::max_entries`] is malformed.

mod filename;
mod identity;
mod line;
mod repeat;

pub use filename::{parse_file_name, FileMetadata};
pub use identity::{content_sha256, extract_identity, FileIdentity, DEFAULT_IDENTITY_SCAN};
pub use line::{parse_line, Category, JournalEntry, ParsedLine, RepeatDirective};
pub use repeat::{RepeatExpander, DEFAULT_LOOKBACK};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no recognizable journal lines in {lines} non-blank line(s)")]
    NoRecognizedLines { lines: usize },

    #[error("line {line} would grow the file past {limit} entries")]
    TooManyEntries { line: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Upper bound on entries, expanded repeats included.
    pub max_entries: usize,
    /// Leading literal entries scanned for [`FileIdentity`].
    pub identity_scan_entries: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_entries: 1_000_000,
            identity_scan_entries: DEFAULT_IDENTITY_SCAN,
        }
    }
}

/// A fully parsed journal file.
#[derive(Debug, Clone)]
pub struct ParsedJournal {
    /// File metadata with `log_date` resolved from the first entry when the
    /// file name does not carry one.
    pub metadata: FileMetadata,
    pub identity: FileIdentity,
    pub entries: Vec<JournalEntry>,
    pub total_lines: usize,
    pub skipped_lines: usize,
    pub repeat_directives: usize,
    /// Bytes of an unterminated, unparseable final line.
    pub truncated_bytes: usize,
}

impl ParsedJournal {
    pub fn expanded_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.is_expanded).count()
    }
}

pub fn parse_journal(file_name: &str, content: &[u8]) -> Result<ParsedJournal, ParseError> {
    parse_journal_with(file_name, content, &ParseOptions::default())
}

pub fn parse_journal_with(
    file_name: &str,
    content: &[u8],
    options: &ParseOptions,
) -> Result<ParsedJournal, ParseError> {
    let mut metadata = parse_file_name(file_name);
    let mut expander = RepeatExpander::default();
    let mut entries = Vec::new();
    let mut total_lines = 0;
    let mut skipped_lines = 0;
    let mut non_blank = 0;
    let mut repeat_directives = 0;
    let mut truncated_bytes = 0;

    let unterminated_tail = !content.is_empty() && !content.ends_with(b"\n");
    let mut lines = content.split(|b| *b == b'\n').peekable();

    while let Some(raw) = lines.next() {
        let is_last = lines.peek().is_none();
        // `split` yields an empty tail after a trailing newline
        if is_last && raw.is_empty() {
            break;
        }
        total_lines += 1;

        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = String::from_utf8_lossy(raw);
        if text.trim().is_empty() {
            continue;
        }
        non_blank += 1;

        let too_many = ParseError::TooManyEntries {
            line: total_lines,
            limit: options.max_entries,
        };
        match parse_line(&text, total_lines) {
            Some(ParsedLine::Entry(entry)) => {
                if entries.len() >= options.max_entries {
                    return Err(too_many);
                }
                expander.push(entry, &mut entries);
            }
            Some(ParsedLine::Repeat(directive)) => {
                repeat_directives += 1;
                let room = options.max_entries.saturating_sub(entries.len()) as u64;
                if expander.expansion_size(directive) > room {
                    return Err(too_many);
                }
                expander.expand(directive, &mut entries);
            }
            None if is_last && unterminated_tail => {
                truncated_bytes = raw.len();
                warn!(
                    file_name,
                    line = total_lines,
                    bytes = truncated_bytes,
                    "Dropping truncated final line"
                );
            }
            None => skipped_lines += 1,
        }
    }

    if entries.is_empty() && non_blank > 0 {
        return Err(ParseError::NoRecognizedLines { lines: non_blank });
    }

    if metadata.log_date.is_none() {
        metadata.log_date = entries.first().map(|e| e.timestamp.date());
    }

    let identity = extract_identity(content, &entries, options.identity_scan_entries);

    Ok(ParsedJournal {
        metadata,
        identity,
        entries,
        total_lines,
        skipped_lines,
        repeat_directives,
        truncated_bytes,
    })
}
