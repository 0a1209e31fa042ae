use super::line::{JournalEntry, RepeatDirective};
use std::collections::VecDeque;

pub const DEFAULT_LOOKBACK: usize = 20;

/// Materializes repeat directives from a ring buffer of recent entries.
///
/// Expanded copies are emitted but never pushed back into the buffer, so a
/// directive only ever replays lines that appeared literally in the file.
#[derive(Debug)]
pub struct RepeatExpander {
    buffer: VecDeque<JournalEntry>,
    lookback: usize,
}

impl Default for RepeatExpander {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKBACK)
    }
}

impl RepeatExpander {
    pub fn new(lookback: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(lookback),
            lookback,
        }
    }

    pub fn push(&mut self, entry: JournalEntry, out: &mut Vec<JournalEntry>) {
        if self.lookback > 0 {
            if self.buffer.len() == self.lookback {
                self.buffer.pop_front();
            }
            self.buffer.push_back(entry.clone());
        }
        out.push(entry);
    }

    /// Entries `directive` would produce against the current buffer.
    pub fn expansion_size(&self, directive: RepeatDirective) -> u64 {
        directive.line_count.min(self.buffer.len()) as u64 * u64::from(directive.repeat_count)
    }

    /// Replay the last `line_count` buffered entries `repeat_count` times.
    /// Returns how many entries were produced.
    pub fn expand(&mut self, directive: RepeatDirective, out: &mut Vec<JournalEntry>) -> usize {
        let take = directive.line_count.min(self.buffer.len());
        if take == 0 {
            return 0;
        }
        let start = self.buffer.len() - take;
        let before = out.len();
        for _ in 0..directive.repeat_count {
            out.extend(self.buffer.range(start..).map(|line| JournalEntry {
                is_expanded: true,
                expansion_count: directive.repeat_count,
                ..line.clone()
            }));
        }
        out.len() - before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::line::Category;
    use chrono::NaiveDate;

    fn line(n: usize, message: &str) -> JournalEntry {
        JournalEntry {
            line_number: n,
            timestamp: NaiveDate::from_ymd_opt(2025, 11, 30)
                .unwrap()
                .and_hms_milli_opt(8, 0, 0, 0)
                .unwrap(),
            category: Category::Serial,
            message: message.to_string(),
            is_expanded: false,
            expansion_count: 1,
        }
    }

    #[test]
    fn replays_last_lines() {
        let mut expander = RepeatExpander::default();
        let mut out = Vec::new();
        expander.push(line(1, "a"), &mut out);
        expander.push(line(2, "b"), &mut out);
        expander.push(line(3, "c"), &mut out);

        let produced = expander.expand(
            RepeatDirective {
                line_count: 2,
                repeat_count: 2,
            },
            &mut out,
        );

        assert_eq!(produced, 4);
        let messages: Vec<&str> = out.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c", "b", "c", "b", "c"]);
        assert!(out[3..].iter().all(|e| e.is_expanded && e.expansion_count == 2));
        assert_eq!(out[3].line_number, 2);
    }

    #[test]
    fn expanded_lines_are_not_rebuffered() {
        let mut expander = RepeatExpander::default();
        let mut out = Vec::new();
        expander.push(line(1, "a"), &mut out);
        expander.expand(
            RepeatDirective {
                line_count: 1,
                repeat_count: 3,
            },
            &mut out,
        );
        // A second directive still sees only the literal line.
        expander.expand(
            RepeatDirective {
                line_count: 5,
                repeat_count: 1,
            },
            &mut out,
        );
        assert_eq!(out.len(), 1 + 3 + 1);
    }

    #[test]
    fn lookback_is_bounded() {
        let mut expander = RepeatExpander::new(2);
        let mut out = Vec::new();
        for (i, m) in ["a", "b", "c"].iter().enumerate() {
            expander.push(line(i + 1, m), &mut out);
        }
        out.clear();
        expander.expand(
            RepeatDirective {
                line_count: 10,
                repeat_count: 1,
            },
            &mut out,
        );
        let messages: Vec<&str> = out.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn expansion_size_counts_available_lines() {
        let mut expander = RepeatExpander::default();
        let mut out = Vec::new();
        for i in 0..3 {
            expander.push(line(i + 1, "x"), &mut out);
        }
        let directive = RepeatDirective {
            line_count: 20,
            repeat_count: u32::MAX,
        };
        assert_eq!(expander.expansion_size(directive), 3 * u64::from(u32::MAX));
    }

    #[test]
    fn directive_before_any_line_is_ignored() {
        let mut expander = RepeatExpander::default();
        let mut out = Vec::new();
        let produced = expander.expand(
            RepeatDirective {
                line_count: 1,
                repeat_count: 10,
            },
            &mut out,
        );
        assert_eq!(produced, 0);
        assert!(out.is_empty());
    }
}
