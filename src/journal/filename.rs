use chrono::NaiveDate;
use serde::Serialize;

/// Lane and date encoded in a journal file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub lane: u32,
    pub log_date: Option<NaiveDate>,
}

/// Recognizes `jrnlNNNN-YYYYMMDD.txt` (lane and date) and `jrnlNNNN.txt`
/// (lane only). Anything else yields lane 0 and no date.
pub fn parse_file_name(file_name: &str) -> FileMetadata {
    let (lane, log_date) = match file_name
        .strip_prefix("jrnl")
        .and_then(|s| s.strip_suffix(".txt"))
    {
        Some(stem) => parse_stem(stem).unwrap_or((0, None)),
        None => (0, None),
    };

    FileMetadata {
        file_name: file_name.to_string(),
        lane,
        log_date,
    }
}

fn parse_stem(stem: &str) -> Option<(u32, Option<NaiveDate>)> {
    let (lane, date) = match stem.split_once('-') {
        Some((lane, date)) => (lane, Some(date)),
        None => (stem, None),
    };
    if lane.len() != 4 || !lane.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let lane = lane.parse().ok()?;

    match date {
        None => Some((lane, None)),
        Some(date) if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) => {
            Some((lane, NaiveDate::parse_from_str(date, "%Y%m%d").ok()))
        }
        Some(_) => None,
    }
}
