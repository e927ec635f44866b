//! Timeline history files.
//!
//! A `<TLI>.history` file lists, oldest first, every timeline the server
//! forked away from and the LSN at which the switch happened.

use crate::pg::lsn::Lsn;
use crate::{Error, Result};

/// One timeline in a server's ancestry. `end` is the LSN at which the server
/// switched off this timeline; the newest timeline is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: u32,
    pub begin: Lsn,
    pub end: Lsn,
}

/// Parse the content of a history file for `current_tli`.
///
/// Lines look like `2\t0/6000000\tbefore 2000-01-01 ...`; comment and blank
/// lines are ignored. The current timeline is appended with an open end.
pub fn parse_history(content: &str, current_tli: u32) -> Result<Vec<TimelineHistoryEntry>> {
    let mut entries: Vec<TimelineHistoryEntry> = Vec::new();
    let mut begin = Lsn::INVALID;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(tli_field), Some(lsn_field)) = (fields.next(), fields.next()) else {
            return Err(Error::Protocol(format!("malformed history line: {line:?}")).into());
        };
        let tli: u32 = tli_field
            .parse()
            .map_err(|_| Error::Protocol(format!("malformed history timeline: {line:?}")))?;
        let end: Lsn = lsn_field
            .parse()
            .map_err(|_| Error::Protocol(format!("malformed history lsn: {line:?}")))?;

        if let Some(last) = entries.last() {
            if tli <= last.tli {
                return Err(
                    Error::Protocol(format!("history timelines not ascending at {tli}")).into(),
                );
            }
        }
        entries.push(TimelineHistoryEntry { tli, begin, end });
        begin = end;
    }

    if let Some(last) = entries.last() {
        if last.tli >= current_tli {
            return Err(Error::Protocol(format!(
                "history lists timeline {} at or beyond the current timeline {}",
                last.tli, current_tli
            ))
            .into());
        }
    }
    entries.push(TimelineHistoryEntry {
        tli: current_tli,
        begin,
        end: Lsn::INVALID,
    });

    Ok(entries)
}

/// True when a `(timeline, lsn)` position lies on the given history, i.e. the
/// timeline is an ancestor (or the current timeline) and the position does not
/// run past the switch point out of it.
pub fn satisfy_timeline(history: &[TimelineHistoryEntry], tli: u32, lsn: Lsn) -> bool {
    history
        .iter()
        .any(|entry| entry.tli == tli && (!entry.end.is_valid() || lsn <= entry.end))
}
