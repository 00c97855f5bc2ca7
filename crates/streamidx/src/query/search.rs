//! Query evaluation over a set of index readers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use regex::bytes::Regex;

use super::{CmpOp, Conditions, Side, Term};
use crate::bitmask::StreamSet;
use crate::index::IndexFile;
use crate::stream::{Direction, Stream, StreamId};

/// Concatenated per-direction bytes of a converted stream, with the
/// cumulative per-chunk offsets the search engine uses to map a match back
/// to its packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchableData {
    pub client: Vec<u8>,
    pub server: Vec<u8>,
    /// Cumulative (client, server) byte counts, starting at `[0, 0]` and
    /// gaining one entry per non-empty chunk.
    pub offsets: Vec<[u64; 2]>,
}

/// Read access to converted stream bytes, implemented by the converter
/// cache. Returns `None` for streams that have not been converted yet.
pub trait ConverterAccess: Send + Sync {
    fn data_for_search(&self, id: StreamId) -> Result<Option<SearchableData>>;
}

/// Snapshot of one tag's state as consumed by evaluation and by views.
#[derive(Debug, Clone, Default)]
pub struct TagDetails {
    pub matches: StreamSet,
    pub uncertain: StreamSet,
    pub conditions: Conditions,
}

/// Evaluates `conditions` over the index set, newest index first (a later
/// index supersedes earlier copies of the same stream id). When `active`
/// is given, only ids in it are considered. Returns ascending matching ids
/// and whether paging cut the result off.
///
/// Tag terms consult `tag_details`; callers are responsible for only
/// searching with referenced tags whose uncertainty has been resolved.
#[allow(clippy::too_many_arguments)]
pub fn search_streams(
    indexes: &[Arc<IndexFile>],
    active: Option<&StreamSet>,
    reference_time: DateTime<Utc>,
    conditions: &Conditions,
    limit: usize,
    offset: usize,
    tag_details: &HashMap<String, TagDetails>,
    converters: &HashMap<String, Arc<dyn ConverterAccess>>,
) -> Result<(Vec<StreamId>, bool)> {
    let mut regexes: HashMap<&str, Regex> = HashMap::new();
    for c in &conditions.0 {
        if let Term::Data { pattern, .. } = &c.term {
            if !regexes.contains_key(pattern.as_str()) {
                let re = Regex::new(pattern)
                    .with_context(|| format!("bad data pattern {pattern:?}"))?;
                regexes.insert(pattern, re);
            }
        }
    }

    let mut matches = Vec::new();
    let mut seen: HashSet<StreamId> = HashSet::new();
    for index in indexes.iter().rev() {
        for stream in index.streams() {
            if !seen.insert(stream.id) {
                continue;
            }
            if let Some(mask) = active {
                if !mask.is_set(stream.id) {
                    continue;
                }
            }
            if evaluate(
                conditions,
                stream,
                reference_time,
                &regexes,
                tag_details,
                converters,
            )? {
                matches.push(stream.id);
            }
        }
    }
    matches.sort_unstable();

    if limit == 0 {
        return Ok((matches, false));
    }
    let total = matches.len();
    let start = offset.min(total);
    let end = (offset + limit).min(total);
    let has_more = total > end;
    Ok((matches[start..end].to_vec(), has_more))
}

fn evaluate(
    conditions: &Conditions,
    stream: &Stream,
    reference_time: DateTime<Utc>,
    regexes: &HashMap<&str, Regex>,
    tag_details: &HashMap<String, TagDetails>,
    converters: &HashMap<String, Arc<dyn ConverterAccess>>,
) -> Result<bool> {
    for c in &conditions.0 {
        let hit = match &c.term {
            Term::Ids(ids) => ids.contains(&stream.id),
            Term::Data {
                direction,
                converter,
                pattern,
            } => {
                let re = &regexes[pattern.as_str()];
                match converter {
                    Some(name) => {
                        let access = converters
                            .get(name)
                            .with_context(|| format!("unknown converter {name:?}"))?;
                        match access.data_for_search(stream.id)? {
                            // Not converted yet: nothing to match on.
                            None => false,
                            Some(data) => match direction {
                                Some(Direction::ClientToServer) => re.is_match(&data.client),
                                Some(Direction::ServerToClient) => re.is_match(&data.server),
                                None => re.is_match(&data.client) || re.is_match(&data.server),
                            },
                        }
                    }
                    None => match direction {
                        Some(d) => re.is_match(&stream.direction_data(*d)),
                        None => {
                            re.is_match(&stream.direction_data(Direction::ClientToServer))
                                || re.is_match(&stream.direction_data(Direction::ServerToClient))
                        }
                    },
                }
            }
            Term::TimeAbsolute { op, at } => match op {
                CmpOp::After => stream.first_packet > *at,
                CmpOp::Before => stream.first_packet < *at,
            },
            Term::TimeRelative { op, offset } => {
                let pivot = reference_time + *offset;
                match op {
                    CmpOp::After => stream.first_packet > pivot,
                    CmpOp::Before => stream.first_packet < pivot,
                }
            }
            Term::Host { side, value } => match side {
                Side::Client => stream.client_host == *value,
                Side::Server => stream.server_host == *value,
            },
            Term::Port { side, value } => match side {
                Side::Client => stream.client_port == *value,
                Side::Server => stream.server_port == *value,
            },
            Term::Protocol(p) => stream.protocol.eq_ignore_ascii_case(p),
            Term::Tag(name) => match tag_details.get(name) {
                Some(details) => details.matches.is_set(stream.id),
                None => bail!("unknown tag {name:?}"),
            },
        };
        if hit == c.negated {
            return Ok(false);
        }
    }
    Ok(true)
}
