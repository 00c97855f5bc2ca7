//! The stream query language.
//!
//! A query is a whitespace-separated conjunction of `key:value` terms.
//! Prefixing a term with `-` negates it; prefixing with `@` makes it a
//! subquery occurrence, which changes how tag invalidation treats it (a
//! dependent tag is fully re-evaluated when a subquery-referenced tag
//! becomes uncertain). Supported keys:
//!
//! - `id:3,5,7` / `id:-1` — explicit id sets (`-1` is the empty set)
//! - `data:"re"`, `cdata:"re"`, `sdata:"re"`, `data.<converter>:"re"`
//! - `time:>2024-01-01T00:00:00Z`, `time:<...`, `time:>-5m` (relative)
//! - `chost:`/`shost:`/`cport:`/`sport:`/`protocol:`
//! - `tag:x`, `service:x`, `mark:x`, `generated:x` — references to the
//!   tag named `<key>/<x>`
//! - `group:<key>`, `limit:<n>`, `sort:id`

mod parse;
mod search;

pub use parse::ParseError;
pub use search::{search_streams, ConverterAccess, SearchableData, TagDetails};

use chrono::{DateTime, Duration, Utc};

use crate::bitmask::StreamSet;
use crate::stream::{Direction, StreamId};

/// Predicate kinds a query can use, split by main/subquery occurrence.
pub mod feature {
    pub const ID: u32 = 1 << 0;
    pub const DATA: u32 = 1 << 1;
    pub const TIME_ABSOLUTE: u32 = 1 << 2;
    pub const TIME_RELATIVE: u32 = 1 << 3;
    pub const HOST: u32 = 1 << 4;
    pub const PORT: u32 = 1 << 5;
    pub const PROTOCOL: u32 = 1 << 6;

    /// Features whose verdict can change when stream bytes change.
    pub const DATA_OR_TIME: u32 = DATA | TIME_ABSOLUTE | TIME_RELATIVE;
}

/// Which predicate kinds and tag references a parsed query uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub main: u32,
    pub sub: u32,
    pub main_tags: Vec<String>,
    pub sub_tags: Vec<String>,
}

impl FeatureSet {
    /// All referenced tag names, main references first.
    pub fn referenced_tags(&self) -> impl Iterator<Item = &str> {
        self.main_tags
            .iter()
            .chain(self.sub_tags.iter())
            .map(String::as_str)
    }

    pub fn uses(&self, flags: u32) -> bool {
        (self.main | self.sub) & flags != 0
    }

    pub fn references_tags(&self) -> bool {
        !self.main_tags.is_empty() || !self.sub_tags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// Explicit id set; empty means "no stream".
    Ids(Vec<StreamId>),
    Data {
        direction: Option<Direction>,
        converter: Option<String>,
        pattern: String,
    },
    TimeAbsolute {
        op: CmpOp,
        at: DateTime<Utc>,
    },
    TimeRelative {
        op: CmpOp,
        offset: Duration,
    },
    Host {
        side: Side,
        value: String,
    },
    Port {
        side: Side,
        value: u16,
    },
    Protocol(String),
    /// Full name of the referenced tag, e.g. `service/http`.
    Tag(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub negated: bool,
    pub subquery: bool,
    pub term: Term,
}

/// The conjunction of all filter terms of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions(pub Vec<Condition>);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub conditions: Conditions,
    pub grouping: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn parse(input: &str) -> Result<Query, ParseError> {
        parse::parse(input)
    }
}

impl Conditions {
    pub fn features(&self) -> FeatureSet {
        let mut fs = FeatureSet::default();
        for c in &self.0 {
            let (flags, tags) = if c.subquery {
                (&mut fs.sub, &mut fs.sub_tags)
            } else {
                (&mut fs.main, &mut fs.main_tags)
            };
            match &c.term {
                Term::Ids(_) => *flags |= feature::ID,
                Term::Data { .. } => *flags |= feature::DATA,
                Term::TimeAbsolute { .. } => *flags |= feature::TIME_ABSOLUTE,
                Term::TimeRelative { .. } => *flags |= feature::TIME_RELATIVE,
                Term::Host { .. } => *flags |= feature::HOST,
                Term::Port { .. } => *flags |= feature::PORT,
                Term::Protocol(_) => *flags |= feature::PROTOCOL,
                Term::Tag(name) => {
                    if !tags.iter().any(|t| t == name) {
                        tags.push(name.clone());
                    }
                }
            }
        }
        fs
    }

    /// Reduces the query to an explicit id set when it consists purely of
    /// positive main-query id terms. Ids at or above `next_id` are dropped.
    pub fn stream_ids(&self, next_id: StreamId) -> Option<StreamSet> {
        if self.0.is_empty() {
            return None;
        }
        let mut result: Option<StreamSet> = None;
        for c in &self.0 {
            if c.negated || c.subquery {
                return None;
            }
            let Term::Ids(ids) = &c.term else {
                return None;
            };
            let set: StreamSet = ids.iter().copied().filter(|&id| id < next_id).collect();
            match &mut result {
                None => result = Some(set),
                Some(r) => r.and(&set),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_split_main_and_subquery() {
        let q = Query::parse("service:http @tag:slow data:\"GET\" @data:\"500\"").unwrap();
        let fs = q.conditions.features();
        assert_eq!(fs.main_tags, vec!["service/http"]);
        assert_eq!(fs.sub_tags, vec!["tag/slow"]);
        assert_eq!(fs.main, feature::DATA);
        assert_eq!(fs.sub, feature::DATA);
        assert_eq!(
            fs.referenced_tags().collect::<Vec<_>>(),
            vec!["service/http", "tag/slow"]
        );
    }

    #[test]
    fn features_of_attribute_terms() {
        let q = Query::parse("cport:80 protocol:tcp shost:10.0.0.2").unwrap();
        let fs = q.conditions.features();
        assert_eq!(fs.main, feature::PORT | feature::PROTOCOL | feature::HOST);
        assert!(!fs.uses(feature::DATA_OR_TIME));
        assert!(!fs.references_tags());
    }

    #[test]
    fn stream_ids_reduces_pure_id_queries() {
        let q = Query::parse("id:3,7,9").unwrap();
        let ids = q.conditions.stream_ids(8).unwrap();
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![3, 7]);

        let empty = Query::parse("id:-1").unwrap();
        assert!(empty.conditions.stream_ids(100).unwrap().is_empty());
    }

    #[test]
    fn stream_ids_intersects_multiple_terms() {
        let q = Query::parse("id:1,2,3 id:2,3,4").unwrap();
        let ids = q.conditions.stream_ids(100).unwrap();
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn stream_ids_rejects_non_id_queries() {
        assert!(Query::parse("data:\"x\"").unwrap().conditions.stream_ids(10).is_none());
        assert!(Query::parse("-id:3").unwrap().conditions.stream_ids(10).is_none());
        assert!(Query::parse("@id:3").unwrap().conditions.stream_ids(10).is_none());
        assert!(Query::parse("").unwrap().conditions.stream_ids(10).is_none());
    }

    #[test]
    fn grouping_and_limit_are_captured() {
        let q = Query::parse("service:http group:chost limit:20 sort:id").unwrap();
        assert_eq!(q.grouping.as_deref(), Some("chost"));
        assert_eq!(q.limit, Some(20));
    }
}
