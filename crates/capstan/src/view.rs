//! Point-in-time read views.
//!
//! A view fetches its snapshot lazily: the first use enqueues a single
//! command that locks the current index list and copies every tag's
//! details plus the converter map. From then on the view answers queries
//! without touching manager state; dropping it returns the index locks
//! through the actor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use streamidx::index::IndexFile;
use streamidx::query::{search_streams, ConverterAccess, Query, TagDetails};
use streamidx::{Chunk, Stream, StreamId, StreamSet};

use crate::converters::CachedConverter;
use crate::error::ManagerError;
use crate::manager::{find_stream, Command};

pub(crate) struct ViewSnapshot {
    pub indexes: Vec<Arc<IndexFile>>,
    pub releaser: Vec<Arc<IndexFile>>,
    pub tag_details: HashMap<String, TagDetails>,
    pub tag_converters: HashMap<String, Vec<String>>,
    pub converters: HashMap<String, Arc<CachedConverter>>,
}

impl ViewSnapshot {
    fn converter_access(&self) -> HashMap<String, Arc<dyn ConverterAccess>> {
        self.converters
            .iter()
            .map(|(name, converter)| (name.clone(), converter.clone() as Arc<dyn ConverterAccess>))
            .collect()
    }

    fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.indexes.iter().map(|i| i.reference_time()).min()
    }
}

/// Options for [`View::all_streams`] and [`View::search_streams`].
#[derive(Debug, Clone, Default)]
pub struct StreamsOptions {
    /// Tags whose view-local match state is refreshed for the visited
    /// streams before the callback runs.
    pub prefetch_tags: Vec<String>,
    pub prefetch_all_tags: bool,
    /// Result page size when the query has no `limit:` term; zero means
    /// unlimited.
    pub default_limit: usize,
    pub page: usize,
}

pub struct View {
    cmd_tx: mpsc::UnboundedSender<Command>,
    inner: Option<ViewSnapshot>,
}

impl View {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        View {
            cmd_tx,
            inner: None,
        }
    }

    async fn fetch(&mut self) -> std::result::Result<(), ManagerError> {
        if self.inner.is_some() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::FetchView(tx))
            .map_err(|_| ManagerError::Closed)?;
        self.inner = Some(rx.await.map_err(|_| ManagerError::Closed)?);
        Ok(())
    }

    /// Visits every stream, newest version first per id. Limits are not
    /// supported here.
    pub async fn all_streams<F>(&mut self, options: StreamsOptions, mut f: F) -> Result<()>
    where
        F: FnMut(StreamContext<'_>) -> Result<()>,
    {
        if options.default_limit != 0 || options.page != 0 {
            bail!("limits are not supported when listing all streams");
        }
        self.fetch().await?;
        let inner = self.inner.as_mut().unwrap();
        let prefetch = prefetch_list(inner, &options);
        prefetch_tags(inner, &prefetch, None)?;

        let inner = self.inner.as_ref().unwrap();
        let mut seen: HashSet<StreamId> = HashSet::new();
        for index in inner.indexes.iter().rev() {
            for stream in index.streams() {
                if !seen.insert(stream.id) {
                    continue;
                }
                f(StreamContext {
                    stream,
                    view: inner,
                })?;
            }
        }
        Ok(())
    }

    /// Evaluates a query and visits the matching streams in ascending id
    /// order. Returns whether paging cut the result off, and the offset
    /// that was applied.
    pub async fn search_streams<F>(
        &mut self,
        query: &Query,
        options: StreamsOptions,
        mut f: F,
    ) -> Result<(bool, usize)>
    where
        F: FnMut(StreamContext<'_>) -> Result<()>,
    {
        self.fetch().await?;
        let inner = self.inner.as_mut().unwrap();
        let limit = query.limit.unwrap_or(options.default_limit);
        let offset = options.page * limit;
        let reference = inner.reference_time().unwrap_or_else(Utc::now);
        let converters = inner.converter_access();
        let (ids, has_more) = search_streams(
            &inner.indexes,
            None,
            reference,
            &query.conditions,
            limit,
            offset,
            &inner.tag_details,
            &converters,
        )?;
        if ids.is_empty() {
            return Ok((has_more, offset));
        }

        let prefetch = prefetch_list(inner, &options);
        if !prefetch.is_empty() {
            let mask: StreamSet = ids.iter().copied().collect();
            prefetch_tags(inner, &prefetch, Some(&mask))?;
        }

        let inner = self.inner.as_ref().unwrap();
        for id in ids {
            if let Some(stream) = find_stream(&inner.indexes, id) {
                f(StreamContext {
                    stream,
                    view: inner,
                })?;
            }
        }
        Ok((has_more, offset))
    }

    /// Looks up a single stream by id.
    pub async fn stream(&mut self, id: StreamId) -> Result<Option<StreamContext<'_>>> {
        self.fetch().await?;
        let inner = self.inner.as_ref().unwrap();
        Ok(find_stream(&inner.indexes, id).map(|stream| StreamContext {
            stream,
            view: inner,
        }))
    }

    /// The earliest reference time across the snapshot's indexes.
    pub async fn reference_time(&mut self) -> Result<Option<DateTime<Utc>>> {
        self.fetch().await?;
        Ok(self.inner.as_ref().unwrap().reference_time())
    }

    /// Returns the index locks to the manager. Dropping the view does the
    /// same.
    pub fn release(self) {}
}

impl Drop for View {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = self.cmd_tx.send(Command::ReleaseIndexes(inner.releaser));
        }
    }
}

fn prefetch_list(inner: &ViewSnapshot, options: &StreamsOptions) -> Vec<String> {
    if options.prefetch_all_tags {
        inner.tag_details.keys().cloned().collect()
    } else {
        options.prefetch_tags.clone()
    }
}

/// Evaluates the requested tags' uncertain streams on the view's indexes
/// and folds the verdicts into the view-local copies. Referenced tags are
/// resolved before their dependents; the manager's authoritative state is
/// untouched.
fn prefetch_tags(
    inner: &mut ViewSnapshot,
    tags: &[String],
    mask: Option<&StreamSet>,
) -> Result<()> {
    if tags.is_empty() {
        return Ok(());
    }
    let mut pending: HashMap<String, StreamSet> = HashMap::new();
    for name in tags {
        if !inner.tag_details.contains_key(name) {
            bail!("tag {name:?} not defined");
        }
        collect_uncertain(inner, &mut pending, name, mask);
    }

    while !pending.is_empty() {
        let ready = pending
            .keys()
            .find(|name| {
                inner.tag_details[*name]
                    .conditions
                    .features()
                    .referenced_tags()
                    .all(|rt| !pending.contains_key(rt))
            })
            .cloned()
            .context("tag dependencies did not resolve")?;
        let uncertain = pending.remove(&ready).unwrap();

        let conditions = inner.tag_details[&ready].conditions.clone();
        let reference = inner.reference_time().unwrap_or_else(Utc::now);
        let converters = inner.converter_access();
        let (found, _) = search_streams(
            &inner.indexes,
            Some(&uncertain),
            reference,
            &conditions,
            0,
            0,
            &inner.tag_details,
            &converters,
        )?;
        let details = inner.tag_details.get_mut(&ready).unwrap();
        details.uncertain.subtract(&uncertain);
        details.matches.subtract(&uncertain);
        for id in found {
            details.matches.set(id);
        }
    }
    Ok(())
}

/// Gathers the per-tag uncertainty to resolve, following main references
/// with the parent's mask and subquery references unmasked.
fn collect_uncertain(
    inner: &ViewSnapshot,
    pending: &mut HashMap<String, StreamSet>,
    name: &str,
    mask: Option<&StreamSet>,
) {
    let Some(details) = inner.tag_details.get(name) else {
        return;
    };
    if details.uncertain.is_empty() {
        return;
    }
    let mut uncertain = details.uncertain.clone();
    if let Some(mask) = mask {
        uncertain.and(mask);
        if uncertain.is_empty() {
            return;
        }
    }
    if let Some(existing) = pending.get(name) {
        let mut fresh = uncertain.clone();
        fresh.subtract(existing);
        if fresh.is_empty() {
            return;
        }
        uncertain.or(existing);
    }
    pending.insert(name.to_string(), uncertain.clone());

    let features = details.conditions.features();
    for referenced in &features.sub_tags {
        collect_uncertain(inner, pending, referenced, None);
    }
    for referenced in &features.main_tags {
        collect_uncertain(inner, pending, referenced, Some(&uncertain));
    }
}

/// One stream as seen through a view.
pub struct StreamContext<'v> {
    stream: &'v Stream,
    view: &'v ViewSnapshot,
}

impl StreamContext<'_> {
    pub fn stream(&self) -> &Stream {
        self.stream
    }

    /// Whether the stream carries the tag, judged from the cached match
    /// bit. For streams still in the tag's uncertain set this is
    /// best-effort and answers `false`.
    pub fn has_tag(&self, name: &str) -> bool {
        match self.view.tag_details.get(name) {
            Some(details) if !details.uncertain.is_set(self.stream.id) => {
                details.matches.is_set(self.stream.id)
            }
            _ => false,
        }
    }

    pub fn all_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .view
            .tag_details
            .keys()
            .filter(|name| self.has_tag(name))
            .cloned()
            .collect();
        tags.sort();
        tags
    }

    /// Converters attached to any tag this stream carries.
    pub fn all_converters(&self) -> Vec<String> {
        let mut converters: Vec<String> = Vec::new();
        for (tag, attached) in &self.view.tag_converters {
            if !self.has_tag(tag) {
                continue;
            }
            for converter in attached {
                if !converters.contains(converter) {
                    converters.push(converter.clone());
                }
            }
        }
        converters.sort();
        converters
    }

    /// The stream's packets, optionally through a converter (converting
    /// and caching on miss).
    pub async fn data(&self, converter: Option<&str>) -> Result<Vec<Chunk>> {
        let Some(name) = converter else {
            return Ok(self.stream.packets.clone());
        };
        let converter = self
            .view
            .converters
            .get(name)
            .with_context(|| format!("invalid converter {name:?}"))?;
        let (packets, _, _) = converter.data(self.stream).await?;
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use streamidx::index::write_index;
    use tempfile::TempDir;

    fn stream(id: StreamId, payload: &str) -> Stream {
        Stream {
            id,
            client_host: "10.0.0.1".into(),
            client_port: 40000,
            server_host: "10.0.0.2".into(),
            server_port: 80,
            protocol: "tcp".into(),
            first_packet: Utc::now(),
            last_packet: Utc::now(),
            packets: vec![Chunk::client(payload.as_bytes().to_vec())],
        }
    }

    fn snapshot(dir: &TempDir, streams: Vec<Stream>) -> ViewSnapshot {
        let index = Arc::new(
            write_index(dir.path(), Utc::now(), streams)
                .unwrap()
                .unwrap(),
        );
        ViewSnapshot {
            indexes: vec![index.clone()],
            releaser: vec![index],
            tag_details: HashMap::new(),
            tag_converters: HashMap::new(),
            converters: HashMap::new(),
        }
    }

    fn details(query: &str, matches: &[StreamId], uncertain: &[StreamId]) -> TagDetails {
        TagDetails {
            matches: matches.iter().copied().collect(),
            uncertain: uncertain.iter().copied().collect(),
            conditions: Query::parse(query).unwrap().conditions,
        }
    }

    #[test]
    fn has_tag_is_best_effort_for_uncertain_streams() {
        let dir = TempDir::new().unwrap();
        let mut view = snapshot(&dir, vec![stream(0, "a"), stream(1, "b")]);
        view.tag_details
            .insert("service/http".into(), details("sport:80", &[0, 1], &[1]));
        view.tag_converters
            .insert("service/http".into(), vec!["ws".into()]);

        let idx = view.indexes[0].clone();
        let s0 = StreamContext {
            stream: idx.stream_by_id(0).unwrap(),
            view: &view,
        };
        assert!(s0.has_tag("service/http"));
        assert_eq!(s0.all_tags(), vec!["service/http"]);
        assert_eq!(s0.all_converters(), vec!["ws"]);

        let s1 = StreamContext {
            stream: idx.stream_by_id(1).unwrap(),
            view: &view,
        };
        assert!(!s1.has_tag("service/http"), "uncertain answers false");
        assert!(s1.all_converters().is_empty());
    }

    #[test]
    fn prefetch_resolves_uncertainty_locally() {
        let dir = TempDir::new().unwrap();
        let mut view = snapshot(
            &dir,
            vec![stream(0, "GET /"), stream(1, "POST /"), stream(2, "GET /x")],
        );
        view.tag_details.insert(
            "tag/gets".into(),
            details("data:\"GET\"", &[], &[0, 1, 2]),
        );

        prefetch_tags(&mut view, &["tag/gets".to_string()], None).unwrap();
        let details = &view.tag_details["tag/gets"];
        assert!(details.uncertain.is_empty());
        assert_eq!(details.matches.iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn prefetch_resolves_referenced_tags_first() {
        let dir = TempDir::new().unwrap();
        let mut view = snapshot(&dir, vec![stream(0, "GET /"), stream(1, "POST /")]);
        view.tag_details.insert(
            "service/http".into(),
            details("data:\"GET\"", &[], &[0, 1]),
        );
        view.tag_details.insert(
            "tag/slow".into(),
            details("service:http", &[], &[0, 1]),
        );

        prefetch_tags(&mut view, &["tag/slow".to_string()], None).unwrap();
        assert!(view.tag_details["service/http"].uncertain.is_empty());
        assert!(view.tag_details["tag/slow"].uncertain.is_empty());
        assert_eq!(
            view.tag_details["tag/slow"].matches.iter().collect::<Vec<_>>(),
            vec![0]
        );
    }

    #[test]
    fn prefetch_respects_masks() {
        let dir = TempDir::new().unwrap();
        let mut view = snapshot(
            &dir,
            vec![stream(0, "GET /"), stream(1, "GET /a"), stream(2, "GET /b")],
        );
        view.tag_details.insert(
            "tag/gets".into(),
            details("data:\"GET\"", &[], &[0, 1, 2]),
        );

        let mask: StreamSet = [1u64].into_iter().collect();
        prefetch_tags(&mut view, &["tag/gets".to_string()], Some(&mask)).unwrap();
        let details = &view.tag_details["tag/gets"];
        // Only the masked stream was evaluated; the rest stays uncertain.
        assert_eq!(details.uncertain.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(details.matches.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn prefetch_of_unknown_tag_fails() {
        let dir = TempDir::new().unwrap();
        let mut view = snapshot(&dir, vec![stream(0, "x")]);
        assert!(prefetch_tags(&mut view, &["tag/nope".to_string()], None).is_err());
    }
}
