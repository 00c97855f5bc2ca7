//! The stream manager: a single-writer command actor.
//!
//! All mutable state lives in [`ManagerState`], owned by one tokio task
//! that drains an unbounded command queue. External entry points enqueue a
//! tagged [`Command`] and, when they need an answer, rendezvous on a
//! oneshot reply. Background jobs receive immutable snapshots and post
//! completion commands; no lock is ever taken over manager state.

mod jobs;
mod pool;
mod tags;

pub(crate) use tags::Tag;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use streamidx::builder::{IndexBuilder, PcapInfo};
use streamidx::index::IndexFile;
use streamidx::query::ConverterAccess;
use streamidx::{Stream, StreamId, StreamSet};

use crate::config::{assert_dir_rwx, CapstanConfig};
use crate::converters::{
    valid_converter_name, CachedConverter, ConverterStats, RESERVED_CONVERTER_NAME,
};
use crate::error::{config_err, not_found, ManagerError, Result};
use crate::filters::Filter;
use crate::state::{self, StateFile, TagRecord};
use crate::view::{View, ViewSnapshot};
use crate::watcher::{watch_converter_dir, ConverterEvent, WatcherHandle};

use jobs::{ConvertOutcome, ImportOutcome, MergeOutcome, TaggingOutcome};
use pool::ReleasePool;

#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub import_job_count: usize,
    pub index_count: usize,
    pub index_lock_count: usize,
    pub pcap_count: usize,
    pub stream_count: u64,
    pub packet_count: u64,
    pub merge_job_running: bool,
    pub tagging_job_running: bool,
    pub converter_job_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagInfo {
    pub name: String,
    pub definition: String,
    pub color: String,
    pub matching_count: u64,
    pub uncertain_count: u64,
    pub referenced: bool,
    pub converters: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum UpdateTagOp {
    MarkAdd(Vec<StreamId>),
    MarkDel(Vec<StreamId>),
    SetColor(String),
    SetConverters(Vec<String>),
}

pub(crate) enum Command {
    Status(oneshot::Sender<Statistics>),
    KnownPcaps(oneshot::Sender<Vec<PcapInfo>>),
    ImportPcap(String),
    ListTags(oneshot::Sender<Vec<TagInfo>>),
    AddTag {
        name: String,
        color: String,
        definition: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DelTag {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateTag {
        name: String,
        op: UpdateTagOp,
        reply: oneshot::Sender<Result<()>>,
    },
    ListConverters(oneshot::Sender<Vec<ConverterStats>>),
    ResetConverter {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ConverterStderr {
        name: String,
        reply: oneshot::Sender<Result<Vec<Vec<String>>>>,
    },
    AttachFilter {
        tag: String,
        filter: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DetachFilter {
        tag: String,
        filter: String,
        reply: oneshot::Sender<Result<()>>,
    },
    FetchView(oneshot::Sender<ViewSnapshot>),
    ReleaseIndexes(Vec<Arc<IndexFile>>),
    ConverterFile(ConverterEvent),
    Reschedule,
    ImportDone(ImportOutcome),
    MergeDone(MergeOutcome),
    TaggingDone(TaggingOutcome),
    ConvertDone(ConvertOutcome),
    Close(oneshot::Sender<()>),
}

pub(crate) fn find_stream(indexes: &[Arc<IndexFile>], id: StreamId) -> Option<&Stream> {
    indexes.iter().rev().find_map(|index| index.stream_by_id(id))
}

pub(crate) struct ManagerState {
    config: CapstanConfig,
    builder: Arc<dyn IndexBuilder>,
    cmd_tx: mpsc::UnboundedSender<Command>,

    indexes: Vec<Arc<IndexFile>>,
    pool: ReleasePool,
    n_streams: u64,
    n_packets: u64,
    next_stream_id: StreamId,
    n_unmergeable_indexes: usize,
    all_streams: StreamSet,
    state_filename: Option<PathBuf>,

    merge_job_running: bool,
    tagging_job_running: bool,
    converter_job_running: bool,
    import_jobs: Vec<String>,

    updated_during_tagging: StreamSet,
    added_during_tagging: StreamSet,

    tags: BTreeMap<String, Tag>,
    converters: BTreeMap<String, Arc<CachedConverter>>,
    streams_to_convert: BTreeMap<String, StreamSet>,
    filters: BTreeMap<String, Filter>,
}

impl ManagerState {
    fn new(
        config: CapstanConfig,
        builder: Arc<dyn IndexBuilder>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        ManagerState {
            config,
            builder,
            cmd_tx,
            indexes: Vec::new(),
            pool: ReleasePool::default(),
            n_streams: 0,
            n_packets: 0,
            next_stream_id: 0,
            n_unmergeable_indexes: 0,
            all_streams: StreamSet::new(),
            state_filename: None,
            merge_job_running: false,
            tagging_job_running: false,
            converter_job_running: false,
            import_jobs: Vec::new(),
            updated_during_tagging: StreamSet::new(),
            added_during_tagging: StreamSet::new(),
            tags: BTreeMap::new(),
            converters: BTreeMap::new(),
            streams_to_convert: BTreeMap::new(),
            filters: BTreeMap::new(),
        }
    }

    /// Handles one command; `true` stops the actor.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::KnownPcaps(reply) => {
                let _ = reply.send(self.builder.known_pcaps());
            }
            Command::ImportPcap(filename) => {
                self.import_jobs.push(filename);
                if self.import_jobs.len() == 1 {
                    self.spawn_import(self.import_jobs[..1].to_vec());
                }
            }
            Command::ListTags(reply) => {
                let _ = reply.send(self.list_tags());
            }
            Command::AddTag {
                name,
                color,
                definition,
                reply,
            } => {
                let _ = reply.send(self.add_tag(&name, &color, &definition));
            }
            Command::DelTag { name, reply } => {
                let _ = reply.send(self.del_tag(&name).await);
            }
            Command::UpdateTag { name, op, reply } => {
                let _ = reply.send(self.update_tag(&name, op).await);
            }
            Command::ListConverters(reply) => {
                let mut stats = Vec::with_capacity(self.converters.len());
                for converter in self.converters.values() {
                    stats.push(converter.stats().await);
                }
                let _ = reply.send(stats);
            }
            Command::ResetConverter { name, reply } => {
                let _ = reply.send(self.reset_converter(&name).await);
            }
            Command::ConverterStderr { name, reply } => {
                let result = match self.converters.get(&name) {
                    Some(converter) => Ok(converter.stderrs().await),
                    None => not_found(format!("converter {name:?} does not exist")),
                };
                let _ = reply.send(result);
            }
            Command::AttachFilter { tag, filter, reply } => {
                let _ = reply.send(self.attach_filter_to_tag(&tag, &filter).await);
            }
            Command::DetachFilter { tag, filter, reply } => {
                let _ = reply.send(self.detach_filter_from_tag(&tag, &filter));
            }
            Command::FetchView(reply) => {
                let _ = reply.send(self.fetch_view());
            }
            Command::ReleaseIndexes(indexes) => {
                self.pool.release(indexes);
            }
            Command::ConverterFile(event) => {
                self.handle_converter_event(event).await;
            }
            Command::Reschedule => {
                self.start_tagging_if_needed();
                self.start_merge_if_needed();
                self.start_converter_if_needed();
            }
            Command::ImportDone(outcome) => self.handle_import_done(outcome),
            Command::MergeDone(outcome) => self.handle_merge_done(outcome),
            Command::TaggingDone(outcome) => self.handle_tagging_done(outcome).await,
            Command::ConvertDone(outcome) => self.handle_convert_done(outcome).await,
            Command::Close(reply) => {
                for converter in self.converters.values() {
                    converter.close().await;
                }
                for filter in self.filters.values_mut() {
                    filter.stop();
                }
                info!("manager stopped");
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn status(&self) -> Statistics {
        Statistics {
            import_job_count: self.import_jobs.len(),
            index_count: self.indexes.len(),
            index_lock_count: self.pool.total_locks(),
            pcap_count: self.builder.known_pcaps().len(),
            stream_count: self.n_streams,
            packet_count: self.n_packets,
            merge_job_running: self.merge_job_running,
            tagging_job_running: self.tagging_job_running,
            converter_job_running: self.converter_job_running,
        }
    }

    /// Clones the index list from `start` and locks the copies.
    fn indexes_copy(&mut self, start: usize) -> (Vec<Arc<IndexFile>>, Vec<Arc<IndexFile>>) {
        let indexes: Vec<Arc<IndexFile>> = self.indexes[start..].to_vec();
        let releaser = self.pool.lock(&indexes);
        (indexes, releaser)
    }

    fn fetch_view(&mut self) -> ViewSnapshot {
        let (indexes, releaser) = self.indexes_copy(0);
        ViewSnapshot {
            indexes,
            releaser,
            tag_details: self
                .tags
                .iter()
                .map(|(name, tag)| (name.clone(), tag.details.clone()))
                .collect(),
            tag_converters: self
                .tags
                .iter()
                .map(|(name, tag)| (name.clone(), tag.converters.clone()))
                .collect(),
            converters: self
                .converters
                .iter()
                .map(|(name, converter)| (name.clone(), converter.clone()))
                .collect(),
        }
    }

    // --- scheduling -----------------------------------------------------

    fn spawn_import(&mut self, filenames: Vec<String>) {
        let (indexes, releaser) = self.indexes_copy(0);
        tokio::spawn(jobs::import_job(
            self.cmd_tx.clone(),
            self.builder.clone(),
            self.config.paths.pcap_dir.clone(),
            self.config.paths.index_dir.clone(),
            filenames,
            indexes,
            releaser,
            self.next_stream_id,
        ));
    }

    pub(crate) fn start_tagging_if_needed(&mut self) {
        if self.tagging_job_running {
            return;
        }
        let mut pick: Option<String> = None;
        'outer: for (name, tag) in &self.tags {
            if tag.details.uncertain.is_empty() {
                continue;
            }
            for referenced in tag.features.referenced_tags() {
                if let Some(r) = self.tags.get(referenced) {
                    if !r.details.uncertain.is_empty() {
                        continue 'outer;
                    }
                }
            }
            pick = Some(name.clone());
            break;
        }
        let Some(name) = pick else { return };

        let tag = &self.tags[&name];
        let tag_details = tags::referenced_tag_details(&self.tags, tag);
        let converters: HashMap<String, Arc<dyn ConverterAccess>> = self
            .converters
            .iter()
            .map(|(n, c)| (n.clone(), c.clone() as Arc<dyn ConverterAccess>))
            .collect();
        let definition = tag.definition.clone();
        let conditions = tag.details.conditions.clone();
        let matches = tag.details.matches.clone();
        let uncertain = tag.details.uncertain.clone();

        self.updated_during_tagging = StreamSet::new();
        self.added_during_tagging = StreamSet::new();
        self.tagging_job_running = true;
        debug!(tag = %name, uncertain = uncertain.count(), "starting tagging job");
        let (indexes, releaser) = self.indexes_copy(0);
        tokio::spawn(jobs::tagging_job(
            self.cmd_tx.clone(),
            name,
            definition,
            conditions,
            matches,
            uncertain,
            tag_details,
            converters,
            indexes,
            releaser,
        ));
    }

    pub(crate) fn start_merge_if_needed(&mut self) {
        if self.merge_job_running || self.tagging_job_running {
            return;
        }
        // Keeping tags current has priority over housekeeping.
        if self.tags.values().any(|t| !t.details.uncertain.is_empty()) {
            return;
        }
        let mut remaining = self.n_streams;
        for (i, index) in self.indexes.iter().enumerate() {
            let count = index.stream_count() as u64;
            remaining -= count;
            if i >= self.n_unmergeable_indexes && count < remaining {
                self.merge_job_running = true;
                debug!(offset = i, "starting merge job");
                let (indexes, releaser) = self.indexes_copy(i);
                tokio::spawn(jobs::merge_job(
                    self.cmd_tx.clone(),
                    self.builder.clone(),
                    self.config.paths.index_dir.clone(),
                    i,
                    indexes,
                    releaser,
                ));
                return;
            }
        }
    }

    pub(crate) fn start_converter_if_needed(&mut self) {
        if self.converter_job_running {
            return;
        }
        // Sorted-name order keeps the drain fair across converters.
        let pick = self
            .streams_to_convert
            .iter()
            .find(|(name, queue)| !queue.is_empty() && self.converters.contains_key(*name))
            .map(|(name, _)| name.clone());
        let Some(name) = pick else { return };

        let converter = self.converters[&name].clone();
        // Take the whole queue now: streams updated while the job runs
        // must queue a fresh conversion.
        let work = self
            .streams_to_convert
            .insert(name, StreamSet::new())
            .unwrap_or_default();
        self.converter_job_running = true;
        debug!(converter = %converter.name(), streams = work.count(), "starting conversion job");
        let (indexes, releaser) = self.indexes_copy(0);
        tokio::spawn(jobs::convert_job(
            self.cmd_tx.clone(),
            converter,
            work,
            indexes,
            releaser,
        ));
    }

    // --- job completions ------------------------------------------------

    fn handle_import_done(&mut self, outcome: ImportOutcome) {
        self.pool.release(outcome.releaser);
        if !outcome.created.is_empty() {
            self.pool.lock(&outcome.created);
            self.indexes.extend(outcome.created);
            self.n_streams += outcome.new_stream_count;
            self.n_packets += outcome.new_packet_count;
            self.next_stream_id = self.next_stream_id.max(outcome.new_next_stream_id);
            self.all_streams = StreamSet::with_all_below(self.next_stream_id);
            self.added_during_tagging.or(&outcome.added);
            self.updated_during_tagging.or(&outcome.updated);
            self.invalidate_tags(&outcome.updated, &outcome.added);
        }
        self.import_jobs.drain(..outcome.processed.min(self.import_jobs.len()));
        if !self.import_jobs.is_empty() {
            self.spawn_import(self.import_jobs.clone());
        }
        self.start_tagging_if_needed();
        self.start_merge_if_needed();
        self.save_state();
    }

    fn handle_merge_done(&mut self, outcome: MergeOutcome) {
        if outcome.failed || outcome.merged.is_empty() {
            self.n_unmergeable_indexes += 1;
        } else {
            let end = (outcome.offset + outcome.window).min(self.indexes.len());
            let old: Vec<Arc<IndexFile>> = self.indexes[outcome.offset..end].to_vec();
            let old_streams: u64 = old.iter().map(|i| i.stream_count() as u64).sum();
            let old_packets: u64 = old.iter().map(|i| i.packet_count()).sum();
            let new_streams: u64 = outcome.merged.iter().map(|i| i.stream_count() as u64).sum();
            let new_packets: u64 = outcome.merged.iter().map(|i| i.packet_count()).sum();

            self.pool.lock(&outcome.merged);
            self.indexes
                .splice(outcome.offset..end, outcome.merged.iter().cloned());
            self.pool.release(old);
            // The merged outputs become merge candidates again only once
            // more indexes accumulate behind them.
            self.n_unmergeable_indexes = outcome.offset + outcome.merged.len() - 1;
            self.n_streams = self.n_streams + new_streams - old_streams;
            self.n_packets = self.n_packets + new_packets - old_packets;
            info!(
                merged = outcome.window,
                into = outcome.merged.len(),
                "merge finished"
            );
        }
        self.merge_job_running = false;
        self.start_merge_if_needed();
        self.pool.release(outcome.releaser);
    }

    async fn handle_tagging_done(&mut self, outcome: TaggingOutcome) {
        let mut filter_work: Vec<(String, Vec<StreamId>)> = Vec::new();
        match self.tags.get_mut(&outcome.name) {
            // Leave the tag alone if it was redefined while the job ran.
            Some(tag) if tag.definition == outcome.definition => {
                if outcome.failed {
                    // Zero the matches so the next invalidation rebuilds
                    // the tag from scratch.
                    tag.details.matches = StreamSet::new();
                } else {
                    tag.details.matches = outcome.matches;
                }
                // Ids that turned uncertain while the job ran (a
                // conversion finishing mid-flight) stay queued for the
                // next run.
                tag.details.uncertain.subtract(&outcome.evaluated);
                let matches = tag.details.matches.clone();
                for converter in tag.converters.clone() {
                    self.streams_to_convert
                        .entry(converter)
                        .or_default()
                        .or(&matches);
                }
                for filter in tag.filters.clone() {
                    filter_work.push((filter, matches.iter().collect()));
                }
                if !(self.updated_during_tagging.is_empty()
                    && self.added_during_tagging.is_empty())
                {
                    let updated = std::mem::take(&mut self.updated_during_tagging);
                    let added = std::mem::take(&mut self.added_during_tagging);
                    self.invalidate_tags(&updated, &added);
                }
            }
            _ => {}
        }

        for (filter_name, ids) in filter_work {
            let Some(filter) = self.filters.get(&filter_name) else {
                continue;
            };
            let streams: Vec<Stream> = ids
                .iter()
                .filter(|&&id| !filter.has_stream(id))
                .filter_map(|&id| find_stream(&self.indexes, id).cloned())
                .collect();
            for stream in streams {
                filter.enqueue(stream).await;
            }
        }

        self.tagging_job_running = false;
        self.start_tagging_if_needed();
        self.start_merge_if_needed();
        self.start_converter_if_needed();
        self.pool.release(outcome.releaser);
    }

    async fn handle_convert_done(&mut self, outcome: ConvertOutcome) {
        self.converter_job_running = false;
        let name = outcome.converter.name().to_string();

        if !self.converters.contains_key(&name) {
            // The converter was removed while the job ran; its results are
            // orphaned.
            if let Err(e) = outcome.converter.reset().await {
                warn!(converter = %name, error = %e, "failed to reset removed converter");
            }
            self.start_converter_if_needed();
            self.pool.release(outcome.releaser);
            return;
        }

        if !outcome.remaining.is_empty() {
            self.streams_to_convert
                .entry(name)
                .or_default()
                .or(&outcome.remaining);
        }

        // Data queries may now match the freshly converted bytes.
        for tag in self.tags.values_mut() {
            if tag.features.uses(streamidx::query::feature::DATA) {
                tag.details.uncertain.or(&outcome.converted);
            }
        }
        self.start_tagging_if_needed();
        self.start_converter_if_needed();
        self.pool.release(outcome.releaser);
    }

    // --- converters -----------------------------------------------------

    async fn handle_converter_event(&mut self, event: ConverterEvent) {
        match event {
            ConverterEvent::Changed {
                path,
                created,
                written,
            } => {
                if created {
                    if let Err(e) = self.add_converter(&path) {
                        warn!(path = %path.display(), error = %e, "failed to add converter");
                    }
                }
                if written {
                    if let Err(e) = self.restart_converter_path(&path).await {
                        warn!(path = %path.display(), error = %e, "failed to restart converter");
                    }
                }
            }
            ConverterEvent::Removed { path } => {
                if let Err(e) = self.remove_converter(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to remove converter");
                }
            }
        }
    }

    fn converter_name_of(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn add_converter(&mut self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let executable = fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if !executable {
            return config_err(format!("converter {} is not executable", path.display()));
        }
        let name = Self::converter_name_of(path);
        if self.converters.contains_key(&name) {
            return config_err(format!("converter {name:?} already exists"));
        }
        if name == RESERVED_CONVERTER_NAME {
            return config_err(format!("converter name {name:?} is reserved"));
        }
        if !valid_converter_name(&name) {
            return config_err(format!("converter name {name:?} has to be alphanumeric"));
        }
        let converter = CachedConverter::new(
            &name,
            path,
            &self.config.paths.index_dir,
            self.config.limits.converter_processes,
            self.config.limits.converter_stderr_lines,
        )
        .map_err(ManagerError::from_anyhow)?;
        info!(converter = %name, path = %path.display(), "converter added");
        self.converters.insert(name.clone(), Arc::new(converter));
        self.streams_to_convert.insert(name, StreamSet::new());
        Ok(())
    }

    async fn remove_converter(&mut self, path: &Path) -> Result<()> {
        let name = Self::converter_name_of(path);
        let Some(converter) = self.converters.get(&name).cloned() else {
            return not_found(format!("converter {name:?} does not exist"));
        };
        let tag_names: Vec<String> = self.tags.keys().cloned().collect();
        for tag_name in tag_names {
            if self.tags[&tag_name].converters.iter().any(|c| c == &name) {
                self.detach_converter_from_tag(&tag_name, &name).await?;
            }
        }
        converter.reset().await.map_err(ManagerError::from_anyhow)?;
        self.converters.remove(&name);
        self.streams_to_convert.remove(&name);
        info!(converter = %name, "converter removed");
        self.save_state();
        Ok(())
    }

    async fn restart_converter_path(&mut self, path: &Path) -> Result<()> {
        let name = Self::converter_name_of(path);
        if !self.converters.contains_key(&name) {
            self.add_converter(path)?;
        }
        self.reset_converter(&name).await
    }

    /// Stops the converter's processes, drops its cache and queues every
    /// stream its attached tags match for reconversion.
    async fn reset_converter(&mut self, name: &str) -> Result<()> {
        let Some(converter) = self.converters.get(name).cloned() else {
            return not_found(format!("converter {name:?} does not exist"));
        };
        converter.reset().await.map_err(ManagerError::from_anyhow)?;
        let mut queue = StreamSet::new();
        for tag in self.tags.values() {
            if tag.converters.iter().any(|c| c == name) {
                queue.or(&tag.details.matches);
            }
        }
        self.streams_to_convert
            .entry(name.to_string())
            .or_default()
            .or(&queue);
        self.start_converter_if_needed();
        Ok(())
    }

    // --- persistence ----------------------------------------------------

    pub(crate) fn save_state(&mut self) {
        let snapshot = StateFile {
            saved: Utc::now(),
            tags: self
                .tags
                .iter()
                .map(|(name, tag)| TagRecord {
                    name: name.clone(),
                    definition: tag.definition.clone(),
                    color: tag.color.clone(),
                    converters: tag.converters.clone(),
                })
                .collect(),
            pcaps: self.builder.known_pcaps(),
        };
        match state::save(
            &self.config.paths.state_dir,
            self.state_filename.as_deref(),
            &snapshot,
        ) {
            Ok(path) => self.state_filename = Some(path),
            Err(e) => warn!(error = %e, "failed to save state"),
        }
    }
}

/// Handle to a running manager. Cloning is cheap; every method enqueues a
/// command on the actor.
pub struct Manager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    watcher: Option<WatcherHandle>,
}

impl Manager {
    /// Builds the manager state (directory checks, converter discovery,
    /// index scan, state-file recovery) and starts the actor plus the
    /// converter directory watcher.
    pub async fn start(
        config: CapstanConfig,
        builder: Arc<dyn IndexBuilder>,
    ) -> anyhow::Result<Manager> {
        for (label, path) in config.paths.all() {
            assert_dir_rwx(label, path)?;
        }

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let mut state = ManagerState::new(config, builder, cmd_tx.clone());

        // Discover converter executables.
        let mut converter_paths: Vec<PathBuf> = fs::read_dir(&state.config.paths.converter_dir)
            .context("failed to read converter directory")?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        converter_paths.sort();
        for path in converter_paths {
            state
                .add_converter(&path)
                .map_err(|e| anyhow::anyhow!("failed to add converter {}: {e}", path.display()))?;
        }

        // Configured filters.
        for (name, executable) in state.config.filters.clone() {
            let filter = Filter::new(
                &name,
                &executable,
                &state.config.paths.filter_dir,
                state.config.limits.filter_queue_depth,
            )?;
            state.filters.insert(name, filter);
        }

        // Load every readable index, oldest first.
        let mut index_paths: Vec<PathBuf> = fs::read_dir(&state.config.paths.index_dir)
            .context("failed to read index directory")?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "idx").unwrap_or(false))
            .collect();
        index_paths.sort();
        for path in index_paths {
            match IndexFile::open(&path) {
                Ok(index) => {
                    state.n_streams += index.stream_count() as u64;
                    state.n_packets += index.packet_count();
                    state.next_stream_id = state.next_stream_id.max(index.max_stream_id() + 1);
                    state.indexes.push(Arc::new(index));
                }
                Err(e) => warn!(index = %path.display(), error = %e, "unable to load index"),
            }
        }
        let base = state.indexes.clone();
        state.pool.lock(&base);
        state.all_streams = StreamSet::with_all_below(state.next_stream_id);

        // Recover the newest usable state file.
        let mut recovered: Option<(chrono::DateTime<Utc>, PathBuf, StateFile)> = None;
        let mut recovered_tags = None;
        for path in state::list(&state.config.paths.state_dir)? {
            let parsed = match state::read(&path) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(state = %path.display(), error = %e, "skipping state file");
                    continue;
                }
            };
            if let Some((saved, ..)) = &recovered {
                if parsed.saved < *saved {
                    continue;
                }
            }
            match tags::tags_from_state(
                &parsed.tags,
                &state.all_streams,
                state.next_stream_id,
                &path,
            ) {
                Some(built) => {
                    recovered = Some((parsed.saved, path, parsed));
                    recovered_tags = Some(built);
                }
                None => continue,
            }
        }
        if let (Some((_, path, parsed)), Some((tags, attachments))) = (recovered, recovered_tags) {
            info!(state = %path.display(), tags = tags.len(), "recovered state");
            state.tags = tags;
            state.state_filename = Some(path);
            let pcap_count = parsed.pcaps.len();
            state.builder.seed_known_pcaps(parsed.pcaps);
            for (tag_name, converter) in attachments {
                if !state.converters.contains_key(&converter) {
                    warn!(tag = %tag_name, converter = %converter, "state references unknown converter");
                    continue;
                }
                if let Err(e) = state.attach_converter_to_tag(&tag_name, &converter) {
                    warn!(tag = %tag_name, converter = %converter, error = %e, "failed to attach converter");
                }
            }
            if state.builder.known_pcaps().len() != pcap_count {
                state.save_state();
            }
        }

        // Watcher events flow into the same command queue as everything
        // else.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let watcher = watch_converter_dir(&state.config.paths.converter_dir, event_tx)?;
        let forward_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if forward_tx.send(Command::ConverterFile(event)).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if state.handle(cmd).await {
                    break;
                }
            }
        });
        let _ = cmd_tx.send(Command::Reschedule);

        Ok(Manager {
            cmd_tx,
            watcher: Some(watcher),
        })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).map_err(|_| ManagerError::Closed)?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    pub async fn status(&self) -> Result<Statistics> {
        self.request(Command::Status).await
    }

    pub async fn known_pcaps(&self) -> Result<Vec<PcapInfo>> {
        self.request(Command::KnownPcaps).await
    }

    /// Queues a capture file (relative to the pcap directory) for import.
    pub fn import_pcap(&self, filename: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::ImportPcap(filename.into()));
    }

    pub async fn list_tags(&self) -> Result<Vec<TagInfo>> {
        self.request(Command::ListTags).await
    }

    pub async fn add_tag(
        &self,
        name: impl Into<String>,
        color: impl Into<String>,
        definition: impl Into<String>,
    ) -> Result<()> {
        self.request(|reply| Command::AddTag {
            name: name.into(),
            color: color.into(),
            definition: definition.into(),
            reply,
        })
        .await?
    }

    pub async fn del_tag(&self, name: impl Into<String>) -> Result<()> {
        self.request(|reply| Command::DelTag {
            name: name.into(),
            reply,
        })
        .await?
    }

    pub async fn update_tag(&self, name: impl Into<String>, op: UpdateTagOp) -> Result<()> {
        self.request(|reply| Command::UpdateTag {
            name: name.into(),
            op,
            reply,
        })
        .await?
    }

    pub async fn list_converters(&self) -> Result<Vec<ConverterStats>> {
        self.request(Command::ListConverters).await
    }

    pub async fn reset_converter(&self, name: impl Into<String>) -> Result<()> {
        self.request(|reply| Command::ResetConverter {
            name: name.into(),
            reply,
        })
        .await?
    }

    pub async fn converter_stderr(&self, name: impl Into<String>) -> Result<Vec<Vec<String>>> {
        self.request(|reply| Command::ConverterStderr {
            name: name.into(),
            reply,
        })
        .await?
    }

    pub async fn attach_filter(
        &self,
        tag: impl Into<String>,
        filter: impl Into<String>,
    ) -> Result<()> {
        self.request(|reply| Command::AttachFilter {
            tag: tag.into(),
            filter: filter.into(),
            reply,
        })
        .await?
    }

    pub async fn detach_filter(
        &self,
        tag: impl Into<String>,
        filter: impl Into<String>,
    ) -> Result<()> {
        self.request(|reply| Command::DetachFilter {
            tag: tag.into(),
            filter: filter.into(),
            reply,
        })
        .await?
    }

    /// A lazily populated point-in-time read view.
    pub fn view(&self) -> View {
        View::new(self.cmd_tx.clone())
    }

    /// Stops the watcher, closes all subprocesses and ends the actor.
    pub async fn close(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use streamidx::builder::PcapDirBuilder;
    use streamidx::index::write_index;
    use streamidx::query::{Query, TagDetails};
    use streamidx::Chunk;
    use tempfile::TempDir;

    fn test_state(dir: &TempDir) -> (ManagerState, mpsc::UnboundedReceiver<Command>) {
        let mut config = CapstanConfig::default();
        let base = dir.path();
        config.paths = PathsConfig {
            pcap_dir: base.join("pcaps"),
            index_dir: base.join("indexes"),
            snapshot_dir: base.join("snapshots"),
            state_dir: base.join("state"),
            converter_dir: base.join("converters"),
            filter_dir: base.join("filters"),
        };
        for (label, path) in config.paths.all() {
            assert_dir_rwx(label, path).unwrap();
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = ManagerState::new(config, Arc::new(PcapDirBuilder::new()), cmd_tx);
        (state, cmd_rx)
    }

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

    fn add_index(state: &mut ManagerState, streams: Vec<Stream>) {
        let index = Arc::new(
            write_index(&state.config.paths.index_dir, Utc::now(), streams)
                .unwrap()
                .unwrap(),
        );
        state.n_streams += index.stream_count() as u64;
        state.n_packets += index.packet_count();
        state.next_stream_id = state.next_stream_id.max(index.max_stream_id() + 1);
        let base = vec![index.clone()];
        state.pool.lock(&base);
        state.indexes.push(index);
        state.all_streams = StreamSet::with_all_below(state.next_stream_id);
    }

    fn plain_tag(definition: &str, uncertain: &[StreamId]) -> Tag {
        let query = Query::parse(definition).unwrap();
        Tag {
            details: TagDetails {
                matches: StreamSet::new(),
                uncertain: uncertain.iter().copied().collect(),
                conditions: query.conditions.clone(),
            },
            definition: definition.to_string(),
            features: query.conditions.features(),
            color: String::new(),
            converters: Vec::new(),
            filters: Vec::new(),
        }
    }

    #[tokio::test]
    async fn add_tag_validations() {
        let dir = TempDir::new().unwrap();
        let (mut state, _rx) = test_state(&dir);

        let config_err = |r: Result<()>| match r {
            Err(ManagerError::Config(msg)) => msg,
            other => panic!("expected config error, got {other:?}"),
        };

        assert!(config_err(state.add_tag("bogus", "", "id:1")).contains("prefix"));
        assert!(config_err(state.add_tag("tag/", "", "id:1")).contains("prefix"));
        assert!(config_err(state.add_tag("mark/m", "", "data:\"x\"")).contains("'id' filter"));
        assert!(config_err(state.add_tag("tag/rel", "", "time:>-5m")).contains("relative"));
        assert!(config_err(state.add_tag("tag/grp", "", "group:chost")).contains("grouping"));
        assert!(config_err(state.add_tag("tag/self", "", "tag:self")).contains("self reference"));
        assert!(
            config_err(state.add_tag("tag/dangling", "", "service:nope")).contains("unknown")
        );
        assert!(matches!(
            state.add_tag("tag/badquery", "", "id:abc"),
            Err(ManagerError::Parse(_))
        ));

        state.add_tag("tag/ok", "#123456", "sport:80").unwrap();
        assert!(config_err(state.add_tag("tag/ok", "", "sport:80")).contains("exists"));
    }

    #[tokio::test]
    async fn mark_tag_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (mut state, _rx) = test_state(&dir);
        state.next_stream_id = 10;
        state.all_streams = StreamSet::with_all_below(10);

        state.add_tag("mark/favs", "#f00", "id:3,7").unwrap();
        let info = &state.list_tags()[0];
        assert_eq!(info.name, "mark/favs");
        assert_eq!(info.matching_count, 2);
        assert_eq!(info.uncertain_count, 0);

        state
            .update_tag("mark/favs", UpdateTagOp::MarkAdd(vec![5]))
            .await
            .unwrap();
        let tag = &state.tags["mark/favs"];
        assert_eq!(tag.definition, "id:3,5,7");
        assert_eq!(tag.details.matches.iter().collect::<Vec<_>>(), vec![3, 5, 7]);
        assert!(tag.details.uncertain.is_empty());

        state
            .update_tag("mark/favs", UpdateTagOp::MarkDel(vec![3]))
            .await
            .unwrap();
        assert_eq!(state.tags["mark/favs"].definition, "id:5,7");

        // Ids beyond the known range are rejected.
        assert!(matches!(
            state
                .update_tag("mark/favs", UpdateTagOp::MarkAdd(vec![99]))
                .await,
            Err(ManagerError::NotFound(_))
        ));
        // Mark operations only apply to mark/generated tags.
        state.add_tag("tag/x", "", "sport:80").unwrap();
        assert!(matches!(
            state.update_tag("tag/x", UpdateTagOp::MarkAdd(vec![1])).await,
            Err(ManagerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn converter_attachment_requires_simple_queries() {
        let dir = TempDir::new().unwrap();
        let (mut state, _rx) = test_state(&dir);
        state.next_stream_id = 5;
        state.all_streams = StreamSet::with_all_below(5);

        let converter = CachedConverter::new(
            "upper",
            Path::new("/bin/true"),
            &state.config.paths.index_dir,
            1,
            16,
        )
        .unwrap();
        state.converters.insert("upper".into(), Arc::new(converter));
        state.streams_to_convert.insert("upper".into(), StreamSet::new());

        state.add_tag("tag/data", "", "data:\"GET\"").unwrap();
        let err = state
            .update_tag("tag/data", UpdateTagOp::SetConverters(vec!["upper".into()]))
            .await;
        match err {
            Err(ManagerError::Config(msg)) => assert!(msg.contains("too complex"), "{msg}"),
            other => panic!("expected config error, got {other:?}"),
        }
        assert!(state.tags["tag/data"].converters.is_empty());

        // Pretend a conversion job is already running so the queue is
        // observable instead of being drained immediately.
        state.converter_job_running = true;
        state.add_tag("mark/simple", "", "id:1,2").unwrap();
        state
            .update_tag("mark/simple", UpdateTagOp::SetConverters(vec!["upper".into()]))
            .await
            .unwrap();
        assert_eq!(state.tags["mark/simple"].converters, vec!["upper"]);
        // The mark's matches were queued for conversion.
        assert_eq!(
            state.streams_to_convert["upper"].iter().collect::<Vec<_>>(),
            vec![1, 2]
        );

        assert!(matches!(
            state
                .update_tag("mark/simple", UpdateTagOp::SetConverters(vec!["nope".into()]))
                .await,
            Err(ManagerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn merge_waits_for_certain_tags() {
        let dir = TempDir::new().unwrap();
        let (mut state, mut rx) = test_state(&dir);
        add_index(&mut state, vec![stream(0, "a")]);
        add_index(&mut state, vec![stream(1, "b")]);
        add_index(
            &mut state,
            (2..7).map(|id| stream(id, "xyz")).collect(),
        );

        state
            .tags
            .insert("tag/pending".into(), plain_tag("sport:80", &[0]));
        state.start_merge_if_needed();
        assert!(!state.merge_job_running, "merge must wait for uncertain tags");

        state
            .tags
            .get_mut("tag/pending")
            .unwrap()
            .details
            .uncertain = StreamSet::new();
        state.start_merge_if_needed();
        assert!(state.merge_job_running);

        // The merge job coalesces the whole window into one index.
        loop {
            match rx.recv().await.expect("actor channel closed") {
                Command::MergeDone(outcome) => {
                    assert!(!outcome.failed);
                    assert_eq!(outcome.offset, 0);
                    assert_eq!(outcome.window, 3);
                    assert_eq!(outcome.merged.len(), 1);
                    assert_eq!(outcome.merged[0].stream_count(), 7);
                    state.handle_merge_done(outcome);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(state.indexes.len(), 1);
        assert_eq!(state.n_unmergeable_indexes, 0);
        assert!(!state.merge_job_running);
    }

    #[tokio::test]
    async fn merge_also_waits_for_running_tagging_job() {
        let dir = TempDir::new().unwrap();
        let (mut state, _rx) = test_state(&dir);
        add_index(&mut state, vec![stream(0, "a")]);
        add_index(&mut state, (1..4).map(|id| stream(id, "b")).collect());

        state.tagging_job_running = true;
        state.start_merge_if_needed();
        assert!(!state.merge_job_running);

        state.tagging_job_running = false;
        state.start_merge_if_needed();
        assert!(state.merge_job_running);
    }

    #[tokio::test]
    async fn tagging_prefers_tags_whose_references_are_certain() {
        let dir = TempDir::new().unwrap();
        let (mut state, mut rx) = test_state(&dir);
        state.next_stream_id = 1;
        state.all_streams = StreamSet::with_all_below(1);

        state
            .tags
            .insert("service/http".into(), plain_tag("sport:80", &[0]));
        state
            .tags
            .insert("tag/slow".into(), plain_tag("@service:http", &[0]));

        state.start_tagging_if_needed();
        assert!(state.tagging_job_running);
        match rx.recv().await.expect("actor channel closed") {
            Command::TaggingDone(outcome) => {
                // tag/slow is blocked on service/http's uncertainty.
                assert_eq!(outcome.name, "service/http");
            }
            _ => panic!("expected a tagging completion"),
        }
    }

    #[tokio::test]
    async fn subquery_references_invalidate_fully() {
        let dir = TempDir::new().unwrap();
        let (mut state, _rx) = test_state(&dir);
        state.next_stream_id = 4;
        state.all_streams = StreamSet::with_all_below(4);

        state
            .tags
            .insert("service/http".into(), plain_tag("sport:80", &[]));
        state
            .tags
            .insert("tag/slow".into(), plain_tag("@service:http", &[]));
        state
            .tags
            .insert("tag/chain".into(), plain_tag("service:http", &[]));

        // Stream 3 arrives: the port tag sees it, the subquery dependent is
        // fully invalidated, the main-reference dependent inherits.
        let added: StreamSet = [3u64].into_iter().collect();
        state.invalidate_tags(&StreamSet::new(), &added);

        assert_eq!(
            state.tags["service/http"].details.uncertain.iter().collect::<Vec<_>>(),
            vec![3]
        );
        assert_eq!(
            state.tags["tag/slow"].details.uncertain,
            state.all_streams,
            "subquery dependents are fully invalidated"
        );
        assert_eq!(
            state.tags["tag/chain"].details.uncertain.iter().collect::<Vec<_>>(),
            vec![3]
        );
    }

    #[tokio::test]
    async fn pure_id_tags_ignore_imports() {
        let dir = TempDir::new().unwrap();
        let (mut state, _rx) = test_state(&dir);
        state.next_stream_id = 4;
        state.all_streams = StreamSet::with_all_below(4);

        state.tags.insert("mark/pin".into(), plain_tag("id:1", &[]));
        state
            .tags
            .insert("tag/bytes".into(), plain_tag("data:\"GET\"", &[]));

        let added: StreamSet = [3u64].into_iter().collect();
        let updated: StreamSet = [0u64].into_iter().collect();
        state.invalidate_tags(&updated, &added);

        assert!(state.tags["mark/pin"].details.uncertain.is_empty());
        // Data tags see both the new and the rewritten stream.
        assert_eq!(
            state.tags["tag/bytes"].details.uncertain.iter().collect::<Vec<_>>(),
            vec![0, 3]
        );
    }

    #[tokio::test]
    async fn del_tag_refuses_while_referenced() {
        let dir = TempDir::new().unwrap();
        let (mut state, _rx) = test_state(&dir);
        state.add_tag("service/http", "", "sport:80").unwrap();
        state.add_tag("tag/slow", "", "@service:http").unwrap();

        assert!(matches!(
            state.del_tag("service/http").await,
            Err(ManagerError::Config(_))
        ));
        state.del_tag("tag/slow").await.unwrap();
        state.del_tag("service/http").await.unwrap();
        assert!(state.tags.is_empty());
        assert!(matches!(
            state.del_tag("service/http").await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[test]
    fn state_tags_reject_cycles_and_bad_references() {
        use crate::state::TagRecord;
        let record = |name: &str, definition: &str| TagRecord {
            name: name.into(),
            definition: definition.into(),
            color: String::new(),
            converters: vec![],
        };
        let all = StreamSet::with_all_below(4);
        let path = Path::new("test.state.json");

        let good = [
            record("service/http", "sport:80"),
            record("tag/slow", "@service:http"),
            record("mark/favs", "id:1,3"),
        ];
        let (tags, _) = tags::tags_from_state(&good, &all, 4, path).unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags["mark/favs"].details.matches.count(), 2);
        assert!(tags["mark/favs"].details.uncertain.is_empty());
        assert_eq!(tags["tag/slow"].details.uncertain, all);

        let cycle = [
            record("tag/a", "tag:b"),
            record("tag/b", "tag:a"),
        ];
        assert!(tags::tags_from_state(&cycle, &all, 4, path).is_none());

        let dangling = [record("tag/a", "tag:missing")];
        assert!(tags::tags_from_state(&dangling, &all, 4, path).is_none());

        let self_ref = [record("tag/a", "tag:a")];
        assert!(tags::tags_from_state(&self_ref, &all, 4, path).is_none());

        let bad_mark = [record("mark/m", "data:\"x\"")];
        assert!(tags::tags_from_state(&bad_mark, &all, 4, path).is_none());

        let duplicate = [record("tag/a", "id:1"), record("tag/a", "id:2")];
        assert!(tags::tags_from_state(&duplicate, &all, 4, path).is_none());
    }
}
