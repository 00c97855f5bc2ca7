//! Background jobs.
//!
//! Every job receives immutable inputs (a locked index snapshot plus
//! whatever detail copies it needs), does its work off the actor, and
//! posts a completion command carrying the releaser back. Jobs never
//! mutate manager state directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use streamidx::builder::IndexBuilder;
use streamidx::index::IndexFile;
use streamidx::query::{search_streams, Conditions, ConverterAccess, TagDetails};
use streamidx::{StreamId, StreamSet};

use crate::converters::CachedConverter;

use super::Command;

pub(crate) struct ImportOutcome {
    pub processed: usize,
    pub created: Vec<Arc<IndexFile>>,
    pub new_stream_count: u64,
    pub new_packet_count: u64,
    pub new_next_stream_id: StreamId,
    pub added: StreamSet,
    pub updated: StreamSet,
    pub releaser: Vec<Arc<IndexFile>>,
}

pub(crate) struct MergeOutcome {
    pub offset: usize,
    pub window: usize,
    pub merged: Vec<Arc<IndexFile>>,
    pub failed: bool,
    pub releaser: Vec<Arc<IndexFile>>,
}

pub(crate) struct TaggingOutcome {
    pub name: String,
    pub definition: String,
    pub matches: StreamSet,
    /// The uncertainty mask this run evaluated. Only these ids are
    /// settled on commit; ids invalidated while the job ran stay queued.
    pub evaluated: StreamSet,
    /// True when the search errored; the handler zeroes the matches so
    /// the next invalidation rebuilds the tag from scratch.
    pub failed: bool,
    pub releaser: Vec<Arc<IndexFile>>,
}

pub(crate) struct ConvertOutcome {
    pub converter: Arc<CachedConverter>,
    pub converted: StreamSet,
    pub remaining: StreamSet,
    pub releaser: Vec<Arc<IndexFile>>,
}

/// The earliest reference time across the index set; the base for
/// relative-time queries.
pub(crate) fn reference_time(indexes: &[Arc<IndexFile>]) -> DateTime<Utc> {
    indexes
        .iter()
        .map(|i| i.reference_time())
        .min()
        .unwrap_or_else(Utc::now)
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn import_job(
    cmd_tx: mpsc::UnboundedSender<Command>,
    builder: Arc<dyn IndexBuilder>,
    pcap_dir: PathBuf,
    index_dir: PathBuf,
    filenames: Vec<String>,
    existing: Vec<Arc<IndexFile>>,
    releaser: Vec<Arc<IndexFile>>,
    next_stream_id: StreamId,
) {
    let build_filenames = filenames.clone();
    let result = tokio::task::spawn_blocking(move || {
        builder.build_from_pcaps(
            &pcap_dir,
            &build_filenames,
            &existing,
            next_stream_id,
            &index_dir,
        )
    })
    .await;

    let (processed, created) = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(pcaps = ?filenames, error = %e, "import failed, dropping batch");
            (filenames.len(), Vec::new())
        }
        Err(e) => {
            warn!(pcaps = ?filenames, error = %e, "import worker panicked, dropping batch");
            (filenames.len(), Vec::new())
        }
    };

    let mut added = StreamSet::new();
    let mut updated = StreamSet::new();
    let mut new_stream_count = 0u64;
    let mut new_packet_count = 0u64;
    let mut new_next_stream_id = next_stream_id;
    for index in &created {
        new_stream_count += index.stream_count() as u64;
        new_packet_count += index.packet_count();
        new_next_stream_id = new_next_stream_id.max(index.max_stream_id() + 1);
        for id in index.stream_ids() {
            if id < next_stream_id {
                updated.set(id);
            } else {
                added.set(id);
            }
        }
    }
    info!(
        processed,
        indexes = created.len(),
        streams = new_stream_count,
        "import finished"
    );

    let _ = cmd_tx.send(Command::ImportDone(ImportOutcome {
        processed,
        created,
        new_stream_count,
        new_packet_count,
        new_next_stream_id,
        added,
        updated,
        releaser,
    }));
}

pub(crate) async fn merge_job(
    cmd_tx: mpsc::UnboundedSender<Command>,
    builder: Arc<dyn IndexBuilder>,
    index_dir: PathBuf,
    offset: usize,
    indexes: Vec<Arc<IndexFile>>,
    releaser: Vec<Arc<IndexFile>>,
) {
    let window = indexes.len();
    let merge_input = indexes.clone();
    let result =
        tokio::task::spawn_blocking(move || builder.merge(&index_dir, &merge_input)).await;

    let (merged, failed) = match result {
        Ok(Ok(merged)) => (merged, false),
        Ok(Err(e)) => {
            let names: Vec<_> = indexes.iter().map(|i| i.filename().to_path_buf()).collect();
            warn!(offset, indexes = ?names, error = %e, "merge failed");
            (Vec::new(), true)
        }
        Err(e) => {
            warn!(offset, error = %e, "merge worker panicked");
            (Vec::new(), true)
        }
    };

    let _ = cmd_tx.send(Command::MergeDone(MergeOutcome {
        offset,
        window,
        merged,
        failed,
        releaser,
    }));
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn tagging_job(
    cmd_tx: mpsc::UnboundedSender<Command>,
    name: String,
    definition: String,
    conditions: Conditions,
    matches: StreamSet,
    uncertain: StreamSet,
    tag_details: HashMap<String, TagDetails>,
    converters: HashMap<String, Arc<dyn ConverterAccess>>,
    indexes: Vec<Arc<IndexFile>>,
    releaser: Vec<Arc<IndexFile>>,
) {
    let search_uncertain = uncertain.clone();
    let search_indexes = indexes.clone();
    let reference = reference_time(&indexes);
    let result = tokio::task::spawn_blocking(move || {
        search_streams(
            &search_indexes,
            Some(&search_uncertain),
            reference,
            &conditions,
            0,
            0,
            &tag_details,
            &converters,
        )
    })
    .await;

    let (matches, failed) = match result {
        Ok(Ok((found, _))) => {
            let mut updated = matches;
            updated.subtract(&uncertain);
            for id in found {
                updated.set(id);
            }
            (updated, false)
        }
        Ok(Err(e)) => {
            warn!(tag = %name, error = %e, "tagging failed");
            (matches, true)
        }
        Err(e) => {
            warn!(tag = %name, error = %e, "tagging worker panicked");
            (matches, true)
        }
    };

    let _ = cmd_tx.send(Command::TaggingDone(TaggingOutcome {
        name,
        definition,
        matches,
        evaluated: uncertain,
        failed,
        releaser,
    }));
}

/// Drains a converter's work queue, newest index first, running up to the
/// available parallelism concurrently. Failed or missing streams stay in
/// the queue for the next run.
pub(crate) async fn convert_job(
    cmd_tx: mpsc::UnboundedSender<Command>,
    converter: Arc<CachedConverter>,
    mut queue: StreamSet,
    indexes: Vec<Arc<IndexFile>>,
    releaser: Vec<Arc<IndexFile>>,
) {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    let mut converted = StreamSet::new();
    let mut inflight: JoinSet<(StreamId, anyhow::Result<()>)> = JoinSet::new();

    let collect = |queue: &mut StreamSet,
                       converted: &mut StreamSet,
                       result: Option<
        std::result::Result<(StreamId, anyhow::Result<()>), tokio::task::JoinError>,
    >| {
        match result {
            Some(Ok((id, Ok(())))) => converted.set(id),
            Some(Ok((id, Err(e)))) => {
                warn!(stream = id, error = %e, "conversion failed, re-queueing");
                queue.set(id);
            }
            Some(Err(e)) => warn!(error = %e, "conversion task panicked"),
            None => {}
        }
    };

    for index in indexes.iter().rev() {
        let mut id = index.min_stream_id();
        loop {
            let Some(next) = queue.next_set_from(id) else {
                break;
            };
            if next > index.max_stream_id() {
                break;
            }
            id = next + 1;

            if converter.contains(next) {
                queue.unset(next);
                continue;
            }
            // A stream inside the id range but absent from this index is
            // owned by an older one; leave its bit for a later pass.
            let Some(stream) = index.stream_by_id(next) else {
                continue;
            };
            queue.unset(next);

            while inflight.len() >= parallelism {
                let result = inflight.join_next().await;
                collect(&mut queue, &mut converted, result);
            }
            let converter = converter.clone();
            let stream = stream.clone();
            inflight.spawn(async move {
                let result = converter.data(&stream).await.map(|_| ());
                (stream.id, result)
            });
        }
    }
    while let Some(result) = inflight.join_next().await {
        collect(&mut queue, &mut converted, Some(result));
    }

    let _ = cmd_tx.send(Command::ConvertDone(ConvertOutcome {
        converter,
        converted,
        remaining: queue,
        releaser,
    }));
}
