//! Filter workers.
//!
//! A filter is a long-running external program that rewrites the packet
//! sequence of every stream matched by its attached tags. Results are
//! persisted in a per-filter `.fidx` store; streams already present there
//! are never re-filtered. The subprocess starts when the first tag
//! attaches and stops when the last one detaches. Any framing error
//! poisons the worker: it keeps draining its queue but discards entries
//! until a restart.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use capstore::{FilterReader, FilterWriter};
use streamidx::{Chunk, Stream, StreamId, StreamSet};

use crate::converters::wire;

pub struct Filter {
    name: String,
    executable: PathBuf,
    cache_path: PathBuf,
    queue_depth: usize,
    attached_tags: Vec<String>,
    available: Arc<Mutex<StreamSet>>,
    tx: Option<mpsc::Sender<Stream>>,
    task: Option<JoinHandle<()>>,
}

impl Filter {
    /// Prepares a filter and indexes any results a previous run left in
    /// its store. The subprocess is not started yet.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        filter_dir: &Path,
        queue_depth: usize,
    ) -> Result<Self> {
        let name = name.into();
        let cache_path = filter_dir.join(format!("filterindex-{name}.fidx"));

        let mut available = StreamSet::new();
        if cache_path.exists() {
            let reader = FilterReader::open(&cache_path)?;
            for id in reader.stream_ids() {
                available.set(id);
            }
        }

        Ok(Filter {
            name,
            executable: executable.into(),
            cache_path,
            queue_depth,
            attached_tags: Vec::new(),
            available: Arc::new(Mutex::new(available)),
            tx: None,
            task: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn attached_tags(&self) -> &[String] {
        &self.attached_tags
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.available.lock().is_set(id)
    }

    /// Reads the filtered packets of a processed stream.
    pub fn data(&self, id: StreamId) -> Result<Vec<Chunk>> {
        FilterReader::open(&self.cache_path)?.read_stream(id)
    }

    pub fn attach_tag(&mut self, tag: &str) {
        if !self.attached_tags.iter().any(|t| t == tag) {
            self.attached_tags.push(tag.to_string());
        }
        self.start_if_needed();
    }

    /// Detaches a tag; the worker stops once nothing is attached.
    pub fn detach_tag(&mut self, tag: &str) {
        self.attached_tags.retain(|t| t != tag);
        if self.attached_tags.is_empty() {
            self.stop();
        }
    }

    /// Queues one stream for processing. Blocks when the bounded queue is
    /// full; streams already in the store are skipped up front.
    pub async fn enqueue(&self, stream: Stream) {
        if self.has_stream(stream.id) {
            debug!(filter = %self.name, stream = stream.id, "already processed");
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(stream).await.is_err() {
                warn!(filter = %self.name, "worker is gone, dropping stream");
            }
        }
    }

    /// Kills the current worker and starts a fresh one when tags are
    /// still attached.
    pub fn restart(&mut self) {
        self.stop();
        self.start_if_needed();
    }

    pub fn stop(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn start_if_needed(&mut self) {
        if self.task.is_some() || self.attached_tags.is_empty() {
            return;
        }
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.tx = Some(tx);
        self.task = Some(tokio::spawn(run_worker(
            self.name.clone(),
            self.executable.clone(),
            self.cache_path.clone(),
            rx,
            self.available.clone(),
        )));
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_worker(
    name: String,
    executable: PathBuf,
    cache_path: PathBuf,
    mut rx: mpsc::Receiver<Stream>,
    available: Arc<Mutex<StreamSet>>,
) {
    let mut child = match Command::new(&executable)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start filter {name:?}"))
    {
        Ok(child) => child,
        Err(e) => {
            warn!(filter = %name, error = %e, "filter unavailable, discarding queue");
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(filter = %name, executable = %executable.display(), "filter started");

    let (Some(mut stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        warn!(filter = %name, "filter pipes unavailable");
        return;
    };

    {
        let name = name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(filter = %name, "stderr: {line}");
            }
        });
    }

    let mut stdout = BufReader::new(stdout).lines();
    let mut invalid_state = false;
    while let Some(stream) = rx.recv().await {
        if invalid_state {
            continue;
        }
        if available.lock().is_set(stream.id) {
            debug!(filter = %name, stream = stream.id, "already processed");
            continue;
        }

        debug!(filter = %name, stream = stream.id, "filtering");
        if let Err(e) = wire::send_stream(&mut stdin, &stream).await {
            warn!(filter = %name, stream = stream.id, error = %e, "entering invalid state");
            invalid_state = true;
            continue;
        }
        let (packets, _metadata) = match wire::read_response(&mut stdout).await {
            Ok(response) => response,
            Err(e) => {
                warn!(filter = %name, stream = stream.id, error = %e, "entering invalid state");
                invalid_state = true;
                continue;
            }
        };

        if let Err(e) = append_result(&cache_path, stream.id, &packets) {
            warn!(filter = %name, stream = stream.id, error = %e, "failed to persist result");
            continue;
        }
        available.lock().set(stream.id);
    }
}

fn append_result(cache_path: &Path, id: StreamId, packets: &[Chunk]) -> Result<()> {
    let mut writer = FilterWriter::open(cache_path)?;
    writer.invalidate_stream(id)?;
    writer.append_stream(id, packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn loads_availability_from_existing_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("filterindex-f.fidx");
        let mut writer = FilterWriter::open(&path).unwrap();
        writer.append_stream(4, &[Chunk::client("x")]).unwrap();
        drop(writer);

        let filter = Filter::new("f", "/bin/true", dir.path(), 10).unwrap();
        assert!(filter.has_stream(4));
        assert!(!filter.has_stream(5));
        assert_eq!(filter.data(4).unwrap(), vec![Chunk::client("x")]);
    }

    #[tokio::test]
    async fn attach_detach_controls_worker_lifetime() {
        let dir = TempDir::new().unwrap();
        let mut filter = Filter::new("f", "/bin/true", dir.path(), 10).unwrap();
        assert!(filter.task.is_none());

        filter.attach_tag("tag/a");
        filter.attach_tag("tag/a");
        assert_eq!(filter.attached_tags(), ["tag/a"]);
        assert!(filter.task.is_some());

        filter.attach_tag("tag/b");
        filter.detach_tag("tag/a");
        assert!(filter.task.is_some());

        filter.detach_tag("tag/b");
        assert!(filter.task.is_none());
        assert!(filter.tx.is_none());
    }
}
