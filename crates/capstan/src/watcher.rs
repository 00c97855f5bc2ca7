//! Converter directory watcher.
//!
//! Filesystem events are debounced per path with a 500 ms quiet timer:
//! editors and `cp` produce bursts of create/write events that must
//! coalesce into a single add or restart. Removals fire immediately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, warn};

/// Quiet time before a create/write burst is delivered.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConverterEvent {
    /// A converter file appeared or was rewritten. `created` and `written`
    /// record which raw events were seen during the burst.
    Changed {
        path: PathBuf,
        created: bool,
        written: bool,
    },
    Removed {
        path: PathBuf,
    },
}

pub struct WatcherHandle {
    // Kept alive for the watch registration; dropping it unsubscribes.
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watches `dir` (non-recursive) and delivers debounced events to `tx`.
pub fn watch_converter_dir(
    dir: &Path,
    tx: mpsc::UnboundedSender<ConverterEvent>,
) -> Result<WatcherHandle> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Event>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = raw_tx.send(event);
        }
        Err(e) => warn!(error = %e, "converter watcher error"),
    })
    .context("failed to create filesystem watcher")?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;

    let task = tokio::spawn(debounce_loop(raw_rx, tx));
    Ok(WatcherHandle {
        _watcher: watcher,
        task,
    })
}

#[derive(Debug, Clone, Copy)]
struct PendingChange {
    deadline: Instant,
    created: bool,
    written: bool,
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<Event>,
    tx: mpsc::UnboundedSender<ConverterEvent>,
) {
    let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();
    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let timer = async move {
            match next_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = raw_rx.recv() => {
                let Some(event) = event else { break };
                debug!(?event, "converter dir event");
                for path in event.paths {
                    match event.kind {
                        EventKind::Remove(_) => {
                            pending.remove(&path);
                            let _ = tx.send(ConverterEvent::Removed { path });
                        }
                        EventKind::Create(_) => {
                            let entry = pending.entry(path).or_insert(PendingChange {
                                deadline: Instant::now() + DEBOUNCE,
                                created: false,
                                written: false,
                            });
                            entry.created = true;
                            entry.deadline = Instant::now() + DEBOUNCE;
                        }
                        EventKind::Modify(_) => {
                            let entry = pending.entry(path).or_insert(PendingChange {
                                deadline: Instant::now() + DEBOUNCE,
                                created: false,
                                written: false,
                            });
                            entry.written = true;
                            entry.deadline = Instant::now() + DEBOUNCE;
                        }
                        _ => {}
                    }
                }
            }
            _ = timer => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    let change = pending.remove(&path).unwrap();
                    let _ = tx.send(ConverterEvent::Changed {
                        path,
                        created: change.created,
                        written: change.written,
                    });
                }
            }
        }
    }
}
