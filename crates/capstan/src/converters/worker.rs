//! Converter subprocess pool.
//!
//! Processes are spawned lazily, reused between requests and capped by the
//! configured parallelism. A process that produces a malformed frame or
//! dies is discarded; the next request spawns a replacement. Each process
//! keeps a bounded ring of its most recent stderr lines for diagnostics.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use streamidx::{Chunk, Stream};

use super::wire;

/// How many dead-process stderr rings are kept for `stderrs()`.
const MAX_PROCESS_LOGS: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub running: bool,
    pub recent_stderr_lines: usize,
}

struct ProcessLog {
    ring: Arc<SyncMutex<VecDeque<String>>>,
    alive: Arc<AtomicBool>,
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    alive: Arc<AtomicBool>,
    epoch: u64,
}

#[derive(Default)]
struct Pool {
    idle: Vec<Process>,
    logs: Vec<ProcessLog>,
    epoch: u64,
}

pub struct Converter {
    name: String,
    executable: PathBuf,
    stderr_limit: usize,
    slots: Arc<Semaphore>,
    pool: Mutex<Pool>,
}

impl Converter {
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        max_processes: usize,
        stderr_limit: usize,
    ) -> Self {
        Converter {
            name: name.into(),
            executable: executable.into(),
            stderr_limit,
            slots: Arc::new(Semaphore::new(max_processes.max(1))),
            pool: Mutex::new(Pool::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Runs one stream through the external program and returns the
    /// converted packets.
    pub async fn data(&self, stream: &Stream) -> Result<Vec<Chunk>> {
        let _permit = self
            .slots
            .acquire()
            .await
            .context("converter is shutting down")?;

        let mut process = {
            let mut pool = self.pool.lock().await;
            match pool.idle.pop() {
                Some(p) => p,
                None => self.spawn(&mut pool)?,
            }
        };

        let result = async {
            wire::send_stream(&mut process.stdin, stream).await?;
            let (packets, _metadata) = wire::read_response(&mut process.stdout).await?;
            Ok::<_, anyhow::Error>(packets)
        }
        .await;

        match result {
            Ok(packets) => {
                let mut pool = self.pool.lock().await;
                if process.epoch == pool.epoch {
                    pool.idle.push(process);
                } else {
                    // The converter was reset while this request ran.
                    let _ = process.child.start_kill();
                }
                Ok(packets)
            }
            Err(e) => {
                process.alive.store(false, Ordering::Relaxed);
                let _ = process.child.start_kill();
                Err(e).with_context(|| {
                    format!(
                        "converter {:?} failed on stream {}",
                        self.name, stream.id
                    )
                })
            }
        }
    }

    fn spawn(&self, pool: &mut Pool) -> Result<Process> {
        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start converter {:?}", self.name))?;

        let stdin = child.stdin.take().context("converter stdin unavailable")?;
        let stdout = child.stdout.take().context("converter stdout unavailable")?;
        let stderr = child.stderr.take().context("converter stderr unavailable")?;

        let ring = Arc::new(SyncMutex::new(VecDeque::with_capacity(64)));
        let alive = Arc::new(AtomicBool::new(true));
        pool.logs.push(ProcessLog {
            ring: ring.clone(),
            alive: alive.clone(),
        });
        if pool.logs.len() > MAX_PROCESS_LOGS {
            pool.logs.remove(0);
        }

        let name = self.name.clone();
        let limit = self.stderr_limit;
        let reader_ring = ring.clone();
        let reader_alive = alive.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(converter = %name, "stderr: {line}");
                let mut ring = reader_ring.lock();
                if ring.len() >= limit {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
            reader_alive.store(false, Ordering::Relaxed);
        });

        debug!(converter = %self.name, executable = %self.executable.display(), "spawned converter process");
        Ok(Process {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            alive,
            epoch: pool.epoch,
        })
    }

    /// Kills every process and forgets their stderr history. In-flight
    /// requests notice the epoch change and discard their process instead
    /// of returning it to the pool.
    pub async fn reset(&self) {
        let mut pool = self.pool.lock().await;
        pool.epoch += 1;
        for mut process in pool.idle.drain(..) {
            if let Err(e) = process.child.start_kill() {
                warn!(converter = %self.name, error = %e, "failed to kill converter process");
            }
        }
        pool.logs.clear();
    }

    pub async fn process_stats(&self) -> Vec<ProcessStats> {
        let pool = self.pool.lock().await;
        pool.logs
            .iter()
            .map(|log| ProcessStats {
                running: log.alive.load(Ordering::Relaxed),
                recent_stderr_lines: log.ring.lock().len(),
            })
            .collect()
    }

    /// Recent stderr lines, one vector per process, oldest process first.
    pub async fn stderrs(&self) -> Vec<Vec<String>> {
        let pool = self.pool.lock().await;
        pool.logs
            .iter()
            .map(|log| log.ring.lock().iter().cloned().collect())
            .collect()
    }
}
