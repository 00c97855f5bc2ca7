//! End-to-end manager tests driven through the command API, with a
//! deterministic in-memory builder staged per capture file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tempfile::TempDir;

use capstan::view::StreamsOptions;
use capstan::{CapstanConfig, Manager, UpdateTagOp};
use streamidx::builder::{IndexBuilder, PcapInfo};
use streamidx::index::{write_index, IndexFile};
use streamidx::query::Query;
use streamidx::{Chunk, Stream, StreamId};

struct FakeBuilder {
    staged: Mutex<HashMap<String, Vec<Stream>>>,
    known: Mutex<Vec<PcapInfo>>,
}

impl FakeBuilder {
    fn new() -> Arc<Self> {
        Arc::new(FakeBuilder {
            staged: Mutex::new(HashMap::new()),
            known: Mutex::new(Vec::new()),
        })
    }

    fn stage(&self, filename: &str, streams: Vec<Stream>) {
        self.staged
            .lock()
            .unwrap()
            .insert(filename.to_string(), streams);
    }
}

impl IndexBuilder for FakeBuilder {
    fn build_from_pcaps(
        &self,
        _pcap_dir: &Path,
        filenames: &[String],
        _existing: &[Arc<IndexFile>],
        _next_stream_id: StreamId,
        index_dir: &Path,
    ) -> Result<(usize, Vec<Arc<IndexFile>>)> {
        let mut created = Vec::new();
        for filename in filenames {
            let streams = self
                .staged
                .lock()
                .unwrap()
                .remove(filename)
                .unwrap_or_default();
            let packet_count = streams.iter().map(|s| s.packet_count() as u64).sum();
            if let Some(index) = write_index(index_dir, Utc::now(), streams)? {
                created.push(Arc::new(index));
            }
            self.known.lock().unwrap().push(PcapInfo {
                filename: filename.clone(),
                filesize: 0,
                packet_count,
                first_packet: None,
                last_packet: None,
            });
        }
        Ok((filenames.len(), created))
    }

    fn merge(&self, index_dir: &Path, indexes: &[Arc<IndexFile>]) -> Result<Vec<Arc<IndexFile>>> {
        let mut by_id: std::collections::BTreeMap<StreamId, Stream> = Default::default();
        for index in indexes {
            for stream in index.streams() {
                by_id.insert(stream.id, stream.clone());
            }
        }
        match write_index(index_dir, Utc::now(), by_id.into_values().collect())? {
            Some(index) => Ok(vec![Arc::new(index)]),
            None => Ok(Vec::new()),
        }
    }

    fn known_pcaps(&self) -> Vec<PcapInfo> {
        self.known.lock().unwrap().clone()
    }

    fn seed_known_pcaps(&self, pcaps: Vec<PcapInfo>) {
        *self.known.lock().unwrap() = pcaps;
    }
}

fn config_in(dir: &TempDir) -> CapstanConfig {
    let mut config = CapstanConfig::default();
    let base = dir.path();
    config.paths.pcap_dir = base.join("pcaps");
    config.paths.index_dir = base.join("indexes");
    config.paths.snapshot_dir = base.join("snapshots");
    config.paths.state_dir = base.join("state");
    config.paths.converter_dir = base.join("converters");
    config.paths.filter_dir = base.join("filters");
    config
}

fn stream(id: StreamId, server_port: u16, payload: &str) -> Stream {
    Stream {
        id,
        client_host: "10.0.0.1".into(),
        client_port: 40000 + id as u16,
        server_host: "10.0.0.2".into(),
        server_port,
        protocol: "tcp".into(),
        first_packet: Utc::now(),
        last_packet: Utc::now(),
        packets: vec![Chunk::client(payload.as_bytes().to_vec())],
    }
}

/// Polls until imports, jobs and tag uncertainty have all drained.
async fn wait_quiescent(manager: &Manager) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = manager.status().await.unwrap();
        let tags = manager.list_tags().await.unwrap();
        let busy = status.import_job_count > 0
            || status.merge_job_running
            || status.tagging_job_running
            || status.converter_job_running
            || tags.iter().any(|t| t.uncertain_count > 0);
        if !busy {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "manager did not quiesce: {status:?} {tags:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn import_resolves_tag_uncertainty() {
    let dir = TempDir::new().unwrap();
    let builder = FakeBuilder::new();
    builder.stage(
        "one.pcap",
        vec![stream(0, 80, "GET / HTTP/1.1"), stream(1, 443, "POST /upload")],
    );

    let manager = Manager::start(config_in(&dir), builder).await.unwrap();
    manager.add_tag("service/http", "#0f0", "sport:80").await.unwrap();
    manager
        .add_tag("tag/slow", "#00f", "@service:http data:\"GET\"")
        .await
        .unwrap();

    manager.import_pcap("one.pcap");
    wait_quiescent(&manager).await;

    let status = manager.status().await.unwrap();
    assert_eq!(status.stream_count, 2);
    assert_eq!(status.index_count, 1);
    assert_eq!(status.pcap_count, 1);

    let tags = manager.list_tags().await.unwrap();
    let by_name: HashMap<_, _> = tags.iter().map(|t| (t.name.clone(), t)).collect();
    assert_eq!(by_name["service/http"].matching_count, 1);
    assert_eq!(by_name["service/http"].uncertain_count, 0);
    assert!(by_name["service/http"].referenced);
    assert_eq!(by_name["tag/slow"].matching_count, 1);
    assert_eq!(by_name["tag/slow"].uncertain_count, 0);

    manager.close().await;
}

#[tokio::test]
async fn mark_tags_update_via_the_api() {
    let dir = TempDir::new().unwrap();
    let builder = FakeBuilder::new();
    builder.stage(
        "caps.pcap",
        (0..8).map(|id| stream(id, 80, "payload")).collect(),
    );

    let manager = Manager::start(config_in(&dir), builder).await.unwrap();
    manager.import_pcap("caps.pcap");
    wait_quiescent(&manager).await;

    manager.add_tag("mark/favs", "#f00", "id:3,7").await.unwrap();
    manager
        .update_tag("mark/favs", UpdateTagOp::MarkAdd(vec![5]))
        .await
        .unwrap();
    wait_quiescent(&manager).await;

    let tags = manager.list_tags().await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].definition, "id:3,5,7");
    assert_eq!(tags[0].matching_count, 3);
    assert_eq!(tags[0].uncertain_count, 0);

    assert!(manager
        .update_tag("mark/favs", UpdateTagOp::MarkAdd(vec![100]))
        .await
        .is_err());

    manager.close().await;
}

#[tokio::test]
async fn small_indexes_get_merged() {
    let dir = TempDir::new().unwrap();
    let builder = FakeBuilder::new();
    builder.stage(
        "a.pcap",
        (0..2).map(|id| stream(id, 80, "aa")).collect(),
    );
    builder.stage(
        "b.pcap",
        (2..5).map(|id| stream(id, 80, "bb")).collect(),
    );

    let manager = Manager::start(config_in(&dir), builder).await.unwrap();
    manager.import_pcap("a.pcap");
    manager.import_pcap("b.pcap");
    wait_quiescent(&manager).await;

    let status = manager.status().await.unwrap();
    assert_eq!(status.stream_count, 5);
    assert_eq!(
        status.index_count, 1,
        "two small indexes should merge into one"
    );
    // The base reference is the only lock left per index.
    assert_eq!(status.index_lock_count, status.index_count);

    manager.close().await;
}

#[tokio::test]
async fn views_answer_searches_and_release_their_locks() {
    let dir = TempDir::new().unwrap();
    let builder = FakeBuilder::new();
    builder.stage(
        "one.pcap",
        vec![
            stream(0, 80, "GET / HTTP/1.1"),
            stream(1, 80, "POST /form"),
            stream(2, 22, "SSH-2.0"),
        ],
    );

    let manager = Manager::start(config_in(&dir), builder).await.unwrap();
    manager.add_tag("service/http", "#0f0", "sport:80").await.unwrap();
    manager.import_pcap("one.pcap");
    wait_quiescent(&manager).await;

    let mut view = manager.view();
    let query = Query::parse("data:\"GET\"").unwrap();
    let mut found = Vec::new();
    let (has_more, _) = view
        .search_streams(&query, StreamsOptions::default(), |ctx| {
            found.push(ctx.stream().id);
            assert!(ctx.has_tag("service/http"));
            assert_eq!(ctx.all_tags(), vec!["service/http"]);
            Ok(())
        })
        .await
        .unwrap();
    assert!(!has_more);
    assert_eq!(found, vec![0]);

    let mut all = Vec::new();
    view.all_streams(StreamsOptions::default(), |ctx| {
        all.push(ctx.stream().id);
        Ok(())
    })
    .await
    .unwrap();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2]);

    assert!(view.reference_time().await.unwrap().is_some());
    let ctx = view.stream(2).await.unwrap().expect("stream 2 exists");
    assert_eq!(ctx.stream().server_port, 22);
    assert!(view.stream(99).await.unwrap().is_none());

    let locked = manager.status().await.unwrap().index_lock_count;
    drop(view);
    wait_quiescent(&manager).await;
    let status = manager.status().await.unwrap();
    assert_eq!(status.index_lock_count, locked - status.index_count);

    manager.close().await;
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    {
        let builder = FakeBuilder::new();
        builder.stage(
            "one.pcap",
            vec![stream(0, 80, "GET /"), stream(1, 443, "POST /")],
        );
        let manager = Manager::start(config_in(&dir), builder).await.unwrap();
        manager.import_pcap("one.pcap");
        wait_quiescent(&manager).await;
        manager.add_tag("service/http", "#0f0", "sport:80").await.unwrap();
        manager.add_tag("mark/favs", "#f00", "id:1").await.unwrap();
        wait_quiescent(&manager).await;
        manager.close().await;
    }

    // Fresh process: indexes come from disk, tags from the state file.
    let manager = Manager::start(config_in(&dir), FakeBuilder::new())
        .await
        .unwrap();
    wait_quiescent(&manager).await;

    let status = manager.status().await.unwrap();
    assert_eq!(status.stream_count, 2);
    assert_eq!(status.pcap_count, 1, "known pcaps come from the state file");

    let tags = manager.list_tags().await.unwrap();
    let by_name: HashMap<_, _> = tags.iter().map(|t| (t.name.clone(), t)).collect();
    assert_eq!(by_name["service/http"].matching_count, 1);
    assert_eq!(by_name["mark/favs"].matching_count, 1);
    assert_eq!(by_name["mark/favs"].uncertain_count, 0);

    manager.close().await;
}

#[tokio::test]
async fn deleting_a_referenced_tag_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = Manager::start(config_in(&dir), FakeBuilder::new())
        .await
        .unwrap();
    manager.add_tag("service/http", "", "sport:80").await.unwrap();
    manager.add_tag("tag/slow", "", "@service:http").await.unwrap();

    let err = manager.del_tag("service/http").await.unwrap_err();
    assert!(err.to_string().contains("references"), "{err}");

    manager.del_tag("tag/slow").await.unwrap();
    manager.del_tag("service/http").await.unwrap();
    assert!(manager.list_tags().await.unwrap().is_empty());

    manager.close().await;
}
