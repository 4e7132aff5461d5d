mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{
    playlist_urls, streamer, wait_for, AfterSegments, FakeContentStore, FakeResolver,
    FakeStreamPlan, MemoryStore, GATEWAY,
};
use offstream::db::Streamer;
use offstream::ipfs::GatewayTemplate;
use offstream::playlist::PlaylistType;
use offstream::record::{RecorderContext, SessionState, Worker, WorkerControl};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Session {
    store: Arc<MemoryStore>,
    content: Arc<FakeContentStore>,
    control: Arc<WorkerControl>,
    worker: Worker,
    _temp_dir: tempfile::TempDir,
}

fn session(
    streamer: Streamer,
    resolver: FakeResolver,
    content: FakeContentStore,
    flush_threshold: u64,
    playlist_type: Option<PlaylistType>,
) -> Session {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::with_streamers(vec![streamer.clone()]));
    let content = Arc::new(content);
    let context = RecorderContext {
        resolver: Arc::new(resolver),
        store: store.clone(),
        content: content.clone(),
        gateway: GatewayTemplate::new(GATEWAY),
        flush_threshold,
        playlist_type,
        temp_dir: Some(temp_dir.path().to_path_buf()),
    };
    let control = Arc::new(WorkerControl::new());
    let worker = Worker::new(streamer, Arc::new(context), Arc::clone(&control));
    Session {
        store,
        content,
        control,
        worker,
        _temp_dir: temp_dir,
    }
}

#[test]
fn test_session_walks_through_every_state() {
    let resolver =
        FakeResolver::new().live("alice", FakeStreamPlan::new(2, 100, AfterSegments::Block));
    let stats = Arc::clone(&resolver.stats);
    let content = FakeContentStore::new();
    // The final flush is slow enough to observe the drain
    content.slow_on("0.ts", Duration::from_millis(500));
    let s = session(streamer(1, "alice"), resolver, content, 10_000, Some(PlaylistType::Vod));
    let control = Arc::clone(&s.control);
    assert_eq!(control.state(), SessionState::Idle);

    let worker = s.worker;
    let running = thread::spawn(move || worker.run());

    assert!(wait_for(TIMEOUT, || stats.blocked() == 1));
    assert_eq!(control.state(), SessionState::Recording);

    control.close();
    assert!(wait_for(TIMEOUT, || control.state() == SessionState::Draining));

    let summary = running.join().unwrap().unwrap();
    assert_eq!(control.state(), SessionState::Closed);
    assert_eq!(summary.segments, 2);
    assert_eq!(summary.uploads.uploaded, 1);
    assert_eq!(s.store.url(0), s.content.last_playlist_url());
}

#[test]
fn test_offline_session_closes_without_recording() {
    let s = session(
        streamer(1, "alice"),
        FakeResolver::new(),
        FakeContentStore::new(),
        250,
        Some(PlaylistType::Vod),
    );
    let control = Arc::clone(&s.control);

    let summary = s.worker.run().unwrap();
    assert_eq!(control.state(), SessionState::Closed);
    assert_eq!(summary.stream_id, None);
    assert_eq!(s.store.stream_count(), 0);
}

#[test]
fn test_playlist_is_published_whatever_the_streamer_name() {
    let s = session(
        streamer(1, "team/alice"),
        FakeResolver::new().live("team/alice", FakeStreamPlan::new(5, 100, AfterSegments::End)),
        FakeContentStore::new(),
        250,
        Some(PlaylistType::Vod),
    );
    let content = Arc::clone(&s.content);
    let store = Arc::clone(&s.store);

    s.worker.run().unwrap();

    assert_eq!(content.directories.lock().unwrap().len(), 3);
    assert_eq!(content.playlist_count(), 3);
    assert_eq!(store.url(0), content.last_playlist_url());
    assert_eq!(playlist_urls(&content.last_playlist().unwrap()).len(), 5);
}

#[test]
fn test_configured_playlist_type_is_written() {
    let s = session(
        streamer(1, "alice"),
        FakeResolver::new().live("alice", FakeStreamPlan::new(1, 100, AfterSegments::End)),
        FakeContentStore::new(),
        250,
        Some(PlaylistType::Event),
    );
    let content = Arc::clone(&s.content);

    s.worker.run().unwrap();
    assert!(content
        .last_playlist()
        .unwrap()
        .starts_with("#EXTM3U\n#EXT-X-PLAYLIST-TYPE:EVENT\n"));

    let s = session(
        streamer(2, "bob"),
        FakeResolver::new().live("bob", FakeStreamPlan::new(1, 100, AfterSegments::End)),
        FakeContentStore::new(),
        250,
        None,
    );
    let content = Arc::clone(&s.content);

    s.worker.run().unwrap();
    assert!(!content.last_playlist().unwrap().contains("PLAYLIST-TYPE"));
}
