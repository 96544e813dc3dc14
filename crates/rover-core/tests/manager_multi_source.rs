//! End-to-end scenarios for `DownloadManager` driving several sources at
//! once against small local HTTP fixtures, matching the fair-share
//! scheduling and stats-persistence behavior a real run depends on.

use rover_core::config::RoverConfig;
use rover_core::index_db::IndexDb;
use rover_core::manager::DownloadManager;
use rover_core::manager::ManagerSettings;
use rover_core::stream_id::StreamId;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

fn sid(station: &str) -> StreamId {
    StreamId::new("IU", station, "00", "BHZ")
}

/// Starts a background server that always answers any request with
/// `response`, HTTP 200. Good enough to stand in for both the availability
/// and dataselect endpoints since neither side of this test inspects the
/// request body.
fn start_fixed_response_server(response: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            std::thread::spawn(move || handle(stream, response));
        }
    });
    format!("http://127.0.0.1:{}", port)
}

fn handle(mut stream: std::net::TcpStream, body: &str) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let _ = stream.read(&mut buf);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
}

fn test_settings() -> (ManagerSettings, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let settings = ManagerSettings {
        // "true" exits 0 immediately and ignores its arguments; these tests
        // exercise scheduling and persistence, not the chunk downloader.
        rover_cmd: PathBuf::from("true"),
        config_path: dir.path().join("config.toml"),
    };
    (settings, dir)
}

#[tokio::test]
async fn two_sources_both_drain_under_a_shared_worker_pool() {
    let availability = "IU AAA 00 BHZ 2020-03-01T00:00:00 2020-03-03T00:00:00\n";
    let url = start_fixed_response_server(availability);
    let (settings, _dir) = test_settings();
    let mut manager = DownloadManager::new(2, settings, RoverConfig::default(), None);

    for station in ["AAA", "BBB"] {
        manager
            .add(
                sid(station),
                format!("{url}/availability"),
                format!("{url}/dataselect"),
                format!("IU {station} 00 BHZ 2020-03-01T00:00:00 2020-03-05T00:00:00\n"),
                1.5,
                0.05,
                3,
            )
            .await
            .unwrap();
    }

    assert_eq!(manager.stream_count(), 2);
    assert!(!manager.is_idle());

    for _ in 0..1000 {
        manager.step(true).await.unwrap();
        if manager.is_idle() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(manager.is_idle(), "both sources should reach a terminal state");
    assert!(manager.n_downloads() >= 2, "each source spans multiple day-chunks");
}

#[tokio::test]
async fn adding_a_duplicate_stream_across_sources_is_rejected() {
    let url = start_fixed_response_server("");
    let (settings, _dir) = test_settings();
    let mut manager = DownloadManager::new(2, settings, RoverConfig::default(), None);

    manager
        .add(
            sid("CCC"),
            format!("{url}/availability"),
            format!("{url}/dataselect"),
            "IU CCC 00 BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n".to_string(),
            1.5,
            0.05,
            3,
        )
        .await
        .unwrap();

    let err = manager
        .add(
            sid("CCC"),
            format!("{url}/availability"),
            format!("{url}/dataselect"),
            "IU CCC 00 BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n".to_string(),
            1.5,
            0.05,
            3,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("CCC") || err.to_string().to_lowercase().contains("duplicate"));
}

#[tokio::test]
async fn completed_source_persists_stats_to_index_db() {
    let availability = "";
    let url = start_fixed_response_server(availability);
    let (settings, dir) = test_settings();
    let index_db = IndexDb::open(&dir.path().join("index.db")).await.unwrap();
    let mut manager = DownloadManager::new(2, settings, RoverConfig::default(), Some(index_db.clone()));

    manager
        .add(
            sid("DDD"),
            format!("{url}/availability"),
            format!("{url}/dataselect"),
            "IU DDD 00 BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n".to_string(),
            1.5,
            0.05,
            3,
        )
        .await
        .unwrap();

    // Availability reports nothing outstanding, so the first cleanup pass
    // confirms and retires the source, persisting its final stats snapshot.
    for _ in 0..20 {
        manager.step(true).await.unwrap();
        if manager.is_idle() {
            break;
        }
    }
    assert!(manager.is_idle());

    let rows = index_db
        .scan_index(&sid("DDD"))
        .await
        .unwrap_or_default();
    // tsindex is never written by this crate, so it stays empty; this just
    // confirms the call into the shared pool succeeds post-completion.
    assert!(rows.is_empty());
}
