//! Per-chunk downloader: fetches one day-chunk's miniSEED data and files it
//! into the local archive.
//!
//! This is the body of the `rover download <url>` subcommand that
//! `worker_pool` spawns as a child process per in-flight chunk: each
//! invocation re-reads its own config (passed as `-f <path>` by the parent,
//! see [`crate::manager`]), GETs one fully-formed dataselect URL, streams the
//! response to a unique temp file, then moves it into the archive (or
//! deletes it, depending on `delete_files`). Retries on retryable
//! transport/HTTP errors via the shared [`crate::retry`] policy.

use crate::config::RoverConfig;
use crate::coverage::Timespan;
use crate::retrieval::DayChunk;
use crate::retry::{run_with_retry, RetryPolicy, SegmentError};
use crate::stream_id::StreamId;
use anyhow::{anyhow, Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Renders the dataselect GET URL for one stream-id's day-chunk:
/// `{dataselect_url}?net=..&sta=..&loc=..&cha=..&start=..&end=..`, per the
/// wire format the availability and dataselect services share.
pub fn build_url(dataselect_url: &str, stream_id: &StreamId, chunk: DayChunk) -> String {
    let start = crate::time::format_epoch(chunk.begin);
    let end = crate::time::format_epoch(chunk.end);
    format!("{}?{}", dataselect_url, stream_id.dataselect_query(&start, &end))
}

/// Recovers the stream-id and requested timespan a dataselect URL was built
/// for, so the child process (which only receives the URL) knows what it's
/// downloading without the parent having to pass any other argument.
pub fn parse_dataselect_url(url: &str) -> Result<(StreamId, Timespan)> {
    let query = url
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| anyhow!("dataselect URL has no query string: {url}"))?;

    let mut net = None;
    let mut sta = None;
    let mut loc = None;
    let mut cha = None;
    let mut start = None;
    let mut end = None;
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else { continue };
        match key {
            "net" => net = Some(value),
            "sta" => sta = Some(value),
            "loc" => loc = Some(value),
            "cha" => cha = Some(value),
            "start" => start = Some(value),
            "end" => end = Some(value),
            _ => {}
        }
    }
    let (net, sta, loc, cha, start, end) = (
        net.ok_or_else(|| anyhow!("missing net= in {url}"))?,
        sta.ok_or_else(|| anyhow!("missing sta= in {url}"))?,
        loc.ok_or_else(|| anyhow!("missing loc= in {url}"))?,
        cha.ok_or_else(|| anyhow!("missing cha= in {url}"))?,
        start.ok_or_else(|| anyhow!("missing start= in {url}"))?,
        end.ok_or_else(|| anyhow!("missing end= in {url}"))?,
    );
    let stream_id = StreamId::new(
        decode(net),
        decode(sta),
        decode(loc),
        decode(cha),
    );
    let begin = crate::time::parse_epoch(start).context("parsing start= in dataselect URL")?;
    let end = crate::time::parse_epoch(end).context("parsing end= in dataselect URL")?;
    Ok((stream_id, Timespan::new(begin, end)))
}

fn decode(field: &str) -> String {
    if field == "--" {
        String::new()
    } else {
        field.to_string()
    }
}

/// Downloads one chunk end to end: GET, stream to temp file, retry on
/// failure, then archive (or delete) on success. Returns the final path,
/// or `None` if `delete_files` removed it.
pub fn download_chunk(cfg: &RoverConfig, url: &str) -> Result<Option<PathBuf>> {
    let (stream_id, span) = parse_dataselect_url(url)?;
    let retry_policy = RetryPolicy {
        max_attempts: cfg.http_retries.max(1),
        ..RetryPolicy::default()
    };
    let http_timeout = cfg.http_timeout();

    let mut result_path: Option<PathBuf> = None;
    run_with_retry(&retry_policy, || {
        match fetch_to_temp_file(url, &stream_id, &cfg.temp_dir, http_timeout) {
            Ok(path) => {
                result_path = Some(path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    })
    .map_err(|e| {
        warn!(
            stream_id = %stream_id,
            span_begin = span.begin,
            span_end = span.end,
            error = %e,
            "chunk download failed, giving up"
        );
        anyhow!("downloading {} [{}, {}): {}", stream_id, span.begin, span.end, e)
    })?;
    let temp_path = result_path.expect("run_with_retry succeeded without producing a temp file");

    let ingest_db = per_process_ingest_db_path(&cfg.temp_dir, url);
    let result = if cfg.delete_files {
        fs::remove_file(&temp_path).ok();
        Ok(None)
    } else {
        ingest(cfg, &stream_id, span, &temp_path, &ingest_db).map(Some)
    };

    if cfg.delete_files {
        // On any exit path, deletion also claims the per-process ingest
        // database: nothing else will ever read it once this worker exits.
        fs::remove_file(&ingest_db).ok();
    }
    result
}

/// Names a per-process-unique SQLite database for one worker's ingest/index
/// step, derived from a hash of the URL it's downloading plus this process's
/// PID, so two workers racing on the same stream never share a writer.
fn per_process_ingest_db_path(temp_dir: &Path, url: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    temp_dir.join(format!("rover_ingest-{:016x}.sqlite", hasher.finish()))
}

/// GETs `url` and streams the response body into a uniquely-named temp file
/// under `temp_dir`. Returns the temp file's path on success.
fn fetch_to_temp_file(
    url: &str,
    stream_id: &StreamId,
    temp_dir: &Path,
    http_timeout: Duration,
) -> Result<PathBuf, SegmentError> {
    fs::create_dir_all(temp_dir).map_err(SegmentError::Storage)?;
    let named = tempfile::Builder::new()
        .prefix(&format!("rover_download-{}-", stream_id))
        .suffix(".mseed")
        .tempfile_in(temp_dir)
        .map_err(SegmentError::Storage)?;
    let file = Arc::new(Mutex::new(named.reopen().map_err(SegmentError::Storage)?));

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(SegmentError::Curl)?;
    easy.timeout(http_timeout).map_err(SegmentError::Curl)?;
    easy.connect_timeout(Duration::from_secs(15))
        .map_err(SegmentError::Curl)?;

    let write_file = Arc::clone(&file);
    {
        let mut transfer = easy.transfer();
        transfer
            .write_function(move |data| {
                let mut f = write_file.lock().unwrap();
                match f.write_all(data) {
                    Ok(()) => Ok(data.len()),
                    Err(_) => Ok(0), // abort transfer, surfaced as a curl error below
                }
            })
            .map_err(SegmentError::Curl)?;
        transfer.perform().map_err(SegmentError::Curl)?;
    }

    let code = easy.response_code().map_err(SegmentError::Curl)?;
    if code == 204 {
        // No data for this window; leave an empty file rather than treating
        // it as an error the retry policy would chase.
    } else if !(200..300).contains(&code) {
        return Err(SegmentError::Http(code));
    }

    named
        .into_temp_path()
        .keep()
        .map_err(|e| SegmentError::Storage(e.error))
}

/// Files a downloaded temp file into the archive, named by stream-id and
/// UTC day, then (if configured) runs the external ingester and indexer
/// against it. Grouping by stream-id and day matches the request
/// granularity (one request per day-chunk), so each archived file
/// corresponds to exactly one completed `Retrieval` day.
///
/// `ingest_cmd`/`index_cmd` are genuinely external collaborators: when
/// configured, this only invokes them as subprocesses against `ingest_db`
/// and checks their exit status, the same contract the worker pool uses
/// for the download child itself. When unset (the default — no such
/// program installed in this environment), the archive filing above is
/// this crate's own fallback rather than a no-op.
fn ingest(
    cfg: &RoverConfig,
    stream_id: &StreamId,
    span: Timespan,
    temp_path: &Path,
    ingest_db: &Path,
) -> Result<PathBuf> {
    let day = crate::time::format_epoch(span.begin);
    let day = day.split('T').next().unwrap_or(&day);
    let dest_dir = cfg.archive_root.join(&stream_id.network).join(&stream_id.station);
    fs::create_dir_all(&dest_dir)
        .with_context(|| format!("creating archive directory {}", dest_dir.display()))?;
    let dest = dest_dir.join(format!("{}.{}.mseed", stream_id, day));
    fs::rename(temp_path, &dest)
        .or_else(|_| fs::copy(temp_path, &dest).map(|_| ()).and_then(|_| fs::remove_file(temp_path)))
        .with_context(|| format!("filing {} into archive", dest.display()))?;

    if let Some(ingest_cmd) = &cfg.ingest_cmd {
        run_collaborator(ingest_cmd, &dest, ingest_db, "ingest")?;
    }
    if let Some(index_cmd) = &cfg.index_cmd {
        run_collaborator(index_cmd, &dest, ingest_db, "index")?;
    }
    Ok(dest)
}

/// Spawns one external collaborator (`ingest_cmd`/`index_cmd`) against a
/// just-filed archive path and this worker's per-process database,
/// propagating a non-zero exit as an error the same way the manager treats
/// a failed download worker.
fn run_collaborator(cmd: &Path, archived: &Path, ingest_db: &Path, label: &str) -> Result<()> {
    let status = Command::new(cmd)
        .arg("--db")
        .arg(ingest_db)
        .arg(archived)
        .status()
        .with_context(|| format!("spawning {label} collaborator {}", cmd.display()))?;
    if !status.success() {
        anyhow::bail!("{label} collaborator {} exited with {status}", cmd.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> StreamId {
        StreamId::new("IU", "ANMO", "00", "BHZ")
    }

    #[test]
    fn build_url_round_trips_through_parse() {
        let chunk = DayChunk { begin: 1672574400.0, end: 1672617600.0 };
        let url = build_url("http://example.invalid/dataselect", &sid(), chunk);
        assert!(url.starts_with("http://example.invalid/dataselect?net=IU&sta=ANMO&loc=00&cha=BHZ"));

        let (stream_id, span) = parse_dataselect_url(&url).unwrap();
        assert_eq!(stream_id, sid());
        assert!((span.begin - chunk.begin).abs() < 1e-6);
        assert!((span.end - chunk.end).abs() < 1e-6);
    }

    #[test]
    fn build_url_canonicalises_empty_fields_to_dashes() {
        let id = StreamId::new("IU", "ANMO", "", "BHZ");
        let chunk = DayChunk { begin: 0.0, end: 10.0 };
        let url = build_url("http://example.invalid/dataselect", &id, chunk);
        assert!(url.contains("loc=--"));
        let (parsed, _) = parse_dataselect_url(&url).unwrap();
        assert_eq!(parsed.location, "");
    }

    #[test]
    fn parse_dataselect_url_rejects_missing_query() {
        assert!(parse_dataselect_url("http://example.invalid/dataselect").is_err());
    }

    #[test]
    fn ingest_names_file_by_stream_and_day() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.mseed");
        fs::write(&src, b"hello").unwrap();

        let mut cfg = RoverConfig::default();
        cfg.archive_root = dir.path().join("archive");

        let span = Timespan::new(1672574400.0, 1672617600.0); // 2023-01-01
        let ingest_db = dir.path().join("ingest.sqlite");
        let dest = ingest(&cfg, &sid(), span, &src, &ingest_db).unwrap();
        assert!(dest.exists());
        assert!(dest.to_string_lossy().contains("2023-01-01"));
        assert!(dest.to_string_lossy().contains("IU"));
        assert!(dest.to_string_lossy().contains("ANMO"));
    }

    #[test]
    fn per_process_ingest_db_path_is_stable_for_same_url_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        let a = per_process_ingest_db_path(dir.path(), "http://example.invalid/dataselect?a=1");
        let b = per_process_ingest_db_path(dir.path(), "http://example.invalid/dataselect?a=1");
        let c = per_process_ingest_db_path(dir.path(), "http://example.invalid/dataselect?a=2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
