//! FDSN availability service client.
//!
//! POSTs a list of stream-id/timespan requests to an `availability`
//! (extent) web service and parses the whitespace-delimited text response
//! back into per-stream `Coverage`s.

mod parse;

use crate::coverage::Coverage;
use crate::retry::{run_with_retry, RetryPolicy, SegmentError};
use anyhow::{anyhow, Result};
use std::time::Duration;

pub use parse::parse_availability;

/// Thin client over one availability service endpoint.
pub struct AvailabilityClient {
    url: String,
    connect_timeout: Duration,
    timeout: Duration,
}

impl AvailabilityClient {
    /// `timeout` is the configured per-attempt HTTP timeout
    /// (`RoverConfig::http_timeout`); `connect_timeout` stays a fixed
    /// safety net, matching `chunk_downloader::fetch_to_temp_file`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        AvailabilityClient {
            url: url.into(),
            connect_timeout: Duration::from_secs(15),
            timeout,
        }
    }

    /// POSTs `body` (one or more `mergequality=true` / SNCL+time lines, see
    /// [`crate::source::Source::build_availability_request`]) and returns
    /// the raw text response, retrying transient transport/HTTP failures
    /// per `retry_policy` exactly as `chunk_downloader::download_chunk`
    /// retries the dataselect GET. Runs on the current thread; call via
    /// `spawn_blocking` from async code.
    pub fn post(&self, body: &str, retry_policy: &RetryPolicy) -> Result<String> {
        let mut response_text: Option<String> = None;
        run_with_retry(retry_policy, || match self.post_once(body) {
            Ok(text) => {
                response_text = Some(text);
                Ok(())
            }
            Err(e) => Err(e),
        })
        .map_err(|e| anyhow!("availability POST to {}: {}", self.url, e))?;
        Ok(response_text.expect("run_with_retry succeeded without producing a response"))
    }

    /// One POST attempt, mapped into `SegmentError` so `run_with_retry` can
    /// classify and back off the same way it does for chunk downloads.
    fn post_once(&self, body: &str) -> Result<String, SegmentError> {
        let mut response = Vec::new();
        let mut easy = curl::easy::Easy::new();
        easy.url(&self.url).map_err(SegmentError::Curl)?;
        easy.post(true).map_err(SegmentError::Curl)?;
        easy.post_fields_copy(body.as_bytes())
            .map_err(SegmentError::Curl)?;
        easy.connect_timeout(self.connect_timeout)
            .map_err(SegmentError::Curl)?;
        easy.timeout(self.timeout).map_err(SegmentError::Curl)?;
        {
            let mut transfer = easy.transfer();
            transfer
                .write_function(|data| {
                    response.extend_from_slice(data);
                    Ok(data.len())
                })
                .map_err(SegmentError::Curl)?;
            transfer.perform().map_err(SegmentError::Curl)?;
        }

        let code = easy.response_code().map_err(SegmentError::Curl)?;
        if code == 204 {
            return Ok(String::new());
        }
        if code < 200 || code >= 300 {
            return Err(SegmentError::Http(code));
        }
        String::from_utf8(response).map_err(|e| {
            SegmentError::Storage(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    /// Convenience: POST (with retry) then parse into per-stream coverages.
    pub fn query(
        &self,
        body: &str,
        retry_policy: &RetryPolicy,
        timespan_tol: f64,
        timespan_inc: f64,
    ) -> Result<Vec<Coverage>> {
        let text = self.post(body, retry_policy)?;
        parse_availability(&text, timespan_tol, timespan_inc)
    }
}
