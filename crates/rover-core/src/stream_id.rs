//! Stream identifiers: network / station / location / channel.
//!
//! Rendered on the wire as an underscore-joined string with empty fields
//! canonicalised to `--`; held internally with empty fields as `""` so
//! comparisons and URL building don't need to special-case the wire form.

use std::fmt;

/// A single seismic trace identifier: network, station, location, channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl StreamId {
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        location: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        StreamId {
            network: network.into(),
            station: station.into(),
            location: location.into(),
            channel: channel.into(),
        }
    }

    /// Parses the underscore-joined wire form (`N_S_L_C`, `--` for empty fields).
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(4, '_');
        let network = parts.next()?;
        let station = parts.next()?;
        let location = parts.next()?;
        let channel = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some(StreamId::new(
            decanonicalise(network),
            decanonicalise(station),
            decanonicalise(location),
            decanonicalise(channel),
        ))
    }

    /// Query-string fragment for the dataselect URL: `net=..&sta=..&loc=..&cha=..`.
    pub fn query_params(&self) -> String {
        format!(
            "net={}&sta={}&loc={}&cha={}",
            canonicalise(&self.network),
            canonicalise(&self.station),
            canonicalise(&self.location),
            canonicalise(&self.channel),
        )
    }

    /// The four wire-form fields (`--` for empty), for building POST request lines.
    pub fn wire_quad(&self) -> (&str, &str, &str, &str) {
        (
            canonicalise(&self.network),
            canonicalise(&self.station),
            canonicalise(&self.location),
            canonicalise(&self.channel),
        )
    }

    /// Full dataselect GET query string for one timespan:
    /// `net=..&sta=..&loc=..&cha=..&start=..&end=..`.
    pub fn dataselect_query(&self, start_iso: &str, end_iso: &str) -> String {
        format!("{}&start={}&end={}", self.query_params(), start_iso, end_iso)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            canonicalise(&self.network),
            canonicalise(&self.station),
            canonicalise(&self.location),
            canonicalise(&self.channel),
        )
    }
}

/// Empty field canonicalised to `--` for the wire form.
fn canonicalise(field: &str) -> &str {
    if field.is_empty() {
        "--"
    } else {
        field
    }
}

/// `--` decanonicalised back to an empty field for internal storage.
fn decanonicalise(field: &str) -> &str {
    if field == "--" {
        ""
    } else {
        field
    }
}
