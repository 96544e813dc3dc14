//! Parses the stream-id named by the first data line of a request file, so a
//! `retrieve`/`list-retrieve` invocation has something to key its `Source`
//! by. The full file content is still passed through to the core verbatim:
//! this module only peeks at the first line, it never reinterprets the rest.

use anyhow::{bail, Context, Result};
use rover_core::stream_id::StreamId;
use std::path::Path;

/// Reads `path` and returns its raw contents plus the `StreamId` named by
/// its first non-comment, non-blank line (`NET STA LOC CHA BEGIN END`,
/// dashes for empty codes).
pub fn read(path: &Path) -> Result<(String, StreamId)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading request file {}", path.display()))?;
    let stream_id = first_stream_id(&text)
        .with_context(|| format!("request file {} has no data lines", path.display()))?;
    Ok((text, stream_id))
}

fn first_stream_id(text: &str) -> Result<StreamId> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            bail!("malformed request line: {line}");
        }
        let decode = |f: &str| if f == "--" { String::new() } else { f.to_string() };
        return Ok(StreamId::new(
            decode(fields[0]),
            decode(fields[1]),
            decode(fields[2]),
            decode(fields[3]),
        ));
    }
    bail!("no data lines found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_stream_id_skipping_comments() {
        let text = "# comment\nIU ANMO 00 BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\nIU COLA 00 BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n";
        let id = first_stream_id(text).unwrap();
        assert_eq!(id.to_string(), "IU_ANMO_00_BHZ");
    }

    #[test]
    fn decanonicalises_dash_fields() {
        let text = "IU ANMO -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n";
        let id = first_stream_id(text).unwrap();
        assert_eq!(id.location, "");
    }

    #[test]
    fn rejects_empty_file() {
        assert!(first_stream_id("\n# only a comment\n").is_err());
    }
}
