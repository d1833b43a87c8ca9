//! Newline-delimited encoding and compression of intake batches.

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::model::{IntakeEvent, MetadataRecord};

/// A batch encoded into an intake request body.
#[derive(Debug)]
pub(crate) struct EncodedBatch {
    /// The request body.
    pub(crate) body: Bytes,
    /// Whether `body` is gzip-compressed.
    pub(crate) compressed: bool,
    /// Number of events in the batch (excluding the metadata line).
    pub(crate) events: usize,
}

/// Serializes `events` into the newline-delimited intake body, prefixed by
/// the `metadata` record. Each line is self-contained, so record ordering
/// within the batch only matters for the metadata line coming first.
pub(crate) fn encode_batch(
    metadata: &MetadataRecord,
    events: &[IntakeEvent],
    compress: bool,
) -> Result<EncodedBatch, serde_json::Error> {
    let mut ndjson = Vec::with_capacity(events.len() * 256 + 256);
    append_line(&mut ndjson, &MetadataLine { metadata })?;
    for event in events {
        append_line(&mut ndjson, event)?;
    }

    if !compress {
        return Ok(EncodedBatch {
            body: Bytes::from(ndjson),
            compressed: false,
            events: events.len(),
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    match encoder.write_all(&ndjson).and_then(|_| encoder.finish()) {
        Ok(gz) => Ok(EncodedBatch {
            body: Bytes::from(gz),
            compressed: true,
            events: events.len(),
        }),
        Err(err) => {
            tracing::debug!(error = %err, "gzip encoding failed, sending batch uncompressed");
            Ok(EncodedBatch {
                body: Bytes::from(ndjson),
                compressed: false,
                events: events.len(),
            })
        }
    }
}

fn append_line<T: serde::Serialize>(
    buf: &mut Vec<u8>,
    value: &T,
) -> Result<(), serde_json::Error> {
    serde_json::to_writer(&mut *buf, value)?;
    buf.push(b'\n');
    Ok(())
}

struct MetadataLine<'a> {
    metadata: &'a MetadataRecord,
}

impl serde::Serialize for MetadataLine<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("metadata", self.metadata)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::model::{ErrorRecord, Exception};
    use crate::AgentConfig;
    use std::io::Read;

    fn metadata() -> MetadataRecord {
        let config = AgentConfig::builder()
            .with_service_name("encoder-test")
            .with_environment("dev")
            .build();
        MetadataRecord::new(&config)
    }

    fn sample_event() -> IntakeEvent {
        IntakeEvent::Error(ErrorRecord {
            id: "0".repeat(32),
            trace_id: None,
            transaction_id: None,
            parent_id: None,
            timestamp: 42,
            culprit: None,
            exception: Exception {
                message: "boom".into(),
                exception_type: None,
            },
        })
    }

    #[test]
    fn metadata_is_the_first_line() {
        let batch = encode_batch(&metadata(), &[sample_event()], false).unwrap();
        let text = String::from_utf8(batch.body.to_vec()).unwrap();
        let mut lines = text.lines();
        let first: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(
            first["metadata"]["service"]["name"],
            serde_json::json!("encoder-test")
        );
        assert_eq!(
            first["metadata"]["service"]["agent"]["name"],
            serde_json::json!("apm-agent-core")
        );
        let second: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(second["error"]["exception"]["message"], serde_json::json!("boom"));
        assert_eq!(lines.next(), None);
        assert_eq!(batch.events, 1);
    }

    #[test]
    fn compressed_batches_gunzip_to_the_uncompressed_form() {
        let events = [sample_event()];
        let plain = encode_batch(&metadata(), &events, false).unwrap();
        let gz = encode_batch(&metadata(), &events, true).unwrap();
        assert!(gz.compressed);

        let mut decoder = flate2::read::GzDecoder::new(&gz.body[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, plain.body.to_vec());
    }
}
