//! Payload packaging: JSON serialization, gzip compression, and size-bounded splitting.
//!
//! A batch is encoded as one JSON array and compressed. When the compressed
//! result does not fit under the packet ceiling, the batch is halved and each
//! half is packaged on its own, recursively. A single record that still does
//! not fit is dropped, since it can never be delivered.

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, error};

use crate::record::Record;

/// Maximum compressed size accepted by the ingest endpoint, in bytes.
pub const MAX_PACKET_SIZE: usize = 1_000_000;

/// Errors raised while encoding a batch.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("failed to serialize records: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to compress records: {0}")]
    Compress(#[from] std::io::Error),
}

/// One gzip-compressed JSON array, ready to be used as a request body.
#[derive(Debug, Clone)]
pub struct Payload {
    data: Bytes,
    records: usize,
}

impl Payload {
    /// Compressed size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of records encoded in this payload.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// The compressed body. Cloning is cheap.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Result of packaging a batch.
#[derive(Debug, Default)]
pub struct Packaged {
    /// Payloads in original record order
    pub payloads: Vec<Payload>,

    /// Records that could not be packaged and were discarded
    pub dropped_records: usize,
}

impl Packaged {
    /// Total number of records carried by the payloads.
    pub fn record_count(&self) -> usize {
        self.payloads.iter().map(Payload::record_count).sum()
    }
}

/// Turns batches of records into size-bounded payloads.
#[derive(Debug, Clone)]
pub struct PayloadPackager {
    max_packet_size: usize,
}

impl Default for PayloadPackager {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadPackager {
    /// Create a packager using the endpoint's packet ceiling.
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Create a packager with a lower ceiling. Values above
    /// [`MAX_PACKET_SIZE`] are clamped to it.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.clamp(1, MAX_PACKET_SIZE),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Package a batch into one or more payloads, each strictly smaller than
    /// the packet ceiling.
    ///
    /// Record order is preserved across the returned payloads. Records that
    /// cannot be packaged (an oversized single record, or a sub-batch that
    /// fails to encode) are dropped and counted in
    /// [`Packaged::dropped_records`].
    pub fn package(&self, batch: &[Record]) -> Packaged {
        let mut packaged = Packaged::default();
        self.package_into(batch, &mut packaged);
        packaged
    }

    fn package_into(&self, records: &[Record], out: &mut Packaged) {
        if records.is_empty() {
            return;
        }

        let data = match gzip_json(records) {
            Ok(data) => data,
            Err(e) => {
                error!(
                    error = %e,
                    records = records.len(),
                    "Failed to encode records, discarding them"
                );
                out.dropped_records += records.len();
                return;
            }
        };

        if data.len() < self.max_packet_size {
            out.payloads.push(Payload {
                data: Bytes::from(data),
                records: records.len(),
            });
            return;
        }

        if records.len() == 1 {
            error!(
                compressed_size = data.len(),
                max_packet_size = self.max_packet_size,
                "Can't compress record below the maximum packet size, discarding it"
            );
            out.dropped_records += 1;
            return;
        }

        let mid = records.len() / 2;
        debug!(
            records = records.len(),
            compressed_size = data.len(),
            max_packet_size = self.max_packet_size,
            "Records too big, splitting in half"
        );
        self.package_into(&records[..mid], out);
        self.package_into(&records[mid..], out);
    }
}

/// Encode records as a JSON array and gzip the result.
pub fn gzip_json(records: &[Record]) -> Result<Vec<u8>, PackageError> {
    let json = serde_json::to_vec(records)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}
