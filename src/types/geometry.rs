//! Geometry envelope extraction
//!
//! Geometry blobs are opaque to this crate. The only thing the index layer
//! needs is an envelope, which comes from an [`EnvelopeReader`]. The default
//! reader takes it from the GeoPackage binary header:
//!
//! ```text
//! "GP" | version | flags | srs_id (i32) | envelope (0/4/6/6/8 f64) | WKB ...
//! flags: bit0 byte order (1 = little endian)
//!        bit1-3 envelope indicator (0 none, 1 xy, 2 xyz, 3 xym, 4 xyzm)
//!        bit4 empty geometry
//! ```
//!
//! Headers without an envelope block yield `None`; decoding WKB is left to
//! the geometry library that wrote the blob.

use super::spatial::Envelope;
use crate::{Result, StorageError};

const MAGIC: [u8; 2] = *b"GP";
const HEADER_LEN: usize = 8;

/// Extracts the envelope of an encoded geometry value
pub trait EnvelopeReader: Send + Sync {
    /// `Ok(None)` for empty geometries and encodings without an envelope
    fn envelope(&self, geometry: &[u8]) -> Result<Option<Envelope>>;
}

/// Reads envelopes from the GeoPackage binary header
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoPackageHeaderReader;

impl EnvelopeReader for GeoPackageHeaderReader {
    fn envelope(&self, geometry: &[u8]) -> Result<Option<Envelope>> {
        if geometry.len() < HEADER_LEN || geometry[..2] != MAGIC {
            return Err(StorageError::InvalidData(
                "Geometry blob is missing the GeoPackage header".to_string(),
            ));
        }

        let flags = geometry[3];
        let little_endian = flags & 0x01 == 1;
        let indicator = (flags >> 1) & 0x07;
        let empty = (flags >> 4) & 0x01 == 1;

        let doubles = match indicator {
            0 => return Ok(None),
            1 => 4,
            2 | 3 => 6,
            4 => 8,
            other => {
                return Err(StorageError::InvalidData(format!(
                    "Unknown envelope indicator {}",
                    other
                )))
            }
        };
        if empty {
            return Ok(None);
        }

        let needed = HEADER_LEN + doubles * 8;
        if geometry.len() < needed {
            return Err(StorageError::InvalidData(format!(
                "Geometry header truncated: {} < {} bytes",
                geometry.len(),
                needed
            )));
        }

        let read = |i: usize| -> f64 {
            let start = HEADER_LEN + i * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&geometry[start..start + 8]);
            if little_endian {
                f64::from_le_bytes(raw)
            } else {
                f64::from_be_bytes(raw)
            }
        };

        let mut envelope = Envelope::new(read(0), read(1), read(2), read(3))?;
        match indicator {
            2 => envelope = envelope.with_z(read(4), read(5))?,
            3 => envelope = envelope.with_m(read(4), read(5))?,
            4 => envelope = envelope.with_z(read(4), read(5))?.with_m(read(6), read(7))?,
            _ => {}
        }
        Ok(Some(envelope))
    }
}

/// Encode a little-endian GeoPackage header carrying `envelope`.
///
/// Writers append the WKB body after it.
pub fn encode_header(srs_id: i32, envelope: Option<&Envelope>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 64);
    out.extend_from_slice(&MAGIC);
    out.push(0);

    let indicator: u8 = match envelope {
        None => 0,
        Some(e) => match (e.has_z(), e.has_m()) {
            (false, false) => 1,
            (true, false) => 2,
            (false, true) => 3,
            (true, true) => 4,
        },
    };
    out.push(0x01 | (indicator << 1));
    out.extend_from_slice(&srs_id.to_le_bytes());

    if let Some(e) = envelope {
        let mut push = |v: f64| out.extend_from_slice(&v.to_le_bytes());
        push(e.min_x);
        push(e.max_x);
        push(e.min_y);
        push(e.max_y);
        if let (Some(lo), Some(hi)) = (e.min_z, e.max_z) {
            push(lo);
            push(hi);
        }
        if let (Some(lo), Some(hi)) = (e.min_m, e.max_m) {
            push(lo);
            push(hi);
        }
    }
    out
}
