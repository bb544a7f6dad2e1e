//! Packet parser boundary.
//!
//! Device-specific decoders implement [`PacketParser`].  The built-in
//! [`RawPointParser`] reads a plain little-endian point record stream:
//!
//! ```text
//! magic  "LTP1"                       4 bytes
//! count  u16                          2 bytes
//! count × {
//!     range_m        f32
//!     azimuth_deg    f32
//!     elevation_deg  f32
//!     ring           u16
//!     intensity      u8
//!     timestamp_ns   i64
//! }                                   23 bytes each
//! ```
//!
//! A structurally invalid datagram is rejected as a whole; the caller counts
//! it and carries on.

use lidartrack_types::Point;
use thiserror::Error;

pub const RAW_MAGIC: &[u8; 4] = b"LTP1";
const HEADER_LEN: usize = 6;
const RECORD_LEN: usize = 23;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram too short ({0} bytes)")]
    Truncated(usize),
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("header announces {count} points but body holds {body} bytes")]
    LengthMismatch { count: usize, body: usize },
    #[error("point {0} has a non-finite field")]
    NonFinite(usize),
}

/// Turns one datagram into sensor-frame points.
pub trait PacketParser: Send + Sync {
    fn parse(&self, datagram: &[u8]) -> Result<Vec<Point>, ParseError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawPointParser;

impl PacketParser for RawPointParser {
    fn parse(&self, datagram: &[u8]) -> Result<Vec<Point>, ParseError> {
        if datagram.len() < HEADER_LEN {
            return Err(ParseError::Truncated(datagram.len()));
        }
        let (header, body) = datagram.split_at(HEADER_LEN);
        let magic = [header[0], header[1], header[2], header[3]];
        if &magic != RAW_MAGIC {
            return Err(ParseError::BadMagic(magic));
        }
        let count = u16::from_le_bytes([header[4], header[5]]) as usize;
        if body.len() != count * RECORD_LEN {
            return Err(ParseError::LengthMismatch {
                count,
                body: body.len(),
            });
        }

        let mut points = Vec::with_capacity(count);
        for (i, rec) in body.chunks_exact(RECORD_LEN).enumerate() {
            let f = |at: usize| f32::from_le_bytes([rec[at], rec[at + 1], rec[at + 2], rec[at + 3]]);
            let range = f(0);
            let azimuth = f(4);
            let elevation = f(8);
            if !(range.is_finite() && azimuth.is_finite() && elevation.is_finite()) {
                return Err(ParseError::NonFinite(i));
            }
            let ring = u16::from_le_bytes([rec[12], rec[13]]);
            let intensity = rec[14];
            let mut ts = [0u8; 8];
            ts.copy_from_slice(&rec[15..23]);
            // Zero range means "no return" on every device we feed from.
            if range <= 0.0 {
                continue;
            }
            points.push(Point::from_polar(
                range,
                azimuth,
                elevation,
                ring,
                intensity,
                i64::from_le_bytes(ts),
            ));
        }
        Ok(points)
    }
}

/// Encode points in the raw record format (replay tooling and tests).
pub fn encode_raw(points: &[Point]) -> Vec<u8> {
    let count = points.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(HEADER_LEN + count * RECORD_LEN);
    out.extend_from_slice(RAW_MAGIC);
    out.extend_from_slice(&(count as u16).to_le_bytes());
    for p in &points[..count] {
        out.extend_from_slice(&p.range_m.to_le_bytes());
        out.extend_from_slice(&p.azimuth_deg.to_le_bytes());
        out.extend_from_slice(&p.elevation_deg.to_le_bytes());
        out.extend_from_slice(&p.ring.to_le_bytes());
        out.push(p.intensity);
        out.extend_from_slice(&p.timestamp_ns.to_le_bytes());
    }
    out
}
