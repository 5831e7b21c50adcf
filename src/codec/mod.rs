//! pcap container framing shared by the capture agent and the stream client.
//!
//! The writer always emits the classic little-endian, microsecond-resolution
//! format. The decoder additionally accepts the byte-swapped and
//! nanosecond-resolution variants so output from foreign agents stays
//! readable.

use std::io::{self, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{ProtocolError, StreamError};

/// Largest frame the system captures or transports - a jumbo Ethernet frame.
pub const MAX_FRAME_LENGTH: u32 = 9000;

/// libpcap's MAXIMUM_SNAPLEN; headers claiming more are rejected.
pub const MAX_SNAPLEN: u32 = 262_144;

const FILE_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;

/// pcap link-layer encapsulation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkType(pub u32);

impl LinkType {
    /// IEEE 802.3 Ethernet.
    pub const ETHERNET: LinkType = LinkType(1);
    /// Linux "cooked" capture. Link-independent, so frames from interfaces
    /// with different native encapsulations can share one stream.
    pub const LINUX_SLL: LinkType = LinkType(113);
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One captured packet record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub timestamp: SystemTime,
    /// Length on the wire; may exceed the captured payload when truncated.
    pub original_length: u32,
    pub payload: Bytes,
}

impl CapturedFrame {
    pub fn new(timestamp: SystemTime, original_length: u32, payload: Bytes) -> Self {
        Self {
            timestamp,
            original_length,
            payload,
        }
    }

    pub fn captured_length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Timestamp as pcap record fields. Pre-epoch timestamps clamp to zero.
    fn timestamp_parts(&self) -> (u32, u32) {
        let since_epoch = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (since_epoch.as_secs() as u32, since_epoch.subsec_micros())
    }
}

/// Stream-level metadata, written once before any frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub snaplen: u32,
    pub link_type: LinkType,
}

/// Writes the container format to a blocking sink.
///
/// A write failure means the peer is gone; from the writer's perspective that
/// is the normal way a stream ends, not an anomaly.
pub struct FrameWriter<W> {
    sink: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    /// Write the global header. Must be called exactly once, first.
    pub fn write_header(&mut self, snaplen: u32, link_type: LinkType) -> io::Result<()> {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC_MICROS.to_le_bytes());
        buf[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        buf[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        // bytes 8..16: timezone offset and timestamp accuracy, always zero
        buf[16..20].copy_from_slice(&snaplen.to_le_bytes());
        buf[20..24].copy_from_slice(&link_type.0.to_le_bytes());
        self.sink.write_all(&buf)
    }

    /// Write one frame record: 16-byte record header plus payload.
    ///
    /// Header and payload go out as one write, so a failing sink never ends
    /// up holding a record header with no payload behind it.
    pub fn write_frame(&mut self, frame: &CapturedFrame) -> io::Result<()> {
        let (secs, micros) = frame.timestamp_parts();
        let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + frame.payload.len());
        buf.extend_from_slice(&secs.to_le_bytes());
        buf.extend_from_slice(&micros.to_le_bytes());
        buf.extend_from_slice(&frame.captured_length().to_le_bytes());
        buf.extend_from_slice(&frame.original_length.to_le_bytes());
        buf.extend_from_slice(&frame.payload);
        self.sink.write_all(&buf)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }
}

/// Incremental decoder for the container format.
///
/// Consumes the global header on first use, then yields one [`CapturedFrame`]
/// per record. Payloads are split from the receive buffer without copying.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: Option<ContainerHeader>,
    swapped: bool,
    nanos: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stream header, once decoded.
    pub fn header(&self) -> Option<ContainerHeader> {
        self.header
    }

    fn read_u16(&self, bytes: &[u8]) -> u16 {
        let raw = [bytes[0], bytes[1]];
        if self.swapped {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        }
    }

    fn read_u32(&self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if self.swapped {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        }
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<ContainerHeader, StreamError> {
        let magic = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        (self.swapped, self.nanos) = match magic {
            MAGIC_MICROS => (false, false),
            MAGIC_NANOS => (false, true),
            m if m.swap_bytes() == MAGIC_MICROS => (true, false),
            m if m.swap_bytes() == MAGIC_NANOS => (true, true),
            m => return Err(ProtocolError::BadMagic(m).into()),
        };

        let major = self.read_u16(&src[4..6]);
        let minor = self.read_u16(&src[6..8]);
        if (major, minor) != (VERSION_MAJOR, VERSION_MINOR) {
            return Err(ProtocolError::UnsupportedVersion { major, minor }.into());
        }

        // bytes 8..16 (timezone offset, timestamp accuracy) carry no data
        let snaplen = self.read_u32(&src[16..20]);
        let link_type = LinkType(self.read_u32(&src[20..24]));
        if snaplen > MAX_SNAPLEN {
            return Err(ProtocolError::SnaplenTooLarge(snaplen).into());
        }

        src.advance(FILE_HEADER_LEN);
        let header = ContainerHeader { snaplen, link_type };
        self.header = Some(header);
        Ok(header)
    }
}

impl Decoder for FrameDecoder {
    type Item = CapturedFrame;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<CapturedFrame>, StreamError> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if src.len() < FILE_HEADER_LEN {
                    return Ok(None);
                }
                self.decode_header(src)?
            }
        };

        if src.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }

        let secs = self.read_u32(&src[0..4]);
        let frac = self.read_u32(&src[4..8]);
        let captured = self.read_u32(&src[8..12]);
        let original = self.read_u32(&src[12..16]);

        if captured > header.snaplen {
            return Err(ProtocolError::OversizedRecord {
                length: captured,
                snaplen: header.snaplen,
            }
            .into());
        }

        let total = RECORD_HEADER_LEN + captured as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(RECORD_HEADER_LEN);
        let payload = src.split_to(captured as usize).freeze();

        let frac_nanos = if self.nanos {
            frac as u64
        } else {
            frac as u64 * 1_000
        };
        let timestamp =
            UNIX_EPOCH + Duration::from_secs(secs as u64) + Duration::from_nanos(frac_nanos);

        Ok(Some(CapturedFrame::new(timestamp, original, payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<CapturedFrame>, StreamError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Truncated.into()),
        }
    }
}
