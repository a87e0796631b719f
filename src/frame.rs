//! FLIP frame codec.
//!
//! Sans-I/O: the caller feeds bytes in and takes frames out, and asks for
//! encoded frames to write. Two frame kinds share an 8-byte header:
//!
//! ```text
//! control: |1| version(15) | type(16) | flags(8) | length(24) | payload
//! data:    |0| stream id(31)          | flags(8) | length(24) | payload
//! ```
//!
//! Header blocks inside SYN_STREAM / SYN_REPLY are compressed with the
//! session's [`HeaderCompressor`] and inflated with its
//! [`HeaderDecompressor`]. The codec borrows those per call and never owns
//! them, so the compression context stays with the session.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FrameError;
use crate::header_block::{HeaderBlock, HeaderCompressor, HeaderDecompressor};

/// Protocol version spoken by this implementation.
pub const FLIP_VERSION: u16 = 1;

/// Size of the fixed frame header. Not counted in the length field.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest control frame payload accepted (256 KB).
pub const MAX_CONTROL_FRAME_SIZE: usize = 256 * 1024;

/// Largest value the 24-bit length field can carry.
pub const MAX_DATA_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Stream ids are 31 bits; the top bit is reserved.
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

const CONTROL_BIT: u8 = 0x80;

/// Control frame types.
#[allow(dead_code)]
pub mod control_type {
    pub const SYN_STREAM: u16 = 1;
    pub const SYN_REPLY: u16 = 2;
    pub const RST_STREAM: u16 = 3;
}

/// Frame flags.
pub mod flags {
    /// Sender will send nothing more on the stream.
    pub const FIN: u8 = 0x01;
}

/// RST_STREAM status codes.
#[allow(dead_code)]
pub mod rst_status {
    /// Normal close. Early FLIP servers end a stream with RST_STREAM(0)
    /// instead of a FIN-flagged frame.
    pub const NORMAL: u32 = 0;
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const INVALID_STREAM: u32 = 2;
    pub const REFUSED_STREAM: u32 = 3;
    pub const UNSUPPORTED_VERSION: u32 = 4;
    pub const CANCEL: u32 = 5;
    pub const INTERNAL_ERROR: u32 = 6;
    pub const FLOW_CONTROL_ERROR: u32 = 7;
}

/// SYN_STREAM priorities. Lower is more urgent.
pub mod priority {
    pub const HIGHEST: u8 = 0;
    pub const LOWEST: u8 = 3;
}

/// A parsed 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipFrameHeader {
    Control {
        version: u16,
        frame_type: u16,
        flags: u8,
        length: u32,
    },
    Data {
        stream_id: u32,
        flags: u8,
        length: u32,
    },
}

impl FlipFrameHeader {
    /// Parse an 8-byte frame header
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let flags = data[4];
        let length = ((data[5] as u32) << 16) | ((data[6] as u32) << 8) | (data[7] as u32);

        if data[0] & CONTROL_BIT != 0 {
            let version = u16::from_be_bytes([data[0] & !CONTROL_BIT, data[1]]);
            let frame_type = u16::from_be_bytes([data[2], data[3]]);
            Some(Self::Control {
                version,
                frame_type,
                flags,
                length,
            })
        } else {
            let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & MAX_STREAM_ID;
            Some(Self::Data {
                stream_id,
                flags,
                length,
            })
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control { .. })
    }

    pub fn flags(&self) -> u8 {
        match self {
            Self::Control { flags, .. } | Self::Data { flags, .. } => *flags,
        }
    }

    /// Payload length (header excluded).
    pub fn length(&self) -> usize {
        match self {
            Self::Control { length, .. } | Self::Data { length, .. } => *length as usize,
        }
    }

    /// Total frame size including header
    pub fn total_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.length()
    }

    /// Check if the FIN flag is set
    pub fn is_fin(&self) -> bool {
        self.flags() & flags::FIN != 0
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let (first, second, flags, length) = match *self {
            Self::Control {
                version,
                frame_type,
                flags,
                length,
            } => {
                let v = (version & 0x7FFF).to_be_bytes();
                let t = frame_type.to_be_bytes();
                ([v[0] | CONTROL_BIT, v[1]], t, flags, length)
            }
            Self::Data {
                stream_id,
                flags,
                length,
            } => {
                let id = (stream_id & MAX_STREAM_ID).to_be_bytes();
                ([id[0], id[1]], [id[2], id[3]], flags, length)
            }
        };
        [
            first[0],
            first[1],
            second[0],
            second[1],
            flags,
            (length >> 16) as u8,
            (length >> 8) as u8,
            length as u8,
        ]
    }
}

/// A complete frame with an opaque payload. The length field is always
/// `payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Control {
        version: u16,
        frame_type: u16,
        flags: u8,
        payload: Bytes,
    },
    Data {
        stream_id: u32,
        flags: u8,
        payload: Bytes,
    },
}

impl RawFrame {
    pub fn header(&self) -> FlipFrameHeader {
        match self {
            Self::Control {
                version,
                frame_type,
                flags,
                payload,
            } => FlipFrameHeader::Control {
                version: *version,
                frame_type: *frame_type,
                flags: *flags,
                length: payload.len() as u32,
            },
            Self::Data {
                stream_id,
                flags,
                payload,
            } => FlipFrameHeader::Data {
                stream_id: *stream_id,
                flags: *flags,
                length: payload.len() as u32,
            },
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Control { payload, .. } | Self::Data { payload, .. } => payload,
        }
    }
}

/// Result of [`decode`] on an accumulating buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A whole frame, and how many bytes of the buffer it occupied.
    Frame { frame: RawFrame, consumed: usize },
    /// The buffer does not yet hold a complete frame.
    NeedMoreData,
}

/// Serialize a raw frame.
pub fn encode(frame: &RawFrame) -> Result<Vec<u8>, FrameError> {
    let payload = frame.payload();
    if payload.len() > MAX_DATA_FRAME_LENGTH {
        return Err(FrameError::FrameTooLarge {
            length: payload.len(),
            max: MAX_DATA_FRAME_LENGTH,
        });
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&frame.header().to_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the front of `buf`.
///
/// Returns [`Decoded::NeedMoreData`] until the header and the full payload
/// are present. Control frames must carry `version`.
pub fn decode(buf: &[u8], version: u16, max_data_length: usize) -> Result<Decoded, FrameError> {
    let Some(header) = check_header(buf, version, max_data_length)? else {
        return Ok(Decoded::NeedMoreData);
    };
    let total = header.total_size();
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }
    let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total]);
    Ok(Decoded::Frame {
        frame: raw_from_parts(header, payload),
        consumed: total,
    })
}

fn check_header(
    buf: &[u8],
    version: u16,
    max_data_length: usize,
) -> Result<Option<FlipFrameHeader>, FrameError> {
    let Some(header) = FlipFrameHeader::parse(buf) else {
        return Ok(None);
    };
    match header {
        FlipFrameHeader::Control {
            version: actual,
            length,
            ..
        } => {
            if actual != version {
                return Err(FrameError::VersionMismatch {
                    expected: version,
                    actual,
                });
            }
            if length as usize > MAX_CONTROL_FRAME_SIZE {
                return Err(FrameError::FrameTooLarge {
                    length: length as usize,
                    max: MAX_CONTROL_FRAME_SIZE,
                });
            }
        }
        FlipFrameHeader::Data { length, .. } => {
            if length as usize > max_data_length {
                return Err(FrameError::FrameTooLarge {
                    length: length as usize,
                    max: max_data_length,
                });
            }
        }
    }
    Ok(Some(header))
}

fn raw_from_parts(header: FlipFrameHeader, payload: Bytes) -> RawFrame {
    match header {
        FlipFrameHeader::Control {
            version,
            frame_type,
            flags,
            ..
        } => RawFrame::Control {
            version,
            frame_type,
            flags,
            payload,
        },
        FlipFrameHeader::Data {
            stream_id, flags, ..
        } => RawFrame::Data {
            stream_id,
            flags,
            payload,
        },
    }
}

/// A decoded frame with its header block decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlipFrame {
    /// Opens a stream. From a server this is a push.
    SynStream {
        stream_id: u32,
        priority: u8,
        fin: bool,
        headers: HeaderBlock,
    },
    /// Response headers for a client-initiated stream.
    SynReply {
        stream_id: u32,
        fin: bool,
        headers: HeaderBlock,
    },
    RstStream {
        stream_id: u32,
        status: u32,
    },
    Data {
        stream_id: u32,
        fin: bool,
        data: Bytes,
    },
}

impl FlipFrame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::SynStream { stream_id, .. }
            | Self::SynReply { stream_id, .. }
            | Self::RstStream { stream_id, .. }
            | Self::Data { stream_id, .. } => *stream_id,
        }
    }

    /// Interpret a raw frame. Control types this codec does not speak
    /// yield `Ok(None)` and leave the compression context untouched.
    pub fn from_raw(
        raw: RawFrame,
        decompressor: &mut HeaderDecompressor,
    ) -> Result<Option<Self>, FrameError> {
        match raw {
            RawFrame::Data {
                stream_id,
                flags: f,
                payload,
            } => Ok(Some(FlipFrame::Data {
                stream_id,
                fin: f & flags::FIN != 0,
                data: payload,
            })),
            RawFrame::Control {
                frame_type,
                flags: f,
                payload,
                ..
            } => {
                let fin = f & flags::FIN != 0;
                match frame_type {
                    control_type::SYN_STREAM => {
                        if payload.len() < 6 {
                            return Err(FrameError::Malformed(
                                "SYN_STREAM frame too short".to_string(),
                            ));
                        }
                        let stream_id = read_stream_id(&payload);
                        let priority = payload[4] >> 6;
                        let headers = decompressor.decompress(&payload[6..])?;
                        Ok(Some(FlipFrame::SynStream {
                            stream_id,
                            priority,
                            fin,
                            headers,
                        }))
                    }
                    control_type::SYN_REPLY => {
                        if payload.len() < 6 {
                            return Err(FrameError::Malformed(
                                "SYN_REPLY frame too short".to_string(),
                            ));
                        }
                        let stream_id = read_stream_id(&payload);
                        let headers = decompressor.decompress(&payload[6..])?;
                        Ok(Some(FlipFrame::SynReply {
                            stream_id,
                            fin,
                            headers,
                        }))
                    }
                    control_type::RST_STREAM => {
                        if payload.len() < 8 {
                            return Err(FrameError::Malformed(
                                "RST_STREAM frame too short".to_string(),
                            ));
                        }
                        let stream_id = read_stream_id(&payload);
                        let status =
                            u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                        Ok(Some(FlipFrame::RstStream { stream_id, status }))
                    }
                    other => {
                        tracing::trace!(frame_type = other, "skipping unsupported control frame");
                        Ok(None)
                    }
                }
            }
        }
    }
}

fn read_stream_id(payload: &[u8]) -> u32 {
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & MAX_STREAM_ID
}

/// Incremental FLIP frame parser and frame builder.
///
/// Holds the partial-read buffer for one connection. The header
/// compression context is passed in by the owner on every call.
#[derive(Debug)]
pub struct FlipFramer {
    /// Buffer for incomplete frames
    buffer: BytesMut,
    version: u16,
    max_data_length: usize,
}

impl Default for FlipFramer {
    fn default() -> Self {
        Self::new(FLIP_VERSION)
    }
}

impl FlipFramer {
    pub fn new(version: u16) -> Self {
        Self {
            buffer: BytesMut::new(),
            version,
            max_data_length: MAX_DATA_FRAME_LENGTH,
        }
    }

    /// Bound inbound DATA frame payloads. Longer frames are malformed.
    pub fn with_max_data_length(mut self, max: usize) -> Self {
        self.max_data_length = max.min(MAX_DATA_FRAME_LENGTH);
        self
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete frame from the buffer, if any.
    ///
    /// Frames of unsupported control types are consumed and skipped. An
    /// error leaves the codec (and the compression context) unusable.
    pub fn next_frame(
        &mut self,
        decompressor: &mut HeaderDecompressor,
    ) -> Result<Option<FlipFrame>, FrameError> {
        loop {
            let Some(header) = check_header(&self.buffer, self.version, self.max_data_length)?
            else {
                return Ok(None);
            };
            let total = header.total_size();
            if self.buffer.len() < total {
                return Ok(None);
            }

            // Split the frame off the buffer; the payload shares its allocation.
            let mut frame_data = self.buffer.split_to(total);
            frame_data.advance(FRAME_HEADER_SIZE);
            let raw = raw_from_parts(header, frame_data.freeze());

            tracing::trace!(?header, "decoded frame");
            if let Some(frame) = FlipFrame::from_raw(raw, decompressor)? {
                return Ok(Some(frame));
            }
        }
    }

    /// Feed raw bytes and return every frame they complete.
    pub fn process(
        &mut self,
        data: &[u8],
        decompressor: &mut HeaderDecompressor,
    ) -> Result<Vec<FlipFrame>, FrameError> {
        self.feed(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame(decompressor)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn control(&self, frame_type: u16, fin: bool, payload: Vec<u8>) -> Result<Vec<u8>, FrameError> {
        encode(&RawFrame::Control {
            version: self.version,
            frame_type,
            flags: if fin { flags::FIN } else { 0 },
            payload: Bytes::from(payload),
        })
    }

    /// Create a SYN_STREAM frame. The header block is compressed before the
    /// length is measured.
    pub fn create_syn_stream(
        &self,
        stream_id: u32,
        priority: u8,
        fin: bool,
        headers: &HeaderBlock,
        compressor: &mut HeaderCompressor,
    ) -> Result<Vec<u8>, FrameError> {
        let block = compressor.compress(headers)?;
        let mut payload = Vec::with_capacity(6 + block.len());
        payload.extend_from_slice(&(stream_id & MAX_STREAM_ID).to_be_bytes());
        // Priority lives in the top two bits; the rest is unused.
        payload.push((priority.min(priority::LOWEST)) << 6);
        payload.push(0);
        payload.extend_from_slice(&block);
        self.control(control_type::SYN_STREAM, fin, payload)
    }

    /// Create a SYN_REPLY frame.
    pub fn create_syn_reply(
        &self,
        stream_id: u32,
        fin: bool,
        headers: &HeaderBlock,
        compressor: &mut HeaderCompressor,
    ) -> Result<Vec<u8>, FrameError> {
        let block = compressor.compress(headers)?;
        let mut payload = Vec::with_capacity(6 + block.len());
        payload.extend_from_slice(&(stream_id & MAX_STREAM_ID).to_be_bytes());
        payload.extend_from_slice(&[0, 0]); // Unused
        payload.extend_from_slice(&block);
        self.control(control_type::SYN_REPLY, fin, payload)
    }

    /// Create a RST_STREAM frame
    pub fn create_rst_stream(&self, stream_id: u32, status: u32) -> Vec<u8> {
        let header = FlipFrameHeader::Control {
            version: self.version,
            frame_type: control_type::RST_STREAM,
            flags: 0,
            length: 8,
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + 8);
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&(stream_id & MAX_STREAM_ID).to_be_bytes());
        frame.extend_from_slice(&status.to_be_bytes());
        frame
    }

    /// Create a DATA frame
    pub fn create_data_frame(
        &self,
        stream_id: u32,
        data: &[u8],
        fin: bool,
    ) -> Result<Vec<u8>, FrameError> {
        encode(&RawFrame::Data {
            stream_id,
            flags: if fin { flags::FIN } else { 0 },
            payload: Bytes::copy_from_slice(data),
        })
    }
}
