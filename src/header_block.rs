//! FLIP header blocks and their session-scoped compression.
//!
//! A header block is a counted list of length-prefixed name/value pairs.
//! On the wire it is deflated with a zlib context seeded from a fixed
//! dictionary; the context lives as long as the session, so blocks must be
//! compressed in send order and decompressed in receive order.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::FrameError;

/// Largest decompressed header block accepted (256 KB).
pub const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// Separator between the values of a multi-valued header.
pub const VALUE_SEPARATOR: char = '\0';

/// Dictionary both peers preload into their zlib contexts.
pub const FLIP_DICTIONARY: &[u8] = concat!(
    "optionsgetheadpostputdeletetraceacceptaccept-charsetaccept-encodingaccept-",
    "languageauthorizationexpectfromhostif-modified-sinceif-matchif-none-matchi",
    "f-rangeif-unmodifiedsincemax-forwardsproxy-authorizationrangerefererteuser",
    "-agent10010120020120220320420520630030130230330430530630740040140240340440",
    "5406407408409410411412413414415416417500501502503504505accept-rangesageeta",
    "glocationproxy-authenticatepublicretry-afterservervarywarningwww-authentic",
    "ateallowcontent-basecontent-encodingcache-controlconnectiondatetrailertran",
    "sfer-encodingupgradeviawarningcontent-languagecontent-lengthcontent-locati",
    "oncontent-md5content-rangecontent-typeetagexpireslast-modifiedset-cookieMo",
    "ndayTuesdayWednesdayThursdayFridaySaturdaySundayJanFebMarAprMayJunJulAugSe",
    "pOctNovDecchunkedtext/htmlimage/pngimage/jpgimage/gifapplication/xmlapplic",
    "ation/xhtmltext/plainpublicmax-agecharset=iso-8859-1utf-8gzipdeflateHTTP/1",
    ".1statusversionurl\0",
)
.as_bytes();

/// A single name/value pair as carried in a header block.
///
/// `value` may hold several values separated by NUL; see
/// [`FlipHeader::values`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlipHeader {
    pub name: String,
    pub value: String,
}

impl FlipHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The individual values of this header, split on NUL. A
    /// comma-separated value is one value.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.value.split(VALUE_SEPARATOR)
    }
}

/// Ordered header block with unique names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    headers: Vec<FlipHeader>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header. A name that is already present gets the new value
    /// folded onto its existing value with a NUL separator, keeping names
    /// unique.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|h| h.name == name) {
            Some(existing) => {
                existing.value.push(VALUE_SEPARATOR);
                existing.value.push_str(&value);
            }
            None => self.headers.push(FlipHeader { name, value }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }

    /// Case-insensitive lookup, for headers such as `X-Associated-Content`
    /// whose spelling varies between servers.
    pub fn get_ignore_case(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FlipHeader> {
        self.headers.iter()
    }

    /// Header lines with multi-values unfolded, in block order.
    pub fn lines(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .flat_map(|h| h.values().map(move |v| (h.name.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Serialize to the uncompressed wire layout:
    /// `count(u16) { name_len(u16) name value_len(u16) value }*`.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let count = u16::try_from(self.headers.len()).map_err(|_| {
            FrameError::Malformed(format!("too many headers ({})", self.headers.len()))
        })?;
        let mut out = Vec::with_capacity(2 + self.headers.len() * 16);
        out.extend_from_slice(&count.to_be_bytes());
        for header in &self.headers {
            write_string(&mut out, &header.name)?;
            write_string(&mut out, &header.value)?;
        }
        Ok(out)
    }

    /// Parse the uncompressed wire layout. Duplicate or empty names are
    /// rejected, as is trailing data after the last pair.
    ///
    /// A block that ends cleanly on a pair boundary before `count` pairs
    /// were read is accepted with the pairs it has. Early servers send
    /// such blocks.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < 2 {
            return Err(FrameError::Malformed("header block too short".to_string()));
        }
        let count = u16::from_be_bytes([data[0], data[1]]) as usize;
        let mut pos = 2;
        let mut block = HeaderBlock {
            headers: Vec::with_capacity(count),
        };
        for _ in 0..count {
            if pos == data.len() {
                break;
            }
            let name = read_string(data, &mut pos)?;
            let value = read_string(data, &mut pos)?;
            if name.is_empty() {
                return Err(FrameError::Malformed("empty header name".to_string()));
            }
            if block.get(&name).is_some() {
                return Err(FrameError::Malformed(format!("duplicate header '{}'", name)));
            }
            block.headers.push(FlipHeader { name, value });
        }
        if pos != data.len() {
            return Err(FrameError::Malformed(format!(
                "{} trailing bytes after header block",
                data.len() - pos
            )));
        }
        Ok(block)
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderBlock {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut block = HeaderBlock::new();
        for (name, value) in iter {
            block.insert(name, value);
        }
        block
    }
}

impl<'a> IntoIterator for &'a HeaderBlock {
    type Item = &'a FlipHeader;
    type IntoIter = std::slice::Iter<'a, FlipHeader>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.iter()
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<(), FrameError> {
    let len = u16::try_from(s.len())
        .map_err(|_| FrameError::Malformed(format!("header string too long ({} bytes)", s.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_string(data: &[u8], pos: &mut usize) -> Result<String, FrameError> {
    if data.len() < *pos + 2 {
        return Err(FrameError::Malformed("truncated header length".to_string()));
    }
    let len = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
    *pos += 2;
    if data.len() < *pos + len {
        return Err(FrameError::Malformed("truncated header string".to_string()));
    }
    let s = std::str::from_utf8(&data[*pos..*pos + len])
        .map_err(|e| FrameError::Malformed(format!("header string is not UTF-8: {e}")))?;
    *pos += len;
    Ok(s.to_string())
}

/// Outbound half of the session's header compression context.
pub struct HeaderCompressor {
    inner: Option<Compress>,
    dictionary_loaded: bool,
}

impl std::fmt::Debug for HeaderCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderCompressor")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

impl HeaderCompressor {
    /// A compressor that deflates when `enabled`, and passes blocks
    /// through unchanged otherwise.
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: enabled.then(|| Compress::new(Compression::default(), true)),
            dictionary_loaded: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Serialize and compress a header block.
    pub fn compress(&mut self, block: &HeaderBlock) -> Result<Vec<u8>, FrameError> {
        let raw = block.encode()?;
        let Some(deflate) = self.inner.as_mut() else {
            return Ok(raw);
        };

        if !self.dictionary_loaded {
            deflate
                .set_dictionary(FLIP_DICTIONARY)
                .map_err(|e| FrameError::Compression(format!("loading dictionary: {e}")))?;
            self.dictionary_loaded = true;
        }

        let mut out = Vec::with_capacity(raw.len() + 64);
        let mut consumed = 0;
        loop {
            if out.len() == out.capacity() {
                out.reserve(256);
            }
            let before = deflate.total_in();
            deflate
                .compress_vec(&raw[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| FrameError::Compression(e.to_string()))?;
            consumed += (deflate.total_in() - before) as usize;
            // A sync flush is complete once all input is taken and the
            // output buffer was not filled.
            if consumed == raw.len() && out.len() < out.capacity() {
                break;
            }
        }
        Ok(out)
    }
}

/// Inbound half of the session's header compression context.
///
/// A failure leaves the context undefined; the owning session must close.
pub struct HeaderDecompressor {
    inner: Option<Decompress>,
}

impl std::fmt::Debug for HeaderDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderDecompressor")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

impl HeaderDecompressor {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: enabled.then(|| Decompress::new(true)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Decompress and parse one header block.
    pub fn decompress(&mut self, data: &[u8]) -> Result<HeaderBlock, FrameError> {
        let raw = match self.inner.as_mut() {
            Some(inflate) => inflate_block(inflate, data)?,
            None => data.to_vec(),
        };
        if raw.len() > MAX_HEADER_BLOCK_SIZE {
            return Err(FrameError::FrameTooLarge {
                length: raw.len(),
                max: MAX_HEADER_BLOCK_SIZE,
            });
        }
        HeaderBlock::parse(&raw)
    }
}

fn inflate_block(inflate: &mut Decompress, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).max(64));
    let mut consumed = 0;
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }
        let in_before = inflate.total_in();
        let out_before = inflate.total_out();
        let result = inflate.decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync);
        consumed += (inflate.total_in() - in_before) as usize;
        let progressed = inflate.total_in() != in_before || inflate.total_out() != out_before;

        match result {
            Ok(Status::StreamEnd) => {
                return Err(FrameError::Compression(
                    "peer ended the header compression stream".to_string(),
                ));
            }
            Ok(_) => {
                if consumed == data.len() && out.len() < out.capacity() {
                    break;
                }
                if !progressed {
                    return Err(FrameError::Compression("inflate stalled".to_string()));
                }
            }
            Err(e) if e.needs_dictionary().is_some() => {
                inflate
                    .set_dictionary(FLIP_DICTIONARY)
                    .map_err(|e| FrameError::Compression(format!("loading dictionary: {e}")))?;
            }
            Err(e) => return Err(FrameError::Compression(e.to_string())),
        }

        if out.len() > MAX_HEADER_BLOCK_SIZE {
            return Err(FrameError::FrameTooLarge {
                length: out.len(),
                max: MAX_HEADER_BLOCK_SIZE,
            });
        }
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
