//! HPACK (RFC 7541) field-block decoding, enough to recover the header
//! fields an observer cares about. Huffman-coded strings are skipped rather
//! than decoded: their byte length is explicit, and the fields that matter
//! for transaction records (`:method`, `:status`, `content-type`) are almost
//! always carried by static-table or dynamic-table indexing.

use std::collections::VecDeque;

use crate::error::ParseError;

/// RFC 7541 Appendix A. Index 1 maps to entry 0.
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Per-entry overhead defined by RFC 7541 section 4.1.
const ENTRY_OVERHEAD: usize = 32;

const DEFAULT_TABLE_SIZE: usize = 4096;

/// One decoded header field. A skipped Huffman string leaves its slot empty.
pub type Field = (String, String);

/// Stateful HPACK decoder for one direction of one connection.
#[derive(Debug)]
pub struct HpackDecoder {
    dynamic: VecDeque<Field>,
    size: usize,
    max_size: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self {
            dynamic: VecDeque::new(),
            size: 0,
            max_size: DEFAULT_TABLE_SIZE,
        }
    }
}

impl HpackDecoder {
    /// Decode one complete field block.
    ///
    /// Errors leave the dynamic table as-is; the caller discards only the
    /// payload that failed, never the connection.
    pub fn decode_block(&mut self, block: &[u8]) -> Result<Vec<Field>, ParseError> {
        let mut fields = Vec::new();
        let mut cur = Cursor { buf: block, pos: 0 };

        while !cur.done() {
            let first = cur.peek()?;
            if first & 0x80 != 0 {
                // Indexed header field.
                let index = cur.integer(7)?;
                fields.push(self.lookup(index)?);
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing.
                let field = self.literal(&mut cur, 6)?;
                self.push_dynamic(field.clone());
                fields.push(field);
            } else if first & 0x20 != 0 {
                // Dynamic table size update.
                let new_size = cur.integer(5)?;
                self.resize(new_size);
            } else {
                // Literal without indexing / never indexed share a layout.
                fields.push(self.literal(&mut cur, 4)?);
            }
        }

        Ok(fields)
    }

    fn lookup(&self, index: usize) -> Result<Field, ParseError> {
        if index == 0 {
            return Err(ParseError::HpackIndex(0));
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_owned(), value.to_owned()));
        }
        self.dynamic
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(ParseError::HpackIndex(index))
    }

    fn literal(&mut self, cur: &mut Cursor<'_>, prefix: u8) -> Result<Field, ParseError> {
        let name_index = cur.integer(prefix)?;
        let name = if name_index == 0 {
            cur.string()?
        } else {
            self.lookup(name_index)?.0
        };
        let value = cur.string()?;
        Ok((name, value))
    }

    fn push_dynamic(&mut self, field: Field) {
        // Skipped Huffman strings under-count here; the table can drift from
        // the sender's but index positions stay aligned, which is what
        // lookups depend on.
        let entry_size = field.0.len() + field.1.len() + ENTRY_OVERHEAD;
        self.dynamic.push_front(field);
        self.size += entry_size;
        self.evict();
    }

    fn resize(&mut self, new_max: usize) {
        self.max_size = new_max.min(DEFAULT_TABLE_SIZE);
        self.evict();
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            match self.dynamic.pop_back() {
                Some((name, value)) => {
                    self.size -= name.len() + value.len() + ENTRY_OVERHEAD;
                }
                None => {
                    self.size = 0;
                    break;
                }
            }
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn peek(&self) -> Result<u8, ParseError> {
        self.buf.get(self.pos).copied().ok_or(ParseError::HpackString)
    }

    fn next(&mut self) -> Result<u8, ParseError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    /// RFC 7541 section 5.1 prefixed integer.
    fn integer(&mut self, prefix: u8) -> Result<usize, ParseError> {
        let mask = (1u16 << prefix) - 1;
        let first = (self.next()? as u16) & mask;
        if first < mask {
            return Ok(first as usize);
        }
        let mut value = mask as usize;
        let mut shift = 0u32;
        loop {
            let b = self.next()?;
            let add = ((b & 0x7f) as usize)
                .checked_shl(shift)
                .ok_or(ParseError::HpackInteger)?;
            value = value.checked_add(add).ok_or(ParseError::HpackInteger)?;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 28 {
                return Err(ParseError::HpackInteger);
            }
        }
    }

    /// RFC 7541 section 5.2 string literal. Huffman payloads are skipped,
    /// yielding an empty string.
    fn string(&mut self) -> Result<String, ParseError> {
        let huffman = self.peek()? & 0x80 != 0;
        let len = self.integer(7)?;
        if self.pos + len > self.buf.len() {
            return Err(ParseError::HpackString);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        if huffman {
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}
