//! Tagged binary fields.
//!
//! Every persisted or transmitted structure is a sequence of fields laid out as
//! `tag: u8, len: u32 LE, payload[len]`. Records wrap their fields between a start marker
//! and an end marker; files replace the start marker with an ASCII magic header. The length
//! prefix on every field lets a reader skip tags it does not know, so files written by newer
//! versions still decode.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminates files and IPC messages.
pub const END_MARKER: u8 = 0xFF;

/// Upper bound on a single field payload.
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

const FIELD_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptKind {
    Truncated,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("corrupt data: {reason}")]
pub struct CorruptDataError {
    kind: CorruptKind,
    reason: String,
}

impl CorruptDataError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            kind: CorruptKind::Malformed,
            reason: reason.into(),
        }
    }

    pub fn truncated(reason: impl Into<String>) -> Self {
        Self {
            kind: CorruptKind::Truncated,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> CorruptKind {
        self.kind
    }

    pub fn is_truncation(&self) -> bool {
        self.kind == CorruptKind::Truncated
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

pub type TlvResult<T> = Result<T, CorruptDataError>;

/// 100-nanosecond ticks since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const TICKS_PER_SECOND: i64 = 10_000_000;

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self((after.as_nanos() / 100).min(i64::MAX as u128) as i64),
            Err(err) => Self(-((err.duration().as_nanos() / 100).min(i64::MAX as u128) as i64)),
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        let nanos = |ticks: i64| Duration::from_nanos(ticks.unsigned_abs().saturating_mul(100));
        if self.0 >= 0 {
            UNIX_EPOCH + nanos(self.0)
        } else {
            UNIX_EPOCH - nanos(self.0)
        }
    }

    pub fn ticks(self) -> i64 {
        self.0
    }

    pub fn unix_seconds(self) -> i64 {
        self.0.div_euclid(Self::TICKS_PER_SECOND)
    }
}

/// Accumulates encoded fields in memory.
#[derive(Debug, Default, Clone)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(magic: &[u8]) -> Self {
        Self {
            buf: magic.to_vec(),
        }
    }

    pub fn marker(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    pub fn raw(&mut self, tag: u8, payload: &[u8]) {
        debug_assert!(payload.len() <= MAX_FIELD_LEN);
        self.buf.push(tag);
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
    }

    /// Zero-length field whose presence is the whole message.
    pub fn flag(&mut self, tag: u8) {
        self.raw(tag, &[]);
    }

    pub fn bool(&mut self, tag: u8, value: bool) {
        self.raw(tag, &[u8::from(value)]);
    }

    pub fn i32(&mut self, tag: u8, value: i32) {
        self.raw(tag, &value.to_le_bytes());
    }

    pub fn i64(&mut self, tag: u8, value: i64) {
        self.raw(tag, &value.to_le_bytes());
    }

    pub fn string(&mut self, tag: u8, value: &str) {
        self.raw(tag, value.as_bytes());
    }

    pub fn bytes(&mut self, tag: u8, value: &[u8]) {
        self.raw(tag, value);
    }

    pub fn timestamp(&mut self, tag: u8, value: Timestamp) {
        self.i64(tag, value.ticks());
    }

    pub fn opt_string(&mut self, tag: u8, value: Option<&str>) {
        if let Some(value) = value {
            self.string(tag, value);
        }
    }

    pub fn opt_i32(&mut self, tag: u8, value: Option<i32>) {
        if let Some(value) = value {
            self.i32(tag, value);
        }
    }

    /// Writes only `true`; absent flags decode as `false`.
    pub fn true_flag(&mut self, tag: u8, value: bool) {
        if value {
            self.bool(tag, true);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over encoded fields.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize, what: &str) -> TlvResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CorruptDataError::truncated(format!(
                "{what}: need {len} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn expect_header(&mut self, magic: &[u8]) -> TlvResult<()> {
        let found = self.take(magic.len(), "file header")?;
        if found != magic {
            return Err(CorruptDataError::malformed(format!(
                "expected header {:?}, found {:?}",
                String::from_utf8_lossy(magic),
                String::from_utf8_lossy(found)
            )));
        }
        Ok(())
    }

    pub fn expect_marker(&mut self, marker: u8) -> TlvResult<()> {
        let found = self.read_tag()?;
        if found != marker {
            return Err(CorruptDataError::malformed(format!(
                "expected marker 0x{marker:02X}, found 0x{found:02X}"
            )));
        }
        Ok(())
    }

    pub fn read_tag(&mut self) -> TlvResult<u8> {
        Ok(self.take(1, "tag")?[0])
    }

    /// Reads the length prefix and payload of the field whose tag was just consumed.
    pub fn payload(&mut self) -> TlvResult<&'a [u8]> {
        let len_bytes = self.take(4, "field length")?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        if len > MAX_FIELD_LEN {
            return Err(CorruptDataError::malformed(format!(
                "field length {len} exceeds maximum {MAX_FIELD_LEN}"
            )));
        }
        self.take(len, "field payload")
    }

    pub fn skip_field(&mut self, tag: u8) -> TlvResult<()> {
        let payload = self.payload()?;
        tracing::debug!(
            tag = format_args!("0x{tag:02X}"),
            len = payload.len(),
            "skipping unknown field"
        );
        Ok(())
    }

    pub fn read_flag(&mut self) -> TlvResult<()> {
        let payload = self.payload()?;
        if !payload.is_empty() {
            return Err(CorruptDataError::malformed(format!(
                "marker field carries {} payload bytes",
                payload.len()
            )));
        }
        Ok(())
    }

    pub fn read_bool(&mut self) -> TlvResult<bool> {
        match self.fixed::<1>("bool")? {
            [0] => Ok(false),
            [1] => Ok(true),
            [other] => Err(CorruptDataError::malformed(format!(
                "invalid bool byte 0x{other:02X}"
            ))),
        }
    }

    pub fn read_i32(&mut self) -> TlvResult<i32> {
        Ok(i32::from_le_bytes(self.fixed::<4>("int32")?))
    }

    pub fn read_i64(&mut self) -> TlvResult<i64> {
        Ok(i64::from_le_bytes(self.fixed::<8>("int64")?))
    }

    pub fn read_timestamp(&mut self) -> TlvResult<Timestamp> {
        self.read_i64().map(Timestamp)
    }

    pub fn read_string(&mut self) -> TlvResult<String> {
        let payload = self.payload()?;
        String::from_utf8(payload.to_vec())
            .map_err(|err| CorruptDataError::malformed(format!("invalid UTF-8 string: {err}")))
    }

    /// Legacy string variant: UTF-16LE code units.
    pub fn read_utf16_string(&mut self) -> TlvResult<String> {
        let payload = self.payload()?;
        decode_utf16le(payload)
    }

    pub fn read_bytes(&mut self) -> TlvResult<Vec<u8>> {
        Ok(self.payload()?.to_vec())
    }

    /// Returns a reader over a nested record's payload.
    pub fn read_nested(&mut self) -> TlvResult<FieldReader<'a>> {
        Ok(FieldReader::new(self.payload()?))
    }

    fn fixed<const N: usize>(&mut self, what: &str) -> TlvResult<[u8; N]> {
        let payload = self.payload()?;
        payload.try_into().map_err(|_| {
            CorruptDataError::malformed(format!(
                "{what} field must be {N} bytes, found {}",
                payload.len()
            ))
        })
    }

    pub fn finish(&self) -> TlvResult<()> {
        if !self.is_at_end() {
            return Err(CorruptDataError::malformed(format!(
                "{} trailing bytes after record",
                self.remaining()
            )));
        }
        Ok(())
    }
}

pub fn decode_utf16le(payload: &[u8]) -> TlvResult<String> {
    if payload.len() % 2 != 0 {
        return Err(CorruptDataError::malformed(
            "UTF-16 string has an odd byte count",
        ));
    }
    let units = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect::<Vec<_>>();
    String::from_utf16(&units)
        .map_err(|err| CorruptDataError::malformed(format!("invalid UTF-16 string: {err}")))
}

pub fn encode_utf16le(value: &str) -> Vec<u8> {
    value
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

/// Drives the decode loop of one record: read tag, stop at `end`, otherwise hand the tag to
/// `on_field`. Tags that `on_field` does not claim are skipped.
pub fn read_fields<'a, F>(reader: &mut FieldReader<'a>, end: u8, mut on_field: F) -> TlvResult<()>
where
    F: FnMut(u8, &mut FieldReader<'a>) -> TlvResult<bool>,
{
    loop {
        let tag = reader.read_tag()?;
        if tag == end {
            return Ok(());
        }
        if !on_field(tag, reader)? {
            reader.skip_field(tag)?;
        }
    }
}

/// A record framed by its own start and end markers.
pub trait TlvRecord: Sized {
    const START: u8;
    const END: u8;

    fn write_fields(&self, out: &mut FieldWriter);

    fn read_body(reader: &mut FieldReader<'_>) -> TlvResult<Self>;

    fn encode(&self) -> Vec<u8> {
        let mut out = FieldWriter::new();
        out.marker(Self::START);
        self.write_fields(&mut out);
        out.marker(Self::END);
        out.into_bytes()
    }

    fn decode(bytes: &[u8]) -> TlvResult<Self> {
        let mut reader = FieldReader::new(bytes);
        reader.expect_marker(Self::START)?;
        let record = Self::read_body(&mut reader)?;
        reader.finish()?;
        Ok(record)
    }

    fn write_nested(&self, tag: u8, out: &mut FieldWriter) {
        out.raw(tag, &self.encode());
    }

    fn read_nested(reader: &mut FieldReader<'_>) -> TlvResult<Self> {
        let payload = reader.payload()?;
        Self::decode(payload)
    }
}

pub(crate) fn enum_out_of_range(what: &str, value: i32) -> CorruptDataError {
    CorruptDataError::malformed(format!("{what} value {value} is out of range"))
}
