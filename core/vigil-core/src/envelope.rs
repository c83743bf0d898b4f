//! Envelope container codec used by the outbox and the envelope cache.
//!
//! An envelope is a JSON header line followed by items, each a JSON item
//! header line and a payload:
//!
//! ```text
//! {"event_id":"9ec79c33ec9942ab8353589fcb2e04dc"}\n
//! {"type":"event","length":41}\n
//! {"platform":"native","timestamp":1.7e9}\n
//! {"type":"attachment","length":3,"filename":"log.txt"}\n
//! abc\n
//! ```
//!
//! # Partial reads
//!
//! Outbox files can be large (attachments, minidumps). Classifying a file
//! only needs a couple of fields from the event item, so payloads are
//! exposed through [`BoundedReader`]: a length-delimited view over the
//! underlying stream that tracks how many bytes remain and skips whatever
//! the consumer did not read when it is dropped. The next item header is
//! therefore always correctly positioned, no matter how little of the
//! previous payload was consumed.

use std::io::{self, BufRead, Cursor, Read, Write};
use std::path::Path;

use fs_err as fs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use vigil_protocol::{EnrichedEvent, EventId};

use crate::error::{Result, VigilError};

pub const EVENT_ITEM_TYPE: &str = "event";
const MAX_HEADER_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemHeader {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bounded sub-reader
// ═══════════════════════════════════════════════════════════════════════════════

/// Length-delimited view over a shared reader.
///
/// Never reads past its limit. On drop, whatever is left of the limit is
/// consumed from the inner reader so the parent stays aligned.
pub struct BoundedReader<'a, R: BufRead> {
    inner: &'a mut R,
    remaining: u64,
}

impl<'a, R: BufRead> BoundedReader<'a, R> {
    pub fn new(inner: &'a mut R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Consumes the rest of the window. Returns how many bytes were skipped.
    pub fn skip_remaining(&mut self) -> io::Result<u64> {
        let mut skipped = 0;
        while self.remaining > 0 {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended with {} bytes left in item", self.remaining),
                ));
            }
            let take = available.len().min(self.remaining as usize);
            self.inner.consume(take);
            self.remaining -= take as u64;
            skipped += take as u64;
        }
        Ok(skipped)
    }
}

impl<R: BufRead> Read for BoundedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining as usize);
        let read = self.inner.read(&mut buf[..max])?;
        self.remaining -= read as u64;
        Ok(read)
    }
}

impl<R: BufRead> BufRead for BoundedReader<'_, R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.remaining == 0 {
            return Ok(&[]);
        }
        let available = self.inner.fill_buf()?;
        let max = available.len().min(self.remaining as usize);
        Ok(&available[..max])
    }

    fn consume(&mut self, amount: usize) {
        let amount = amount.min(self.remaining as usize);
        self.inner.consume(amount);
        self.remaining -= amount as u64;
    }
}

impl<R: BufRead> Drop for BoundedReader<'_, R> {
    fn drop(&mut self) {
        if let Err(err) = self.skip_remaining() {
            tracing::debug!(error = %err, "Failed to skip unread item bytes");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reader
// ═══════════════════════════════════════════════════════════════════════════════

/// Payload of a single item.
///
/// Items declaring a `length` stream through a [`BoundedReader`]; items
/// without one extend to the end of the line and are buffered.
pub enum ItemPayload<'a, R: BufRead> {
    Bounded(BoundedReader<'a, R>),
    Line(Cursor<Vec<u8>>),
}

impl<R: BufRead> Read for ItemPayload<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ItemPayload::Bounded(reader) => reader.read(buf),
            ItemPayload::Line(cursor) => cursor.read(buf),
        }
    }
}

pub struct EnvelopeItem<'a, R: BufRead> {
    pub header: ItemHeader,
    pub payload: ItemPayload<'a, R>,
}

impl<R: BufRead> EnvelopeItem<'_, R> {
    /// Deserializes a value from the payload, reading only as much as the
    /// value's fields require. Unknown fields are skipped, not materialized.
    pub fn read_json<T: DeserializeOwned>(&mut self) -> serde_json::Result<T> {
        let mut deserializer = serde_json::Deserializer::from_reader(&mut self.payload);
        T::deserialize(&mut deserializer)
    }
}

pub struct EnvelopeReader<R: BufRead> {
    reader: R,
    header: EnvelopeHeader,
    // A payload was handed out and its trailing newline is still unread.
    pending_separator: bool,
}

impl<R: BufRead> EnvelopeReader<R> {
    pub fn new(mut reader: R) -> io::Result<Self> {
        let line = read_header_line(&mut reader)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "envelope has no header line")
        })?;
        let header: EnvelopeHeader = serde_json::from_slice(&line)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Self {
            reader,
            header,
            pending_separator: false,
        })
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// Advances to the next item. The previous item must have been dropped.
    pub fn next_item(&mut self) -> io::Result<Option<EnvelopeItem<'_, R>>> {
        if self.pending_separator {
            consume_newline(&mut self.reader)?;
            self.pending_separator = false;
        }

        let line = loop {
            match read_header_line(&mut self.reader)? {
                None => return Ok(None),
                // Tolerate blank lines between items.
                Some(line) if line.iter().all(|b| b.is_ascii_whitespace()) => continue,
                Some(line) => break line,
            }
        };
        let header: ItemHeader = serde_json::from_slice(&line)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let payload = match header.length {
            Some(length) => {
                self.pending_separator = true;
                ItemPayload::Bounded(BoundedReader::new(&mut self.reader, length))
            }
            None => {
                let line = read_header_line(&mut self.reader)?.unwrap_or_default();
                ItemPayload::Line(Cursor::new(line))
            }
        };

        Ok(Some(EnvelopeItem { header, payload }))
    }
}

fn read_header_line<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let read = reader
        .by_ref()
        .take(MAX_HEADER_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut line)?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() > MAX_HEADER_LINE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "envelope header line too long",
        ));
    }
    Ok(Some(line))
}

fn consume_newline<R: BufRead>(reader: &mut R) -> io::Result<()> {
    let available = reader.fill_buf()?;
    if available.first() == Some(&b'\n') {
        reader.consume(1);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Whole-envelope helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Serializes an event as a single-item envelope.
pub fn encode_event_envelope(event: &EnrichedEvent) -> Result<Vec<u8>> {
    let payload =
        serde_json::to_vec(event).map_err(|err| VigilError::json("serializing event", err))?;
    let header = EnvelopeHeader {
        event_id: event.event_id.clone(),
        sent_at: None,
    };
    let item = ItemHeader {
        ty: EVENT_ITEM_TYPE.to_string(),
        length: Some(payload.len() as u64),
        content_type: Some("application/json".to_string()),
        filename: None,
    };

    let mut out = Vec::with_capacity(payload.len() + 128);
    write_json_line(&mut out, &header)?;
    write_json_line(&mut out, &item)?;
    out.write_all(&payload)
        .and_then(|_| out.write_all(b"\n"))
        .map_err(|err| VigilError::io("encoding envelope", err))?;
    Ok(out)
}

fn write_json_line<T: Serialize>(out: &mut Vec<u8>, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)
        .map_err(|err| VigilError::json("encoding envelope header", err))?;
    out.push(b'\n');
    Ok(())
}

/// Fully loads the event item of an envelope file.
pub fn read_event_envelope(path: &Path) -> Result<EnrichedEvent> {
    let file =
        fs::File::open(path).map_err(|err| VigilError::io(format!("opening {}", path.display()), err))?;
    let mut reader = EnvelopeReader::new(io::BufReader::new(file)).map_err(|err| {
        VigilError::EnvelopeMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        }
    })?;

    let envelope_id = reader.header().event_id.clone();
    loop {
        let item = reader
            .next_item()
            .map_err(|err| VigilError::EnvelopeMalformed {
                path: path.to_path_buf(),
                details: err.to_string(),
            })?;
        let mut item = match item {
            Some(item) => item,
            None => return Err(VigilError::EnvelopeWithoutEvent(path.to_path_buf())),
        };
        if item.header.ty != EVENT_ITEM_TYPE {
            continue;
        }
        let mut event: EnrichedEvent = item
            .read_json()
            .map_err(|err| VigilError::json(format!("event in {}", path.display()), err))?;
        if event.event_id.is_none() {
            event.event_id = envelope_id;
        }
        return Ok(event);
    }
}
