//! Framing codec for concatenated JSON messages.
//!
//! The stream carries no delimiters or length prefixes: messages are written
//! back to back as independent JSON objects, e.g.
//!
//! ```text
//! {"Type":0,"Data":"request"}{"Type":2,"Data":"hello"}
//! ```
//!
//! A single socket read may contain several messages, or end in the middle
//! of one. [`FrameDecoder`] parses values one at a time, keeps an incomplete
//! trailing value until the rest of it arrives, and gives up on the rest of
//! the buffer when it meets bytes that can never become valid JSON.

use std::io;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::ser::Formatter;

use crate::constants::MAX_PENDING_DECODE_BYTES;
use crate::wire::WireMessage;

/// Encode a message as ASCII JSON bytes.
///
/// Non-ASCII characters are written as `\uXXXX` escapes, so the bytes on the
/// wire are always ASCII and the payload decodes back unchanged.
pub fn encode(message: &WireMessage) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(message.payload().len() + 24);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, AsciiFormatter);
    message.serialize(&mut serializer)?;
    Ok(buf)
}

/// Compact JSON formatter that escapes everything outside ASCII.
///
/// Only string fragments are overridden; the trait defaults already produce
/// the compact layout.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }

        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Result of feeding one chunk of bytes into the decoder.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    /// Messages decoded in stream order.
    pub messages: Vec<WireMessage>,
    /// Set when decoding stopped on malformed input. The bytes after the
    /// failure point in this chunk were discarded.
    pub error: Option<anyhow::Error>,
}

/// Incremental decoder for concatenated JSON messages.
///
/// One decoder belongs to one connection's incoming side.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    max_pending: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default carry-over limit.
    pub fn new() -> Self {
        Self::with_max_pending(MAX_PENDING_DECODE_BYTES)
    }

    /// Create a decoder that keeps at most `max_pending` bytes of an
    /// incomplete message between reads.
    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_pending,
        }
    }

    /// Feed a chunk read from the socket and decode every complete message.
    ///
    /// An incomplete trailing message is kept for the next call. Malformed
    /// input stops decoding: the messages before it are still returned, the
    /// rest of the buffer is dropped and the error is reported in the batch.
    ///
    /// A kept tail that cannot be completed by the new chunk is dropped on
    /// its own, and the chunk is decoded from its first byte.
    pub fn feed(&mut self, bytes: &[u8]) -> DecodedBatch {
        let carried = !self.pending.is_empty();
        self.pending.extend_from_slice(bytes);

        let mut batch = DecodedBatch::default();
        let failed_at_start = self.decode_pending(&mut batch);

        if carried && failed_at_start {
            if let Some(stale) = batch.error.take() {
                self.pending.clear();
                self.pending.extend_from_slice(bytes);
                self.decode_pending(&mut batch);
                let note = "dropped incomplete message from previous read";
                batch.error = Some(match batch.error.take() {
                    Some(e) => e.context(note),
                    None => stale.context(note),
                });
            }
        }

        if self.pending.len() > self.max_pending {
            let dropped = self.pending.len();
            self.pending.clear();
            if batch.error.is_none() {
                batch.error = Some(anyhow!(
                    "incomplete message exceeds {} bytes ({dropped} buffered)",
                    self.max_pending
                ));
            }
        }

        batch
    }

    /// Decode complete messages from the front of `pending` into `batch`.
    ///
    /// Returns true if malformed input was hit before any message decoded.
    fn decode_pending(&mut self, batch: &mut DecodedBatch) -> bool {
        let mut consumed = 0;
        let mut failed_at_start = false;
        let mut stream =
            serde_json::Deserializer::from_slice(&self.pending).into_iter::<WireMessage>();

        loop {
            match stream.next() {
                Some(Ok(message)) => {
                    batch.messages.push(message);
                    consumed = stream.byte_offset();
                }
                // Incomplete value: wait for the rest
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    failed_at_start = consumed == 0;
                    batch.error = Some(e.into());
                    consumed = self.pending.len();
                    break;
                }
                None => {
                    consumed = self.pending.len();
                    break;
                }
            }
        }

        self.pending.drain(..consumed);
        failed_at_start
    }

    /// Returns true if part of a message is buffered.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
