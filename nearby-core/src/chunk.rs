//! Chunk codec: split a payload into bounded chunks closed by a terminal marker,
//! and reassemble a received chunk stream.
//!
//! Two framings exist on the air and a deployment picks one:
//! - [`Framing::EomMarker`]: the three bytes `EOM` arrive as their own chunk. The encoder
//!   never emits a data chunk equal to the marker, so the marker is unambiguous. Chunk
//!   sizes below the marker length cannot carry it and are rejected.
//! - [`Framing::ZeroLength`]: a zero-length chunk closes the message. Data chunks are never
//!   empty.

use serde::{Deserialize, Serialize};

use crate::protocol::{DEFAULT_CHUNK_SIZE, EOM_MARKER, MAX_PAYLOAD_LEN};

/// How the end of a chunked message is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Sentinel-as-data: a chunk containing exactly `EOM`.
    #[default]
    #[serde(rename = "eom")]
    EomMarker,
    /// Sentinel-as-length: an empty chunk.
    ZeroLength,
}

impl Framing {
    pub fn terminator(self) -> &'static [u8] {
        match self {
            Framing::EomMarker => EOM_MARKER,
            Framing::ZeroLength => &[],
        }
    }

    pub fn is_terminator(self, chunk: &[u8]) -> bool {
        chunk == self.terminator()
    }

    /// Smallest chunk size that can carry both data and the terminator.
    pub fn min_chunk_size(self) -> usize {
        self.terminator().len().max(1)
    }
}

/// Split `payload` into chunks of at most `max_chunk_size` bytes followed by the terminator.
/// A `max_chunk_size` of 0 selects [`DEFAULT_CHUNK_SIZE`].
pub fn encode_chunks(
    payload: &[u8],
    max_chunk_size: usize,
    framing: Framing,
) -> Result<Vec<Vec<u8>>, ChunkError> {
    encode_chunks_with_limit(payload, max_chunk_size, framing, MAX_PAYLOAD_LEN)
}

/// [`encode_chunks`] with a payload cap other than [`MAX_PAYLOAD_LEN`].
pub fn encode_chunks_with_limit(
    payload: &[u8],
    max_chunk_size: usize,
    framing: Framing,
    max_payload_len: usize,
) -> Result<Vec<Vec<u8>>, ChunkError> {
    let size = if max_chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        max_chunk_size
    };
    if size < framing.min_chunk_size() {
        return Err(ChunkError::ChunkSizeTooSmall {
            size,
            min: framing.min_chunk_size(),
        });
    }
    if payload.len() > max_payload_len {
        return Err(ChunkError::PayloadTooLarge {
            max: max_payload_len,
        });
    }
    let mut out = Vec::with_capacity(payload.len() / size + 2);
    let mut start = 0usize;
    while start < payload.len() {
        let mut end = (start + size).min(payload.len());
        // A data chunk must never look like the terminator; shorten it by one byte.
        if framing.is_terminator(&payload[start..end]) {
            end -= 1;
        }
        out.push(payload[start..end].to_vec());
        start = end;
    }
    out.push(framing.terminator().to_vec());
    Ok(out)
}

/// Outcome of feeding one chunk to a [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStep {
    /// Chunk appended; more expected.
    Continue,
    /// Terminal marker seen; the full payload.
    Complete(Vec<u8>),
}

/// Accumulates one inbound transfer. Not reusable: a new transfer needs a new reassembler.
#[derive(Debug)]
pub struct Reassembler {
    framing: Framing,
    max_chunk_size: usize,
    max_payload_len: usize,
    buffer: Vec<u8>,
    chunks: usize,
    complete: bool,
}

impl Reassembler {
    pub fn new(framing: Framing, max_chunk_size: usize) -> Self {
        Self::with_limit(framing, max_chunk_size, MAX_PAYLOAD_LEN)
    }

    pub fn with_limit(framing: Framing, max_chunk_size: usize, max_payload_len: usize) -> Self {
        let max_chunk_size = if max_chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            max_chunk_size
        };
        Self {
            framing,
            max_chunk_size,
            max_payload_len,
            buffer: Vec::new(),
            chunks: 0,
            complete: false,
        }
    }

    /// Feed the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<DecodeStep, ChunkError> {
        if self.complete {
            return Err(ChunkError::AfterComplete);
        }
        if chunk.len() > self.max_chunk_size {
            return Err(ChunkError::ChunkTooLarge {
                len: chunk.len(),
                max: self.max_chunk_size,
            });
        }
        if self.framing.is_terminator(chunk) {
            self.complete = true;
            return Ok(DecodeStep::Complete(std::mem::take(&mut self.buffer)));
        }
        if self.buffer.len() + chunk.len() > self.max_payload_len {
            return Err(ChunkError::PayloadTooLarge {
                max: self.max_payload_len,
            });
        }
        self.buffer.extend_from_slice(chunk);
        self.chunks += 1;
        Ok(DecodeStep::Continue)
    }

    /// Call when the stream ends (disconnect). Errors unless the terminator was seen.
    pub fn finish(&self) -> Result<(), ChunkError> {
        if self.complete {
            Ok(())
        } else {
            Err(ChunkError::Truncated {
                received: self.buffer.len(),
            })
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Data chunks accepted so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn received_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Reassemble a whole chunk stream. Chunks after the terminator are an error.
pub fn decode_chunks<'a, I>(
    chunks: I,
    max_chunk_size: usize,
    framing: Framing,
) -> Result<Vec<u8>, ChunkError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut reassembler = Reassembler::new(framing, max_chunk_size);
    let mut payload = None;
    for chunk in chunks {
        if let DecodeStep::Complete(bytes) = reassembler.push(chunk)? {
            payload = Some(bytes);
        }
    }
    reassembler.finish()?;
    payload.ok_or(ChunkError::Truncated { received: 0 })
}

/// Error framing or reassembling a chunk stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("stream ended after {received} bytes without a terminal marker")]
    Truncated { received: usize },
    #[error("chunk of {len} bytes exceeds the {max} byte chunk size")]
    ChunkTooLarge { len: usize, max: usize },
    #[error("chunk received after the terminal marker")]
    AfterComplete,
    #[error("payload exceeds {max} bytes")]
    PayloadTooLarge { max: usize },
    #[error("chunk size {size} cannot carry the terminator (minimum {min})")]
    ChunkSizeTooSmall { size: usize, min: usize },
}

impl ChunkError {
    /// Truncation is a short stream; everything else is a malformed one.
    pub fn is_truncation(&self) -> bool {
        matches!(self, ChunkError::Truncated { .. })
    }
}
