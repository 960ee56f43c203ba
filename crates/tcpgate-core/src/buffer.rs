//! Bounded append-only byte buffer that codecs decode frames from.
//!
//! Replaces the "read one chunk and hope it is the whole frame" pattern:
//! every read from a backend is appended here, and a codec only ever
//! consumes whole frames from the front.

use crate::error::{GateError, GateResult};

/// Append-only byte buffer bounded by a maximum size.
#[derive(Debug)]
pub struct AccumulationBuffer {
    buf: Vec<u8>,
    max_size: usize,
}

impl AccumulationBuffer {
    /// Create an empty buffer that will refuse to hold more than `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_size,
        }
    }

    /// Append received bytes.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Framing`] if the unconsumed contents would exceed
    /// the configured maximum. The buffer is left unchanged in that case.
    pub fn extend(&mut self, data: &[u8]) -> GateResult<()> {
        let total = self.buf.len().saturating_add(data.len());
        if total > self.max_size {
            return Err(GateError::framing(format!(
                "accumulated {total} bytes without a complete frame (max {})",
                self.max_size
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `n` bytes from the front after a frame was extracted.
    ///
    /// # Errors
    ///
    /// A decoder that reports consuming more bytes than were buffered has a
    /// bug; this surfaces as [`GateError::Internal`] instead of a panic.
    pub fn consume(&mut self, n: usize) -> GateResult<()> {
        if n > self.buf.len() {
            return Err(GateError::internal(format!(
                "decoder consumed {n} bytes but only {} were buffered",
                self.buf.len()
            )));
        }
        self.buf.drain(..n);
        Ok(())
    }

    /// Remove and return the first `n` bytes.
    pub fn take(&mut self, n: usize) -> GateResult<Vec<u8>> {
        if n > self.buf.len() {
            return Err(GateError::internal(format!(
                "decoder took {n} bytes but only {} were buffered",
                self.buf.len()
            )));
        }
        Ok(self.buf.drain(..n).collect())
    }

    /// Remove and return everything buffered.
    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
