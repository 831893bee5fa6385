// Licensed under the Apache-2.0 license

use crate::crypto::{CryptoError, DigestBuf, SpdmCryptoProvider};
use crate::protocol::algorithms::BaseHashAlgoType;
use arrayvec::ArrayVec;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum TranscriptError {
    BufferFull,
    InvalidRollbackMark,
    Crypto(CryptoError),
}

pub type TranscriptResult<T> = Result<T, TranscriptError>;

// Buffer size constants
const A_BUFFER_SIZE: usize = 512;
const B_BUFFER_SIZE: usize = 8192;
const C_BUFFER_SIZE: usize = 2048;
const M1M2_BUFFER_SIZE: usize = 8192;

/// Append-only byte log with checkpoint/rollback.
///
/// Every tentative append happens under a checkpoint taken at the
/// start of the exchange; a failing exchange rolls back to the mark,
/// so a retry reproduces an identical transcript.
#[derive(Default)]
pub(crate) struct TranscriptBuf<const N: usize> {
    buf: ArrayVec<u8, N>,
}

impl<const N: usize> TranscriptBuf<N> {
    pub fn new() -> Self {
        Self {
            buf: ArrayVec::new(),
        }
    }

    pub fn append(&mut self, data: &[u8]) -> TranscriptResult<()> {
        self.buf
            .try_extend_from_slice(data)
            .map_err(|_| TranscriptError::BufferFull)
    }

    pub fn checkpoint(&self) -> usize {
        self.buf.len()
    }

    pub fn rollback_to(&mut self, mark: usize) -> TranscriptResult<()> {
        if mark > self.buf.len() {
            Err(TranscriptError::InvalidRollbackMark)?;
        }
        self.buf.truncate(mark);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TranscriptContext {
    /// Version, capabilities and algorithms request/response pairs.
    A,
    /// Digests and certificate exchanges.
    B,
    /// Challenge/auth, signed.
    C,
    /// Mutual-auth encapsulated exchanges.
    M1M2,
}

/// Transcript management for the SPDM requester.
///
/// The per-session K transcript lives in `SessionInfo`; the connection
/// level buffers live here.
pub(crate) struct Transcript {
    a_buf: TranscriptBuf<A_BUFFER_SIZE>,
    b_buf: TranscriptBuf<B_BUFFER_SIZE>,
    c_buf: TranscriptBuf<C_BUFFER_SIZE>,
    m1m2_buf: TranscriptBuf<M1M2_BUFFER_SIZE>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            a_buf: TranscriptBuf::new(),
            b_buf: TranscriptBuf::new(),
            c_buf: TranscriptBuf::new(),
            m1m2_buf: TranscriptBuf::new(),
        }
    }

    fn buf(&self, context: TranscriptContext) -> &dyn TranscriptLog {
        match context {
            TranscriptContext::A => &self.a_buf,
            TranscriptContext::B => &self.b_buf,
            TranscriptContext::C => &self.c_buf,
            TranscriptContext::M1M2 => &self.m1m2_buf,
        }
    }

    fn buf_mut(&mut self, context: TranscriptContext) -> &mut dyn TranscriptLog {
        match context {
            TranscriptContext::A => &mut self.a_buf,
            TranscriptContext::B => &mut self.b_buf,
            TranscriptContext::C => &mut self.c_buf,
            TranscriptContext::M1M2 => &mut self.m1m2_buf,
        }
    }

    pub fn append(&mut self, context: TranscriptContext, data: &[u8]) -> TranscriptResult<()> {
        self.buf_mut(context).append_bytes(data)
    }

    pub fn reset(&mut self, context: TranscriptContext) {
        self.buf_mut(context).clear_bytes();
    }

    pub fn reset_all(&mut self) {
        self.a_buf.clear();
        self.b_buf.clear();
        self.c_buf.clear();
        self.m1m2_buf.clear();
    }

    pub fn checkpoint(&self, context: TranscriptContext) -> usize {
        self.buf(context).mark()
    }

    pub fn rollback_to(&mut self, context: TranscriptContext, mark: usize) -> TranscriptResult<()> {
        self.buf_mut(context).rollback_bytes(mark)
    }

    pub fn as_slice(&self, context: TranscriptContext) -> &[u8] {
        self.buf(context).bytes()
    }

    /// Hash of the buffer contents under the negotiated hash algorithm.
    pub async fn hash(
        &self,
        context: TranscriptContext,
        crypto: &dyn SpdmCryptoProvider,
        algo: BaseHashAlgoType,
    ) -> TranscriptResult<DigestBuf> {
        crypto
            .hash(algo, self.as_slice(context))
            .await
            .map_err(TranscriptError::Crypto)
    }
}

// Object-safe view over differently sized transcript buffers.
trait TranscriptLog {
    fn append_bytes(&mut self, data: &[u8]) -> TranscriptResult<()>;
    fn clear_bytes(&mut self);
    fn mark(&self) -> usize;
    fn rollback_bytes(&mut self, mark: usize) -> TranscriptResult<()>;
    fn bytes(&self) -> &[u8];
}

impl<const N: usize> TranscriptLog for TranscriptBuf<N> {
    fn append_bytes(&mut self, data: &[u8]) -> TranscriptResult<()> {
        self.append(data)
    }

    fn clear_bytes(&mut self) {
        self.clear()
    }

    fn mark(&self) -> usize {
        self.checkpoint()
    }

    fn rollback_bytes(&mut self, mark: usize) -> TranscriptResult<()> {
        self.rollback_to(mark)
    }

    fn bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_rollback() {
        let mut transcript = Transcript::new();
        transcript
            .append(TranscriptContext::A, &[1, 2, 3])
            .unwrap();

        let mark = transcript.checkpoint(TranscriptContext::A);
        transcript
            .append(TranscriptContext::A, &[4, 5, 6])
            .unwrap();
        assert_eq!(transcript.as_slice(TranscriptContext::A), &[1, 2, 3, 4, 5, 6]);

        transcript
            .rollback_to(TranscriptContext::A, mark)
            .unwrap();
        assert_eq!(transcript.as_slice(TranscriptContext::A), &[1, 2, 3]);

        // Retrying the appends reproduces the identical transcript
        transcript
            .append(TranscriptContext::A, &[4, 5, 6])
            .unwrap();
        assert_eq!(transcript.as_slice(TranscriptContext::A), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_contexts_are_independent() {
        let mut transcript = Transcript::new();
        transcript.append(TranscriptContext::A, &[1]).unwrap();
        transcript.append(TranscriptContext::C, &[2]).unwrap();
        transcript.reset(TranscriptContext::C);
        assert_eq!(transcript.as_slice(TranscriptContext::A), &[1]);
        assert!(transcript.as_slice(TranscriptContext::C).is_empty());
    }

    #[test]
    fn test_overflow_is_buffer_full() {
        let mut buf = TranscriptBuf::<4>::new();
        assert!(buf.append(&[0; 4]).is_ok());
        assert_eq!(buf.append(&[0]), Err(TranscriptError::BufferFull));
        assert!(buf.rollback_to(8).is_err());
    }
}
