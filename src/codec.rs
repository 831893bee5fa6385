// Licensed under the Apache-2.0 license

use zerocopy::{FromBytes, Immutable, IntoBytes};

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum CodecError {
    BufferTooSmall,
    ReadError,
    WriteError,
    BufferOverflow,
    BufferUnderflow,
}

pub trait Codec {
    fn encode(&self, buffer: &mut MessageBuf) -> CodecResult<usize>;
    fn decode(data: &mut MessageBuf) -> CodecResult<Self>
    where
        Self: Sized;
}

/// Fixed-layout wire structs encode/decode sequentially at the data
/// pointer. Multibyte fields are little-endian by construction of the
/// zerocopy types used.
pub trait CommonCodec: FromBytes + IntoBytes + Immutable {}

impl<T> Codec for T
where
    T: CommonCodec,
{
    fn encode(&self, buffer: &mut MessageBuf) -> CodecResult<usize> {
        let len = core::mem::size_of::<T>();
        buffer.put_data(len)?;
        let out = buffer.data_mut(len)?;
        self.write_to(out).map_err(|_| CodecError::WriteError)?;
        buffer.pull_data(len)?;
        Ok(len)
    }

    fn decode(buffer: &mut MessageBuf) -> CodecResult<T> {
        let len = core::mem::size_of::<T>();
        if buffer.data_len() < len {
            Err(CodecError::BufferTooSmall)?;
        }
        let data = buffer.data(len)?;
        let data = T::read_from_bytes(data).map_err(|_| CodecError::ReadError)?;
        buffer.pull_data(len)?;
        Ok(data)
    }
}

impl CommonCodec for u16 {}
impl CommonCodec for u32 {}

pub fn encode_u8_slice(data: &[u8], buffer: &mut MessageBuf) -> CodecResult<usize> {
    let len = data.len();
    buffer.put_data(len)?;
    buffer.data_mut(len)?.copy_from_slice(data);
    buffer.pull_data(len)?;
    Ok(len)
}

pub fn decode_u8_slice(buffer: &mut MessageBuf, out: &mut [u8]) -> CodecResult<usize> {
    let len = out.len();
    if buffer.data_len() < len {
        Err(CodecError::BufferTooSmall)?;
    }
    out.copy_from_slice(buffer.data(len)?);
    buffer.pull_data(len)?;
    Ok(len)
}

/// Generic message buffer for message encoding and decoding.
///
/// `head` marks reserved space for lower-layer framing, `data` the
/// current encode/decode position and `tail` the end of the message.
/// Decoded payload views borrow directly from the underlying buffer.
#[derive(Debug)]
pub struct MessageBuf<'a> {
    buffer: &'a mut [u8],
    head: usize,
    data: usize,
    tail: usize,
}

impl<'a> MessageBuf<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            head: 0,
            data: 0,
            tail: 0,
        }
    }

    /// Reserve headspace for lower-layer headers at the start of the buffer.
    pub fn reserve(&mut self, header_len: usize) -> CodecResult<()> {
        if self.tail + header_len > self.buffer.len() {
            Err(CodecError::BufferTooSmall)?;
        }
        self.head = header_len;
        self.data = header_len;
        self.tail = header_len;
        Ok(())
    }

    /// Length of the not-yet-consumed payload.
    pub fn data_len(&self) -> usize {
        self.tail - self.data
    }

    /// Extend the message by `len` bytes at the tail.
    pub fn put_data(&mut self, len: usize) -> CodecResult<()> {
        if self.tail + len > self.buffer.len() {
            Err(CodecError::BufferTooSmall)?;
        }
        self.tail += len;
        Ok(())
    }

    /// Advance the data pointer past `len` processed bytes.
    pub fn pull_data(&mut self, len: usize) -> CodecResult<()> {
        if self.data + len > self.tail {
            Err(CodecError::BufferOverflow)?;
        }
        self.data += len;
        Ok(())
    }

    /// Rewind the data pointer by `len` bytes (prepend into headspace).
    pub fn push_data(&mut self, len: usize) -> CodecResult<()> {
        if self.data < len {
            Err(CodecError::BufferUnderflow)?;
        }
        self.data -= len;
        Ok(())
    }

    /// Claim `len` bytes of headspace as part of the message.
    pub fn push_head(&mut self, len: usize) -> CodecResult<()> {
        if self.head < len {
            Err(CodecError::BufferUnderflow)?;
        }
        self.head -= len;
        Ok(())
    }

    /// Resize the message so that `len` unconsumed bytes remain.
    pub fn trim(&mut self, len: usize) -> CodecResult<()> {
        if self.data + len > self.buffer.len() {
            Err(CodecError::BufferUnderflow)?;
        }
        self.tail = self.data + len;
        Ok(())
    }

    pub fn data(&self, len: usize) -> CodecResult<&[u8]> {
        if self.data + len > self.tail {
            Err(CodecError::BufferOverflow)?;
        }
        Ok(&self.buffer[self.data..self.data + len])
    }

    pub fn data_mut(&mut self, len: usize) -> CodecResult<&mut [u8]> {
        if self.data + len > self.tail {
            Err(CodecError::BufferOverflow)?;
        }
        Ok(&mut self.buffer[self.data..self.data + len])
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.fill(0);
        self.head = 0;
        self.data = 0;
        self.tail = 0;
    }

    /// The message bytes excluding reserved headspace.
    pub fn message_data(&self) -> CodecResult<&[u8]> {
        if self.head > self.tail {
            Err(CodecError::BufferUnderflow)?;
        }
        Ok(&self.buffer[self.head..self.tail])
    }

    pub fn data_offset(&self) -> usize {
        self.data
    }

    pub fn msg_len(&self) -> usize {
        self.tail - self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use zerocopy::{FromBytes, Immutable, IntoBytes};

    #[derive(FromBytes, IntoBytes, Immutable, Debug, PartialEq)]
    #[repr(C)]
    struct TestHdr {
        kind: u8,
        flags: u8,
        len: u16,
    }
    impl CommonCodec for TestHdr {}

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buffer = [0u8; 64];
        let mut msg_buf = MessageBuf::new(&mut buffer);

        let hdr = TestHdr {
            kind: 0x83,
            flags: 0x01,
            len: 0x1234,
        };
        assert_eq!(hdr.encode(&mut msg_buf).unwrap(), 4);

        let payload = [0xAAu8, 0xBB, 0xCC];
        assert_eq!(encode_u8_slice(&payload, &mut msg_buf).unwrap(), 3);
        assert_eq!(msg_buf.msg_len(), 7);

        // Little-endian length field on the wire
        assert_eq!(msg_buf.message_data().unwrap()[2..4], [0x34, 0x12]);

        // Decode from a fresh view over the same bytes
        let mut rx = [0u8; 64];
        rx[..7].copy_from_slice(&buffer[..7]);
        let mut rx_buf = MessageBuf::new(&mut rx);
        rx_buf.put_data(7).unwrap();

        let decoded = TestHdr::decode(&mut rx_buf).unwrap();
        assert_eq!(decoded, hdr);
        let mut out = [0u8; 3];
        decode_u8_slice(&mut rx_buf, &mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(rx_buf.data_len(), 0);
    }

    #[test]
    fn test_bounds_checks() {
        let mut buffer = [0u8; 8];
        let mut msg_buf = MessageBuf::new(&mut buffer);

        assert_eq!(msg_buf.put_data(16), Err(CodecError::BufferTooSmall));
        msg_buf.put_data(8).unwrap();
        assert_eq!(msg_buf.data(9), Err(CodecError::BufferOverflow));
        msg_buf.pull_data(8).unwrap();
        assert_eq!(msg_buf.pull_data(1), Err(CodecError::BufferOverflow));
        assert_eq!(TestHdr::decode(&mut msg_buf), Err(CodecError::BufferTooSmall));
    }

    #[test]
    fn test_headspace_framing() {
        let mut rng = rand::thread_rng();
        let mut buffer = [0u8; 64];
        let mut msg_buf = MessageBuf::new(&mut buffer);

        // Transport reserves 2 bytes of framing, message follows
        msg_buf.reserve(2).unwrap();
        let mut body = [0u8; 16];
        rng.fill(&mut body);
        encode_u8_slice(&body, &mut msg_buf).unwrap();
        assert_eq!(msg_buf.msg_len(), 16);
        assert_eq!(msg_buf.message_data().unwrap(), &body);

        // Transport claims its framing bytes
        msg_buf.push_data(2).unwrap();
        msg_buf.data_mut(2).unwrap().copy_from_slice(&[0x05, 0x10]);
        msg_buf.push_head(2).unwrap();
        assert_eq!(msg_buf.msg_len(), 18);
        assert_eq!(&msg_buf.message_data().unwrap()[..2], &[0x05, 0x10]);
    }
}
