// Licensed under the Apache-2.0 license

extern crate alloc;
use crate::codec::MessageBuf;
use alloc::boxed::Box;
use async_trait::async_trait;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum TransportError {
    /// The transport deadline elapsed; surfaced to the caller as-is.
    Timeout,
    DriverError,
    MessageTooLarge,
    BufferTooSmall,
    UnexpectedMessageType,
    NoRequestInFlight,
}

/// Transport binding provided by the embedding (MCTP, PCIe DOE, ...).
///
/// The transport owns its own framing inside the reserved headspace of
/// the `MessageBuf` and its own timeout policy. Messages belonging to a
/// secure session are already sealed by the session layer; the
/// `session_id` parameter only selects the transport's secure path.
#[async_trait]
pub trait SpdmTransport: Send {
    async fn send_request<'a>(
        &mut self,
        session_id: Option<u32>,
        req: &mut MessageBuf<'a>,
    ) -> TransportResult<()>;

    async fn receive_response<'a>(&mut self, rsp: &mut MessageBuf<'a>) -> TransportResult<()>;

    fn max_message_size(&self) -> usize;

    fn header_size(&self) -> usize;
}
