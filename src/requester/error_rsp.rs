// Licensed under the Apache-2.0 license

//! ERROR response handling: retry/backoff classification and
//! `ResponseNotReady` polling via RESPOND_IF_READY.

use crate::codec::{Codec, CommonCodec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

// Upper bound on a single ResponseNotReady backoff sleep
const RNR_MAX_WAIT_MS: u64 = 1000;

// SPDM error codes
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ErrorCode {
    InvalidRequest = 0x01,
    InvalidSession = 0x02,
    Busy = 0x03,
    UnexpectedRequest = 0x04,
    Unspecified = 0x05,
    DecryptError = 0x06,
    UnsupportedRequest = 0x07,
    RequestInFlight = 0x08,
    InvalidResponseCode = 0x09,
    SessionLimitExceeded = 0x0A,
    SessionRequired = 0x0B,
    ResetRequired = 0x0C,
    ResponseTooLarge = 0x0D,
    RequestTooLarge = 0x0E,
    LargeResponse = 0x0F,
    MessageLost = 0x10,
    VersionMismatch = 0x41,
    ResponseNotReady = 0x42,
    RequestResynch = 0x43,
    VendorDefined = 0xFF,
}

impl TryFrom<u8> for ErrorCode {
    type Error = SpdmError;
    fn try_from(value: u8) -> Result<Self, SpdmError> {
        match value {
            0x01 => Ok(ErrorCode::InvalidRequest),
            0x02 => Ok(ErrorCode::InvalidSession),
            0x03 => Ok(ErrorCode::Busy),
            0x04 => Ok(ErrorCode::UnexpectedRequest),
            0x05 => Ok(ErrorCode::Unspecified),
            0x06 => Ok(ErrorCode::DecryptError),
            0x07 => Ok(ErrorCode::UnsupportedRequest),
            0x08 => Ok(ErrorCode::RequestInFlight),
            0x09 => Ok(ErrorCode::InvalidResponseCode),
            0x0A => Ok(ErrorCode::SessionLimitExceeded),
            0x0B => Ok(ErrorCode::SessionRequired),
            0x0C => Ok(ErrorCode::ResetRequired),
            0x0D => Ok(ErrorCode::ResponseTooLarge),
            0x0E => Ok(ErrorCode::RequestTooLarge),
            0x0F => Ok(ErrorCode::LargeResponse),
            0x10 => Ok(ErrorCode::MessageLost),
            0x41 => Ok(ErrorCode::VersionMismatch),
            0x42 => Ok(ErrorCode::ResponseNotReady),
            0x43 => Ok(ErrorCode::RequestResynch),
            0xFF => Ok(ErrorCode::VendorDefined),
            _ => Err(SpdmError::DeviceError),
        }
    }
}

/// Extended data carried by `ERROR{ResponseNotReady}`.
#[derive(FromBytes, IntoBytes, Immutable, Clone, Copy)]
#[repr(C)]
pub(crate) struct ResponseNotReadyExt {
    rdt_exponent: u8,
    request_code: u8,
    token: u8,
    rdtm: u8,
}

impl CommonCodec for ResponseNotReadyExt {}

impl<'a> RequesterContext<'a> {
    /// Interpret an ERROR frame received in place of a response.
    ///
    /// `ResponseNotReady` is polled here (bounded by `max_rnr_polls`)
    /// and, on success, the refreshed response header is returned with
    /// `rsp` positioned after it. GET_VERSION and session-handshake
    /// requests are never deferred this way. Everything else maps to a
    /// classified error per the retry policy: only `Busy` feeds the
    /// outer retry loop.
    pub(crate) async fn handle_error_response(
        &mut self,
        session_id: Option<u32>,
        request_code: ReqRespCode,
        error_hdr: SpdmMsgHdr,
        rsp: &mut MessageBuf<'_>,
    ) -> SpdmResult<SpdmMsgHdr> {
        let mut hdr = error_hdr;
        let mut polls = 0u8;

        loop {
            let error_code = ErrorCode::try_from(hdr.param1())?;
            match error_code {
                ErrorCode::Busy => {
                    debug!("responder busy, requesting retry");
                    Err(SpdmError::NoResponse)?
                }
                ErrorCode::RequestResynch => {
                    warn!("responder requested resynchronization");
                    self.state.reset();
                    self.transcript.reset_all();
                    Err(SpdmError::Unsupported)?
                }
                ErrorCode::DecryptError
                | ErrorCode::InvalidSession
                | ErrorCode::SessionRequired
                | ErrorCode::SessionLimitExceeded => Err(SpdmError::SecurityViolation)?,
                ErrorCode::ResponseNotReady => {
                    // GET_VERSION and the session-handshake requests may
                    // not be deferred by the responder
                    if matches!(
                        request_code,
                        ReqRespCode::GetVersion
                            | ReqRespCode::KeyExchange
                            | ReqRespCode::Finish
                            | ReqRespCode::PskExchange
                            | ReqRespCode::PskFinish
                    ) {
                        warn!(
                            "ResponseNotReady rejected for request code {:#04x}",
                            u8::from(request_code)
                        );
                        Err(SpdmError::DeviceError)?
                    }
                    if polls >= self.max_rnr_polls {
                        warn!("ResponseNotReady poll budget exhausted");
                        Err(SpdmError::DeviceError)?
                    }
                    polls += 1;
                    hdr = self
                        .respond_if_ready(session_id, request_code, rsp)
                        .await?;
                    if hdr.req_resp_code().ok() != Some(ReqRespCode::Error) {
                        return Ok(hdr);
                    }
                }
                _ => Err(SpdmError::DeviceError)?,
            }
        }
    }

    // Sleep for the advertised interval, then poll with
    // RESPOND_IF_READY carrying the responder's token.
    async fn respond_if_ready(
        &mut self,
        session_id: Option<u32>,
        request_code: ReqRespCode,
        rsp: &mut MessageBuf<'_>,
    ) -> SpdmResult<SpdmMsgHdr> {
        let ext = ResponseNotReadyExt::decode(rsp).map_err(|_| SpdmError::DeviceError)?;
        if ext.request_code != u8::from(request_code) {
            Err(SpdmError::DeviceError)?;
        }

        // RDT is 2^exponent microseconds, scaled by the RDTM multiplier
        let exponent = (ext.rdt_exponent as u64).min(30);
        let wait_us = (1u64 << exponent).saturating_mul(ext.rdtm.max(1) as u64);
        let wait_ms = (wait_us / 1000).clamp(1, RNR_MAX_WAIT_MS);
        debug!(
            "ResponseNotReady: sleeping {} ms before RESPOND_IF_READY (token {})",
            wait_ms, ext.token
        );
        self.timer.sleep_ms(wait_ms).await;

        let connection_version = self.connection_version();
        let mut req_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut req_buf = MessageBuf::new(&mut req_storage);
        self.prepare_request_buffer(&mut req_buf)?;
        SpdmMsgHdr::new(
            connection_version,
            ReqRespCode::RespondIfReady,
            ext.request_code,
            ext.token,
        )
        .encode(&mut req_buf)
        .map_err(|_| SpdmError::DeviceError)?;

        self.send_message(session_id, &mut req_buf).await?;
        self.receive_message(session_id, rsp).await?;

        let hdr = SpdmMsgHdr::decode(rsp).map_err(|_| SpdmError::DeviceError)?;
        if hdr.version().ok() != Some(connection_version) {
            Err(SpdmError::DeviceError)?;
        }
        Ok(hdr)
    }
}
