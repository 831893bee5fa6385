// Licensed under the Apache-2.0 license

use crate::codec::CommonCodec;
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::version::SpdmVersion;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const NONCE_LEN: usize = 32;

// This is the `combined_spdm_prefix` length for signing context
pub const SPDM_SIGNING_CONTEXT_LEN: usize = SPDM_PREFIX_LEN + SPDM_CONTEXT_LEN;

const SPDM_PREFIX_LEN: usize = 64;
const SPDM_CONTEXT_LEN: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ReqRespCode {
    GetVersion = 0x84,
    Version = 0x04,
    GetCapabilities = 0xE1,
    Capabilities = 0x61,
    NegotiateAlgorithms = 0xE3,
    Algorithms = 0x63,
    GetDigests = 0x81,
    Digests = 0x01,
    GetCertificate = 0x82,
    Certificate = 0x02,
    Challenge = 0x83,
    ChallengeAuth = 0x03,
    KeyExchange = 0xE4,
    KeyExchangeRsp = 0x64,
    Finish = 0xE5,
    FinishRsp = 0x65,
    PskExchange = 0xE6,
    PskExchangeRsp = 0x66,
    PskFinish = 0xE7,
    PskFinishRsp = 0x67,
    Heartbeat = 0xE8,
    HeartbeatAck = 0x68,
    KeyUpdate = 0xE9,
    KeyUpdateAck = 0x69,
    GetEncapsulatedRequest = 0xEA,
    EncapsulatedRequest = 0x6A,
    DeliverEncapsulatedResponse = 0xEB,
    EncapsulatedResponseAck = 0x6B,
    EndSession = 0xEC,
    EndSessionAck = 0x6C,
    RespondIfReady = 0xFF,
    Error = 0x7F,
}

impl TryFrom<u8> for ReqRespCode {
    type Error = SpdmError;
    fn try_from(value: u8) -> Result<Self, SpdmError> {
        match value {
            0x84 => Ok(ReqRespCode::GetVersion),
            0x04 => Ok(ReqRespCode::Version),
            0xE1 => Ok(ReqRespCode::GetCapabilities),
            0x61 => Ok(ReqRespCode::Capabilities),
            0xE3 => Ok(ReqRespCode::NegotiateAlgorithms),
            0x63 => Ok(ReqRespCode::Algorithms),
            0x81 => Ok(ReqRespCode::GetDigests),
            0x01 => Ok(ReqRespCode::Digests),
            0x82 => Ok(ReqRespCode::GetCertificate),
            0x02 => Ok(ReqRespCode::Certificate),
            0x83 => Ok(ReqRespCode::Challenge),
            0x03 => Ok(ReqRespCode::ChallengeAuth),
            0xE4 => Ok(ReqRespCode::KeyExchange),
            0x64 => Ok(ReqRespCode::KeyExchangeRsp),
            0xE5 => Ok(ReqRespCode::Finish),
            0x65 => Ok(ReqRespCode::FinishRsp),
            0xE6 => Ok(ReqRespCode::PskExchange),
            0x66 => Ok(ReqRespCode::PskExchangeRsp),
            0xE7 => Ok(ReqRespCode::PskFinish),
            0x67 => Ok(ReqRespCode::PskFinishRsp),
            0xE8 => Ok(ReqRespCode::Heartbeat),
            0x68 => Ok(ReqRespCode::HeartbeatAck),
            0xE9 => Ok(ReqRespCode::KeyUpdate),
            0x69 => Ok(ReqRespCode::KeyUpdateAck),
            0xEA => Ok(ReqRespCode::GetEncapsulatedRequest),
            0x6A => Ok(ReqRespCode::EncapsulatedRequest),
            0xEB => Ok(ReqRespCode::DeliverEncapsulatedResponse),
            0x6B => Ok(ReqRespCode::EncapsulatedResponseAck),
            0xEC => Ok(ReqRespCode::EndSession),
            0x6C => Ok(ReqRespCode::EndSessionAck),
            0xFF => Ok(ReqRespCode::RespondIfReady),
            0x7F => Ok(ReqRespCode::Error),
            _ => Err(SpdmError::DeviceError),
        }
    }
}

impl From<ReqRespCode> for u8 {
    fn from(code: ReqRespCode) -> Self {
        code as u8
    }
}

impl ReqRespCode {
    /// Response code expected for a request code.
    pub(crate) fn response_code(&self) -> SpdmResult<ReqRespCode> {
        match self {
            ReqRespCode::GetVersion => Ok(ReqRespCode::Version),
            ReqRespCode::GetCapabilities => Ok(ReqRespCode::Capabilities),
            ReqRespCode::NegotiateAlgorithms => Ok(ReqRespCode::Algorithms),
            ReqRespCode::GetDigests => Ok(ReqRespCode::Digests),
            ReqRespCode::GetCertificate => Ok(ReqRespCode::Certificate),
            ReqRespCode::Challenge => Ok(ReqRespCode::ChallengeAuth),
            ReqRespCode::KeyExchange => Ok(ReqRespCode::KeyExchangeRsp),
            ReqRespCode::Finish => Ok(ReqRespCode::FinishRsp),
            ReqRespCode::PskExchange => Ok(ReqRespCode::PskExchangeRsp),
            ReqRespCode::PskFinish => Ok(ReqRespCode::PskFinishRsp),
            ReqRespCode::Heartbeat => Ok(ReqRespCode::HeartbeatAck),
            ReqRespCode::KeyUpdate => Ok(ReqRespCode::KeyUpdateAck),
            ReqRespCode::GetEncapsulatedRequest => Ok(ReqRespCode::EncapsulatedRequest),
            ReqRespCode::DeliverEncapsulatedResponse => Ok(ReqRespCode::EncapsulatedResponseAck),
            ReqRespCode::EndSession => Ok(ReqRespCode::EndSessionAck),
            _ => Err(SpdmError::DeviceError),
        }
    }

    fn spdm_context_string(&self, is_requester: bool) -> SpdmResult<[u8; SPDM_CONTEXT_LEN]> {
        let mut context = [0u8; SPDM_CONTEXT_LEN];
        let ctx_str: &str = match (self, is_requester) {
            (ReqRespCode::ChallengeAuth, false) => "responder-challenge_auth signing",
            (ReqRespCode::ChallengeAuth, true) => "requester-challenge_auth signing",
            (ReqRespCode::KeyExchangeRsp, false) => "responder-key_exchange_rsp signing",
            (ReqRespCode::Finish, true) => "requester-finish signing",
            _ => Err(SpdmError::Unsupported)?,
        };
        if ctx_str.len() > SPDM_CONTEXT_LEN {
            Err(SpdmError::InvalidParam)?;
        }
        let zero_pad_size = SPDM_CONTEXT_LEN - ctx_str.len();
        context[zero_pad_size..].copy_from_slice(ctx_str.as_bytes());
        Ok(context)
    }
}

/// Fixed 4-byte message header carried by every SPDM message.
#[derive(FromBytes, IntoBytes, Immutable, Clone, Copy)]
#[repr(C)]
pub(crate) struct SpdmMsgHdr {
    version: u8,
    req_resp_code: u8,
    param1: u8,
    param2: u8,
}

impl SpdmMsgHdr {
    pub(crate) fn new(
        version: SpdmVersion,
        req_resp_code: ReqRespCode,
        param1: u8,
        param2: u8,
    ) -> Self {
        Self {
            version: version.into(),
            req_resp_code: req_resp_code.into(),
            param1,
            param2,
        }
    }

    pub(crate) fn version(&self) -> SpdmResult<SpdmVersion> {
        self.version.try_into()
    }

    pub(crate) fn req_resp_code(&self) -> SpdmResult<ReqRespCode> {
        self.req_resp_code.try_into()
    }

    pub(crate) fn param1(&self) -> u8 {
        self.param1
    }

    pub(crate) fn param2(&self) -> u8 {
        self.param2
    }
}

impl CommonCodec for SpdmMsgHdr {}

/// Combined prefix + context string prepended to transcript hashes
/// before signing/verification on SPDM 1.2+.
pub(crate) fn spdm_signing_context(
    spdm_version: SpdmVersion,
    opcode: ReqRespCode,
    is_requester: bool,
) -> SpdmResult<[u8; SPDM_SIGNING_CONTEXT_LEN]> {
    if spdm_version < SpdmVersion::V12 {
        Err(SpdmError::Unsupported)?;
    }

    let mut combined_spdm_prefix = [0u8; SPDM_SIGNING_CONTEXT_LEN];

    let base_str = b"dmtf-spdm-v";
    let version_str = spdm_version.to_str().as_bytes();
    let mut spdm_prefix = [0u8; SPDM_PREFIX_LEN];

    let mut pos = 0;
    for _ in 0..4 {
        spdm_prefix[pos..pos + base_str.len()].copy_from_slice(base_str);
        pos += base_str.len();
        spdm_prefix[pos..pos + version_str.len()].copy_from_slice(version_str);
        pos += version_str.len();
        if pos % 16 != 0 {
            Err(SpdmError::InvalidParam)?;
        }
    }

    let spdm_context = opcode.spdm_context_string(is_requester)?;
    combined_spdm_prefix[..SPDM_PREFIX_LEN].copy_from_slice(&spdm_prefix);
    combined_spdm_prefix[SPDM_PREFIX_LEN..].copy_from_slice(&spdm_context);

    Ok(combined_spdm_prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, MessageBuf};

    #[test]
    fn test_header_wire_layout() {
        let mut buffer = [0u8; 8];
        let mut buf = MessageBuf::new(&mut buffer);
        let hdr = SpdmMsgHdr::new(SpdmVersion::V12, ReqRespCode::Challenge, 0x01, 0xFF);
        assert_eq!(hdr.encode(&mut buf).unwrap(), 4);
        assert_eq!(buf.message_data().unwrap(), &[0x12, 0x83, 0x01, 0xFF]);
    }

    #[test]
    fn test_response_code_mapping() {
        assert_eq!(
            ReqRespCode::KeyUpdate.response_code().unwrap(),
            ReqRespCode::KeyUpdateAck
        );
        assert!(ReqRespCode::Version.response_code().is_err());
    }

    #[test]
    fn test_signing_context() {
        let ctx =
            spdm_signing_context(SpdmVersion::V12, ReqRespCode::ChallengeAuth, false).unwrap();
        assert_eq!(&ctx[..11], b"dmtf-spdm-v");
        assert!(ctx[SPDM_PREFIX_LEN..].ends_with(b"responder-challenge_auth signing"));
        assert!(spdm_signing_context(SpdmVersion::V11, ReqRespCode::ChallengeAuth, false).is_err());
    }
}
