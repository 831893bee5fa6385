// Licensed under the Apache-2.0 license

use crate::codec::{Codec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::state::ConnectionState;
use crate::transcript::TranscriptContext;
use core::mem::size_of;
use log::debug;

impl<'a> RequesterContext<'a> {
    /// Retrieve the digests of the responder's certificate chains.
    /// Returns the slot mask of populated slots.
    pub async fn get_digests(&mut self) -> SpdmResult<u8> {
        let mut attempts = 0u8;
        loop {
            match self.try_get_digests().await {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_get_digests(&mut self) -> SpdmResult<u8> {
        if self.peer_capabilities().cert_cap() == 0 {
            Err(SpdmError::Unsupported)?;
        }
        if self.connection_state() < ConnectionState::Negotiated {
            Err(SpdmError::Unsupported)?;
        }
        self.reset_transcript_via_request_code(ReqRespCode::GetDigests);

        let connection_version = self.connection_version();
        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;
        SpdmMsgHdr::new(connection_version, ReqRespCode::GetDigests, 0, 0)
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;

        let mark = self.transcript.checkpoint(TranscriptContext::B);
        let result = self.exchange_digests(&mut msg_buf).await;
        if result.is_err() {
            let _ = self.transcript.rollback_to(TranscriptContext::B, mark);
        }
        result
    }

    async fn exchange_digests(&mut self, msg_buf: &mut MessageBuf<'_>) -> SpdmResult<u8> {
        let connection_version = self.connection_version();
        let req_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        self.transcript
            .append(TranscriptContext::B, req_bytes)
            .map_err(|_| SpdmError::SecurityViolation)?;

        self.send_message(None, msg_buf).await?;
        let rsp_hdr = self
            .receive_and_validate(None, msg_buf, connection_version, ReqRespCode::GetDigests)
            .await?;

        let slot_mask = rsp_hdr.param2();
        if slot_mask == 0 {
            Err(SpdmError::DeviceError)?;
        }
        let hash_size = self
            .state
            .connection_info
            .peer_algorithms()
            .base_hash_algo_type()?
            .hash_size();
        let digest_count = slot_mask.count_ones() as usize;
        if msg_buf.data_len() < digest_count * hash_size {
            Err(SpdmError::DeviceError)?;
        }

        let rsp_len = size_of::<SpdmMsgHdr>() + digest_count * hash_size;
        let rsp_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        self.transcript
            .append(TranscriptContext::B, &rsp_bytes[..rsp_len])
            .map_err(|_| SpdmError::SecurityViolation)?;

        debug!("responder digests slot mask {:#04x}", slot_mask);
        self.state
            .connection_info
            .set_state(ConnectionState::AfterDigest);
        Ok(slot_mask)
    }
}
