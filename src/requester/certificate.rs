// Licensed under the Apache-2.0 license

use crate::cert_store::{MAX_CERT_CHAIN_SIZE, MAX_CERT_SLOTS_SUPPORTED};
use crate::codec::{Codec, CommonCodec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::state::ConnectionState;
use crate::transcript::TranscriptContext;
use core::mem::size_of;
use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

// Largest chain window requested per GET_CERTIFICATE
const MAX_CERT_PORTION_LEN: usize = 1024;

#[allow(dead_code)]
#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
struct GetCertificateReq {
    offset: u16,
    length: u16,
}

impl CommonCodec for GetCertificateReq {}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
struct CertificateRspBase {
    portion_length: u16,
    remainder_length: u16,
}

impl CommonCodec for CertificateRspBase {}

impl<'a> RequesterContext<'a> {
    /// Retrieve and validate the certificate chain in `slot_id`,
    /// windowed through as many GET_CERTIFICATE exchanges as the
    /// responder needs. The chain bytes are copied into `out`.
    pub async fn get_certificate(&mut self, slot_id: u8, out: &mut [u8]) -> SpdmResult<usize> {
        let mut attempts = 0u8;
        loop {
            match self.try_get_certificate(slot_id, out).await {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_get_certificate(&mut self, slot_id: u8, out: &mut [u8]) -> SpdmResult<usize> {
        if self.peer_capabilities().cert_cap() == 0 {
            Err(SpdmError::Unsupported)?;
        }
        if self.connection_state() < ConnectionState::Negotiated {
            Err(SpdmError::Unsupported)?;
        }
        if slot_id >= MAX_CERT_SLOTS_SUPPORTED {
            Err(SpdmError::InvalidParam)?;
        }

        let mark = self.transcript.checkpoint(TranscriptContext::B);
        self.peer_cert_store
            .start_retrieval(slot_id)
            .map_err(|_| SpdmError::InvalidParam)?;

        let result = self.retrieve_certificate_chain(slot_id, out).await;
        if result.is_err() {
            self.peer_cert_store.drop_retrieval();
            let _ = self.transcript.rollback_to(TranscriptContext::B, mark);
        }
        result
    }

    async fn retrieve_certificate_chain(
        &mut self,
        slot_id: u8,
        out: &mut [u8],
    ) -> SpdmResult<usize> {
        let connection_version = self.connection_version();
        let mut offset = 0usize;
        let mut total_len = 0usize;

        loop {
            let window = core::cmp::min(MAX_CERT_PORTION_LEN, MAX_CERT_CHAIN_SIZE - offset);
            if window == 0 {
                Err(SpdmError::SecurityViolation)?;
            }

            let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
            let mut msg_buf = MessageBuf::new(&mut msg_storage);
            self.prepare_request_buffer(&mut msg_buf)?;
            SpdmMsgHdr::new(connection_version, ReqRespCode::GetCertificate, slot_id, 0)
                .encode(&mut msg_buf)
                .map_err(|_| SpdmError::DeviceError)?;
            GetCertificateReq {
                offset: offset as u16,
                length: window as u16,
            }
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;

            let req_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
            self.transcript
                .append(TranscriptContext::B, req_bytes)
                .map_err(|_| SpdmError::SecurityViolation)?;

            self.send_message(None, &mut msg_buf).await?;
            let rsp_hdr = self
                .receive_and_validate(
                    None,
                    &mut msg_buf,
                    connection_version,
                    ReqRespCode::GetCertificate,
                )
                .await?;
            if rsp_hdr.param1() & 0x0F != slot_id {
                Err(SpdmError::DeviceError)?;
            }

            let rsp_base =
                CertificateRspBase::decode(&mut msg_buf).map_err(|_| SpdmError::DeviceError)?;
            let portion_length = rsp_base.portion_length as usize;
            let remainder_length = rsp_base.remainder_length as usize;
            if portion_length == 0
                || portion_length > window
                || msg_buf.data_len() < portion_length
            {
                Err(SpdmError::DeviceError)?;
            }
            if offset + portion_length + remainder_length > MAX_CERT_CHAIN_SIZE {
                Err(SpdmError::SecurityViolation)?;
            }

            let portion = msg_buf
                .data(portion_length)
                .map_err(|_| SpdmError::DeviceError)?;
            self.peer_cert_store
                .append_chain_portion(portion)
                .map_err(|_| SpdmError::SecurityViolation)?;

            let rsp_len =
                size_of::<SpdmMsgHdr>() + size_of::<CertificateRspBase>() + portion_length;
            let rsp_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
            self.transcript
                .append(TranscriptContext::B, &rsp_bytes[..rsp_len])
                .map_err(|_| SpdmError::SecurityViolation)?;

            offset += portion_length;
            total_len += portion_length;
            if remainder_length == 0 {
                break;
            }
        }

        let chain = self
            .peer_cert_store
            .cert_chain(slot_id)
            .map_err(|_| SpdmError::DeviceError)?;
        if out.len() < chain.len() {
            Err(SpdmError::InvalidParam)?;
        }
        out[..chain.len()].copy_from_slice(chain);

        if let Err(e) = self
            .cert_validator
            .validate_cert_chain(slot_id, &out[..total_len])
            .await
        {
            warn!("certificate chain validation failed: {:?}", e);
            Err(SpdmError::SecurityViolation)?;
        }

        debug!("retrieved cert chain slot {} ({} bytes)", slot_id, total_len);
        self.state
            .connection_info
            .set_state(ConnectionState::AfterCertificate);
        Ok(total_len)
    }
}
