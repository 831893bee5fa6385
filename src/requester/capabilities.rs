// Licensed under the Apache-2.0 license

use crate::codec::{Codec, CommonCodec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::capabilities::{
    rsp_flag_compatible, CapabilityFlags, DeviceCapabilities, MAX_CT_EXPONENT,
    MIN_DATA_TRANSFER_SIZE_V12,
};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::protocol::version::SpdmVersion;
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::state::ConnectionState;
use crate::transcript::TranscriptContext;
use core::mem::size_of;
use log::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[allow(dead_code)]
#[derive(FromBytes, IntoBytes, Immutable, Default)]
#[repr(C)]
struct CapabilitiesV11 {
    reserved: u8,
    ct_exponent: u8,
    reserved2: u8,
    reserved3: u8,
    flags: CapabilityFlags,
}

impl CommonCodec for CapabilitiesV11 {}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C, packed)]
struct CapabilitiesV12 {
    data_transfer_size: u32,
    max_spdm_msg_size: u32,
}

impl CommonCodec for CapabilitiesV12 {}

impl<'a> RequesterContext<'a> {
    /// Exchange capability flags with the responder.
    pub async fn get_capabilities(&mut self) -> SpdmResult<()> {
        let mut attempts = 0u8;
        loop {
            match self.try_get_capabilities().await {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_get_capabilities(&mut self) -> SpdmResult<()> {
        if self.connection_state() != ConnectionState::AfterVersion {
            Err(SpdmError::Unsupported)?;
        }
        self.reset_transcript_via_request_code(ReqRespCode::GetCapabilities);

        let connection_version = self.connection_version();
        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;

        SpdmMsgHdr::new(connection_version, ReqRespCode::GetCapabilities, 0, 0)
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;
        if connection_version >= SpdmVersion::V11 {
            CapabilitiesV11 {
                reserved: 0,
                ct_exponent: self.local_capabilities.ct_exponent,
                reserved2: 0,
                reserved3: 0,
                flags: self.local_capabilities.flags,
            }
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;
        }
        if connection_version >= SpdmVersion::V12 {
            CapabilitiesV12 {
                data_transfer_size: self.local_capabilities.data_transfer_size,
                max_spdm_msg_size: self.local_capabilities.max_spdm_msg_size,
            }
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;
        }

        let mark = self.transcript.checkpoint(TranscriptContext::A);
        let result = self
            .exchange_capabilities(connection_version, &mut msg_buf)
            .await;
        if result.is_err() {
            let _ = self.transcript.rollback_to(TranscriptContext::A, mark);
        }
        result
    }

    async fn exchange_capabilities(
        &mut self,
        connection_version: SpdmVersion,
        msg_buf: &mut MessageBuf<'_>,
    ) -> SpdmResult<()> {
        let req_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        self.transcript
            .append(TranscriptContext::A, req_bytes)
            .map_err(|_| SpdmError::SecurityViolation)?;

        self.send_message(None, msg_buf).await?;
        self.receive_and_validate(
            None,
            msg_buf,
            connection_version,
            ReqRespCode::GetCapabilities,
        )
        .await?;

        let rsp_common = CapabilitiesV11::decode(msg_buf).map_err(|_| SpdmError::DeviceError)?;
        if rsp_common.ct_exponent > MAX_CT_EXPONENT {
            Err(SpdmError::DeviceError)?;
        }
        if !rsp_flag_compatible(&rsp_common.flags) {
            Err(SpdmError::DeviceError)?;
        }

        let mut rsp_len = size_of::<SpdmMsgHdr>() + size_of::<CapabilitiesV11>();
        let mut peer_capabilities = DeviceCapabilities {
            ct_exponent: rsp_common.ct_exponent,
            flags: rsp_common.flags,
            data_transfer_size: 0,
            max_spdm_msg_size: 0,
        };
        if connection_version >= SpdmVersion::V12 {
            let rsp_v12 = CapabilitiesV12::decode(msg_buf).map_err(|_| SpdmError::DeviceError)?;
            let data_transfer_size = rsp_v12.data_transfer_size;
            let max_spdm_msg_size = rsp_v12.max_spdm_msg_size;
            if data_transfer_size < MIN_DATA_TRANSFER_SIZE_V12
                || data_transfer_size > max_spdm_msg_size
            {
                Err(SpdmError::DeviceError)?;
            }
            peer_capabilities.data_transfer_size = data_transfer_size;
            peer_capabilities.max_spdm_msg_size = max_spdm_msg_size;
            rsp_len += size_of::<CapabilitiesV12>();
        }

        let rsp_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        if rsp_bytes.len() < rsp_len {
            Err(SpdmError::DeviceError)?;
        }
        self.transcript
            .append(TranscriptContext::A, &rsp_bytes[..rsp_len])
            .map_err(|_| SpdmError::SecurityViolation)?;

        debug!("peer capabilities: {:?}", peer_capabilities.flags);
        self.state
            .connection_info
            .set_peer_capabilities(peer_capabilities);
        self.state
            .connection_info
            .set_state(ConnectionState::AfterCapabilities);
        Ok(())
    }
}
