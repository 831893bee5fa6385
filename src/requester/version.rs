// Licensed under the Apache-2.0 license

use crate::codec::{Codec, CommonCodec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::protocol::version::SpdmVersion;
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::state::ConnectionState;
use crate::transcript::TranscriptContext;
use core::mem::size_of;
use log::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes};

const VERSION_ENTRY_SIZE: usize = 2;
const MAX_VERSION_ENTRY_COUNT: u8 = 16;

#[allow(dead_code)]
#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
struct VersionRspCommon {
    reserved: u8,
    version_num_entry_count: u8,
}

impl CommonCodec for VersionRspCommon {}

impl<'a> RequesterContext<'a> {
    /// Discover the responder's SPDM versions and select the highest
    /// one both sides support. Resets all connection state first;
    /// GET_VERSION is always sent as SPDM 1.0.
    pub async fn get_version(&mut self) -> SpdmResult<SpdmVersion> {
        let mut attempts = 0u8;
        loop {
            match self.try_get_version().await {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_get_version(&mut self) -> SpdmResult<SpdmVersion> {
        self.state.reset();
        self.session_mgr.reset();
        self.reset_transcript_via_request_code(ReqRespCode::GetVersion);

        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;
        SpdmMsgHdr::new(SpdmVersion::V10, ReqRespCode::GetVersion, 0, 0)
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;

        let mark = self.transcript.checkpoint(TranscriptContext::A);
        let result = self.exchange_version(&mut msg_buf).await;
        if result.is_err() {
            let _ = self.transcript.rollback_to(TranscriptContext::A, mark);
        }
        result
    }

    async fn exchange_version(&mut self, msg_buf: &mut MessageBuf<'_>) -> SpdmResult<SpdmVersion> {
        let req_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        self.transcript
            .append(TranscriptContext::A, req_bytes)
            .map_err(|_| SpdmError::SecurityViolation)?;

        self.send_message(None, msg_buf).await?;
        self.receive_and_validate(None, msg_buf, SpdmVersion::V10, ReqRespCode::GetVersion)
            .await?;

        let rsp_common =
            VersionRspCommon::decode(msg_buf).map_err(|_| SpdmError::DeviceError)?;
        let entry_count = rsp_common.version_num_entry_count;
        if entry_count == 0 || entry_count > MAX_VERSION_ENTRY_COUNT {
            Err(SpdmError::DeviceError)?;
        }

        let mut selected: Option<SpdmVersion> = None;
        for _ in 0..entry_count {
            // Version entry: low byte carries update/alpha, high byte
            // carries major.minor.
            let entry = u16::decode(msg_buf).map_err(|_| SpdmError::DeviceError)?;
            let version_byte = (entry >> 8) as u8;
            if let Ok(version) = SpdmVersion::try_from(version_byte) {
                if self.supported_versions.contains(&version)
                    && selected.map(|cur| version > cur).unwrap_or(true)
                {
                    selected = Some(version);
                }
            }
        }
        let selected = selected.ok_or(SpdmError::Unsupported)?;

        let rsp_len = size_of::<SpdmMsgHdr>()
            + size_of::<VersionRspCommon>()
            + entry_count as usize * VERSION_ENTRY_SIZE;
        let rsp_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        if rsp_bytes.len() < rsp_len {
            Err(SpdmError::DeviceError)?;
        }
        self.transcript
            .append(TranscriptContext::A, &rsp_bytes[..rsp_len])
            .map_err(|_| SpdmError::SecurityViolation)?;

        debug!("negotiated SPDM version {}", selected.to_str());
        self.state.connection_info.set_version_number(selected);
        self.state
            .connection_info
            .set_state(ConnectionState::AfterVersion);
        Ok(selected)
    }
}
