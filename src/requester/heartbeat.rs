// Licensed under the Apache-2.0 license

use crate::codec::{Codec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::session::SessionState;
use crate::state::ConnectionState;
use log::debug;

impl<'a> RequesterContext<'a> {
    /// Keep a session alive. The embedding is expected to call this
    /// within the negotiated heartbeat period and to reset its
    /// watchdog on success.
    pub async fn heartbeat(&mut self, session_id: u32) -> SpdmResult<()> {
        let mut attempts = 0u8;
        loop {
            match self.try_heartbeat(session_id).await {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_heartbeat(&mut self, session_id: u32) -> SpdmResult<()> {
        if self.local_capability_flags().hbeat_cap() == 0
            || self.peer_capabilities().hbeat_cap() == 0
        {
            Err(SpdmError::Unsupported)?;
        }
        if self.connection_state() < ConnectionState::Negotiated {
            Err(SpdmError::Unsupported)?;
        }
        let session_info = self
            .session_mgr
            .session_info(session_id)
            .map_err(|_| SpdmError::Unsupported)?;
        if session_info.session_state != SessionState::Established {
            Err(SpdmError::Unsupported)?;
        }

        let connection_version = self.connection_version();
        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;
        SpdmMsgHdr::new(connection_version, ReqRespCode::Heartbeat, 0, 0)
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;

        self.send_message(Some(session_id), &mut msg_buf).await?;
        let rsp_hdr = self
            .receive_and_validate(
                Some(session_id),
                &mut msg_buf,
                connection_version,
                ReqRespCode::Heartbeat,
            )
            .await?;
        if rsp_hdr.param1() != 0 || rsp_hdr.param2() != 0 {
            Err(SpdmError::DeviceError)?;
        }

        debug!("heartbeat[{:#010x}] acknowledged", session_id);
        Ok(())
    }
}
