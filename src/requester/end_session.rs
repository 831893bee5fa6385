// Licensed under the Apache-2.0 license

use crate::codec::{Codec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::session::SessionState;
use crate::state::ConnectionState;
use log::debug;

impl<'a> RequesterContext<'a> {
    /// Terminate a session. On acknowledgement the session transitions
    /// to Terminated and its id is released for reuse.
    pub async fn end_session(&mut self, session_id: u32, end_attributes: u8) -> SpdmResult<()> {
        let mut attempts = 0u8;
        loop {
            match self.try_end_session(session_id, end_attributes).await {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_end_session(&mut self, session_id: u32, end_attributes: u8) -> SpdmResult<()> {
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
        SpdmMsgHdr::new(
            connection_version,
            ReqRespCode::EndSession,
            end_attributes,
            0,
        )
        .encode(&mut msg_buf)
        .map_err(|_| SpdmError::DeviceError)?;

        self.send_message(Some(session_id), &mut msg_buf).await?;
        self.receive_and_validate(
            Some(session_id),
            &mut msg_buf,
            connection_version,
            ReqRespCode::EndSession,
        )
        .await?;

        // Acknowledged: the session is gone on both sides
        if let Ok(info) = self.session_mgr.session_info_mut(session_id) {
            info.set_session_state(SessionState::Terminated);
        }
        self.session_mgr
            .free(session_id)
            .map_err(|_| SpdmError::DeviceError)?;

        debug!("session {:#010x} terminated", session_id);
        Ok(())
    }
}
