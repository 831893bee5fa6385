// Licensed under the Apache-2.0 license

use crate::codec::{Codec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::session::{KeyUpdateDirection, SessionState};
use crate::state::ConnectionState;
use log::{debug, warn};

// KEY_UPDATE operations table
const KEY_UPDATE_OP_UPDATE_KEY: u8 = 1;
const KEY_UPDATE_OP_UPDATE_ALL_KEYS: u8 = 2;
const KEY_UPDATE_OP_VERIFY_NEW_KEY: u8 = 3;

impl<'a> RequesterContext<'a> {
    /// Rotate session data keys.
    ///
    /// `single_direction` rotates only the requester direction
    /// (UPDATE_KEY); otherwise both directions rotate
    /// (UPDATE_ALL_KEYS). The new responder key is created before the
    /// request is sent and is activated only on a matching ACK; any
    /// failure rolls the responder direction back to the old key, so
    /// both peers stay on a common key in every direction. The update
    /// is confirmed with VERIFY_NEW_KEY.
    pub async fn key_update(&mut self, session_id: u32, single_direction: bool) -> SpdmResult<()> {
        let mut key_updated = false;
        let mut attempts = 0u8;
        loop {
            match self
                .try_key_update(session_id, single_direction, &mut key_updated)
                .await
            {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_key_update(
        &mut self,
        session_id: u32,
        single_direction: bool,
        key_updated: &mut bool,
    ) -> SpdmResult<()> {
        if self.local_capability_flags().key_upd_cap() == 0
            || self.peer_capabilities().key_upd_cap() == 0
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
        self.reset_transcript_via_request_code(ReqRespCode::KeyUpdate);

        if !*key_updated {
            self.update_phase(session_id, single_direction).await?;
            *key_updated = true;
        }

        self.verify_phase(session_id).await
    }

    // Phase U: rotate the keys.
    async fn update_phase(&mut self, session_id: u32, single_direction: bool) -> SpdmResult<()> {
        let crypto = self.crypto;
        let operation = if single_direction {
            KEY_UPDATE_OP_UPDATE_KEY
        } else {
            KEY_UPDATE_OP_UPDATE_ALL_KEYS
        };
        // The random tag is the value the ACK must echo
        let mut tag = [0u8; 1];
        crypto
            .random(&mut tag)
            .await
            .map_err(|_| SpdmError::DeviceError)?;
        let tag = tag[0];

        // Create the new responder key before sending; the responder
        // switches its transmit key as soon as it processes the request
        if !single_direction {
            debug!("key_update[{:#010x}] create responder key", session_id);
            self.session_mgr
                .session_info_mut(session_id)
                .map_err(|_| SpdmError::DeviceError)?
                .create_update_data_key(crypto, KeyUpdateDirection::Responder)
                .await
                .map_err(|_| SpdmError::DeviceError)?;
        }

        let result = self
            .key_update_exchange(session_id, ReqRespCode::KeyUpdate, operation, tag)
            .await;

        match result {
            Ok(()) => {
                if !single_direction {
                    debug!("key_update[{:#010x}] activate responder key (new)", session_id);
                    self.session_mgr
                        .session_info_mut(session_id)
                        .map_err(|_| SpdmError::DeviceError)?
                        .activate_update_data_key(KeyUpdateDirection::Responder, true)
                        .map_err(|_| SpdmError::DeviceError)?;
                }
            }
            Err(e) => {
                if !single_direction {
                    warn!("key_update[{:#010x}] rollback responder key (old)", session_id);
                    if let Ok(info) = self.session_mgr.session_info_mut(session_id) {
                        let _ = info.activate_update_data_key(KeyUpdateDirection::Responder, false);
                    }
                }
                return Err(e);
            }
        }

        // The requester rotates its own direction unilaterally once the
        // responder acknowledged the operation
        debug!("key_update[{:#010x}] activate requester key (new)", session_id);
        let session_info = self
            .session_mgr
            .session_info_mut(session_id)
            .map_err(|_| SpdmError::DeviceError)?;
        session_info
            .create_update_data_key(crypto, KeyUpdateDirection::Requester)
            .await
            .map_err(|_| SpdmError::DeviceError)?;
        session_info
            .activate_update_data_key(KeyUpdateDirection::Requester, true)
            .map_err(|_| SpdmError::DeviceError)?;

        Ok(())
    }

    // Phase V: confirm both sides are on the new keys. Failure here is
    // a device error; the keys are already committed on both sides.
    async fn verify_phase(&mut self, session_id: u32) -> SpdmResult<()> {
        let mut tag = [0u8; 1];
        self.crypto
            .random(&mut tag)
            .await
            .map_err(|_| SpdmError::DeviceError)?;

        self.key_update_exchange(
            session_id,
            ReqRespCode::KeyUpdate,
            KEY_UPDATE_OP_VERIFY_NEW_KEY,
            tag[0],
        )
        .await
        .inspect(|_| debug!("key_update[{:#010x}] verified", session_id))
        .inspect_err(|_| warn!("key_update[{:#010x}] verify failed", session_id))
    }

    // One KEY_UPDATE request/ACK round; the ACK must echo the
    // operation and the random tag.
    async fn key_update_exchange(
        &mut self,
        session_id: u32,
        request_code: ReqRespCode,
        operation: u8,
        tag: u8,
    ) -> SpdmResult<()> {
        let connection_version = self.connection_version();
        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;
        SpdmMsgHdr::new(connection_version, request_code, operation, tag)
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;

        self.send_message(Some(session_id), &mut msg_buf).await?;
        let rsp_hdr = self
            .receive_and_validate(
                Some(session_id),
                &mut msg_buf,
                connection_version,
                request_code,
            )
            .await?;

        if rsp_hdr.param1() != operation || rsp_hdr.param2() != tag {
            Err(SpdmError::DeviceError)?;
        }
        Ok(())
    }
}
