// Licensed under the Apache-2.0 license

use crate::codec::{decode_u8_slice, encode_u8_slice, Codec, MessageBuf};
use crate::crypto::DigestBuf;
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{
    spdm_signing_context, ReqRespCode, SpdmMsgHdr, SPDM_SIGNING_CONTEXT_LEN,
};
use crate::protocol::version::SpdmVersion;
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::session::{SessionKeyType, SessionState};
use crate::state::ConnectionState;
use constant_time_eq::constant_time_eq;
use core::mem::size_of;
use log::{debug, warn};

// FINISH request attributes
const FINISH_SIGNATURE_INCLUDED: u8 = 0x01;

impl<'a> RequesterContext<'a> {
    /// Complete the handshake of a DHE session: prove possession of the
    /// handshake secret (and, under mutual auth, the requester key),
    /// verify the responder, derive data keys and establish the
    /// session.
    pub async fn finish(&mut self, session_id: u32, req_slot_id: u8) -> SpdmResult<()> {
        let mut attempts = 0u8;
        loop {
            match self.try_finish(session_id, req_slot_id).await {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_finish(&mut self, session_id: u32, req_slot_id: u8) -> SpdmResult<()> {
        if self.connection_state() < ConnectionState::Negotiated {
            Err(SpdmError::Unsupported)?;
        }
        let session_info = self
            .session_mgr
            .session_info(session_id)
            .map_err(|_| SpdmError::Unsupported)?;
        if session_info.use_psk || session_info.session_state != SessionState::Handshaking {
            Err(SpdmError::Unsupported)?;
        }
        let mut_auth_requested = session_info.mut_auth_requested != 0;
        let transcript_mark = session_info.transcript_k.checkpoint();

        let result = self
            .exchange_finish(session_id, req_slot_id, mut_auth_requested)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(SpdmError::NoResponse) => {
                // Responder busy: keep the session, rewind the
                // tentative transcript for the retry
                if let Ok(info) = self.session_mgr.session_info_mut(session_id) {
                    let _ = info.transcript_k.rollback_to(transcript_mark);
                }
                Err(SpdmError::NoResponse)
            }
            Err(e) => {
                // Handshake failed: the session is torn down
                let _ = self.session_mgr.free(session_id);
                Err(e)
            }
        }
    }

    async fn exchange_finish(
        &mut self,
        session_id: u32,
        req_slot_id: u8,
        mut_auth_requested: bool,
    ) -> SpdmResult<()> {
        let connection_version = self.connection_version();
        let crypto = self.crypto;
        let algorithms = self.state.connection_info.peer_algorithms();
        let hash_algo = algorithms.base_hash_algo_type()?;
        let req_asym_algo = algorithms.req_base_asym_algo_type().ok();
        let hash_size = hash_algo.hash_size();

        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;

        let param1 = if mut_auth_requested {
            FINISH_SIGNATURE_INCLUDED
        } else {
            0
        };
        let param2 = if mut_auth_requested { req_slot_id } else { 0 };
        SpdmMsgHdr::new(connection_version, ReqRespCode::Finish, param1, param2)
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;

        // FINISH request header joins K before the verification fields
        // are computed over it
        {
            let req_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
            self.session_mgr
                .session_info_mut(session_id)
                .map_err(|_| SpdmError::DeviceError)?
                .append_transcript_k(req_bytes)
                .map_err(|_| SpdmError::SecurityViolation)?;
        }

        if mut_auth_requested {
            let req_asym_algo = req_asym_algo.ok_or(SpdmError::Unsupported)?;
            self.local_cert_store
                .cert_chain(req_slot_id)
                .map_err(|_| SpdmError::InvalidParam)?;

            let transcript_digest = self.session_transcript_hash(session_id).await?;
            let msg_hash = self
                .finish_signing_digest(connection_version, hash_algo, &transcript_digest)
                .await?;

            let mut signature = [0u8; crate::crypto::MAX_SIGNATURE_SIZE];
            let sig_len = crypto
                .asym_sign(
                    req_asym_algo,
                    req_slot_id,
                    msg_hash.as_slice(),
                    &mut signature,
                )
                .await
                .map_err(|_| SpdmError::SecurityViolation)?;
            if sig_len != req_asym_algo.signature_size() {
                Err(SpdmError::SecurityViolation)?;
            }

            encode_u8_slice(&signature[..sig_len], &mut msg_buf)
                .map_err(|_| SpdmError::DeviceError)?;
            self.session_mgr
                .session_info_mut(session_id)
                .map_err(|_| SpdmError::DeviceError)?
                .append_transcript_k(&signature[..sig_len])
                .map_err(|_| SpdmError::SecurityViolation)?;
        }

        // RequesterVerifyData = HMAC(request finished key, TH so far)
        let th_digest = self.session_transcript_hash(session_id).await?;
        let verify_data = self
            .session_mgr
            .session_info(session_id)
            .map_err(|_| SpdmError::DeviceError)?
            .compute_hmac(crypto, SessionKeyType::RequestFinishedKey, th_digest.as_slice())
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;
        encode_u8_slice(verify_data.as_slice(), &mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;
        self.session_mgr
            .session_info_mut(session_id)
            .map_err(|_| SpdmError::DeviceError)?
            .append_transcript_k(verify_data.as_slice())
            .map_err(|_| SpdmError::SecurityViolation)?;

        self.send_message(Some(session_id), &mut msg_buf).await?;
        self.receive_and_validate(
            Some(session_id),
            &mut msg_buf,
            connection_version,
            ReqRespCode::Finish,
        )
        .await?;

        // FINISH_RSP: header + ResponderVerifyData
        if msg_buf.data_len() < hash_size {
            Err(SpdmError::DeviceError)?;
        }
        {
            let rsp_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
            self.session_mgr
                .session_info_mut(session_id)
                .map_err(|_| SpdmError::DeviceError)?
                .append_transcript_k(&rsp_bytes[..size_of::<SpdmMsgHdr>()])
                .map_err(|_| SpdmError::SecurityViolation)?;
        }

        let mut responder_verify_data = DigestBuf::default();
        for _ in 0..hash_size {
            responder_verify_data.push(0);
        }
        decode_u8_slice(&mut msg_buf, &mut responder_verify_data[..])
            .map_err(|_| SpdmError::DeviceError)?;

        let th_digest = self.session_transcript_hash(session_id).await?;
        let expected = self
            .session_mgr
            .session_info(session_id)
            .map_err(|_| SpdmError::DeviceError)?
            .compute_hmac(
                crypto,
                SessionKeyType::ResponseFinishedKey,
                th_digest.as_slice(),
            )
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;
        if !constant_time_eq(expected.as_slice(), responder_verify_data.as_slice()) {
            warn!("finish: responder verify_data mismatch");
            Err(SpdmError::SecurityViolation)?;
        }

        self.session_mgr
            .session_info_mut(session_id)
            .map_err(|_| SpdmError::DeviceError)?
            .append_transcript_k(responder_verify_data.as_slice())
            .map_err(|_| SpdmError::SecurityViolation)?;

        // TH2: data-phase keys, session established
        let th2 = self.session_transcript_hash(session_id).await?;
        let session_info = self
            .session_mgr
            .session_info_mut(session_id)
            .map_err(|_| SpdmError::DeviceError)?;
        session_info
            .generate_session_data_key(crypto, th2.as_slice())
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;
        session_info.set_session_state(SessionState::Established);

        debug!("session {:#010x} established", session_id);
        Ok(())
    }

    async fn finish_signing_digest(
        &self,
        version: SpdmVersion,
        hash_algo: crate::protocol::algorithms::BaseHashAlgoType,
        transcript_digest: &DigestBuf,
    ) -> SpdmResult<DigestBuf> {
        if version < SpdmVersion::V12 {
            return Ok(transcript_digest.clone());
        }
        let context = spdm_signing_context(version, ReqRespCode::Finish, true)?;
        let mut message = [0u8; SPDM_SIGNING_CONTEXT_LEN + crate::crypto::MAX_HASH_SIZE];
        message[..SPDM_SIGNING_CONTEXT_LEN].copy_from_slice(&context);
        message[SPDM_SIGNING_CONTEXT_LEN..SPDM_SIGNING_CONTEXT_LEN + transcript_digest.len()]
            .copy_from_slice(transcript_digest.as_slice());
        self.crypto
            .hash(
                hash_algo,
                &message[..SPDM_SIGNING_CONTEXT_LEN + transcript_digest.len()],
            )
            .await
            .map_err(|_| SpdmError::SecurityViolation)
    }
}
