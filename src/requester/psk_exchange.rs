// Licensed under the Apache-2.0 license

use crate::codec::{decode_u8_slice, encode_u8_slice, Codec, CommonCodec, MessageBuf};
use crate::crypto::{DigestBuf, SharedSecret};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::algorithms::validate_negotiated_algorithms;
use crate::protocol::capabilities::PskCapability;
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::protocol::version::SpdmVersion;
use crate::requester::{
    RequesterContext, MAX_OPAQUE_DATA_SIZE, MAX_SPDM_MSG_SIZE, PSK_CONTEXT_LEN,
};
use crate::session::{SessionKeyType, SessionManager, SessionPolicy, SessionState};
use crate::state::ConnectionState;
use crate::transcript::TranscriptContext;
use arrayvec::ArrayVec;
use constant_time_eq::constant_time_eq;
use core::mem::size_of;
use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

// Largest responder context accepted in PSK_EXCHANGE_RSP
const MAX_PSK_RSP_CONTEXT_LEN: usize = 64;

#[allow(dead_code)]
#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
struct PskExchangeReqBase {
    req_session_id: u16,
    psk_hint_length: u16,
    context_length: u16,
    opaque_length: u16,
}

impl CommonCodec for PskExchangeReqBase {}

#[allow(dead_code)]
#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
struct PskExchangeRspBase {
    rsp_session_id: u16,
    reserved: u16,
    context_length: u16,
    opaque_length: u16,
}

impl CommonCodec for PskExchangeRspBase {}

/// Outputs of a successful PSK_EXCHANGE.
pub struct PskExchangeResult {
    pub session_id: u32,
    pub heartbeat_period: u8,
    pub measurement_summary_hash: Option<DigestBuf>,
}

impl<'a> RequesterContext<'a> {
    /// Establish a session keyed by the configured pre-shared key.
    ///
    /// When the responder advertises PSK capability without session
    /// context, the session is Established on return; otherwise it is
    /// Handshaking and `psk_finish` completes it.
    pub async fn psk_exchange(
        &mut self,
        measurement_hash_type: u8,
        session_policy: u8,
    ) -> SpdmResult<PskExchangeResult> {
        let mut attempts = 0u8;
        loop {
            match self
                .try_psk_exchange(measurement_hash_type, session_policy)
                .await
            {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_psk_exchange(
        &mut self,
        measurement_hash_type: u8,
        session_policy: u8,
    ) -> SpdmResult<PskExchangeResult> {
        if self.local_capability_flags().psk_cap() == PskCapability::NoPsk as u8
            || self.peer_capabilities().psk_cap() == PskCapability::NoPsk as u8
        {
            Err(SpdmError::Unsupported)?;
        }
        self.reset_transcript_via_request_code(ReqRespCode::PskExchange);
        if self.connection_state() < ConnectionState::Negotiated {
            Err(SpdmError::Unsupported)?;
        }
        let psk_hint = self.psk_hint.ok_or(SpdmError::Unsupported)?;

        // ALGORITHMS may have been provisioned rather than negotiated;
        // re-check what the key schedule depends on
        let peer_meas_cap = self.peer_capabilities().meas_cap() != 0;
        validate_negotiated_algorithms(self.state.connection_info.peer_algorithms(), peer_meas_cap)
            .map_err(|_| SpdmError::DeviceError)?;

        let connection_version = self.connection_version();
        let algorithms = self.state.connection_info.peer_algorithms();
        let hash_algo = algorithms.base_hash_algo_type()?;
        let aead_suite = algorithms.aead_cipher_suite_type()?;
        let hash_size = hash_algo.hash_size();
        let meas_summary_hash_size = if peer_meas_cap {
            algorithms.measurement_summary_hash_size(measurement_hash_type)
        } else {
            0
        };

        let req_session_id = self.session_mgr.allocate_req_session_id();
        let mut requester_context = [0u8; PSK_CONTEXT_LEN];
        self.crypto
            .random(&mut requester_context)
            .await
            .map_err(|_| SpdmError::DeviceError)?;

        let mut req_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut req_buf = MessageBuf::new(&mut req_storage);
        self.prepare_request_buffer(&mut req_buf)?;
        SpdmMsgHdr::new(
            connection_version,
            ReqRespCode::PskExchange,
            measurement_hash_type,
            if connection_version >= SpdmVersion::V12 {
                session_policy
            } else {
                0
            },
        )
        .encode(&mut req_buf)
        .map_err(|_| SpdmError::DeviceError)?;
        PskExchangeReqBase {
            req_session_id,
            psk_hint_length: psk_hint.len() as u16,
            context_length: PSK_CONTEXT_LEN as u16,
            opaque_length: 0,
        }
        .encode(&mut req_buf)
        .map_err(|_| SpdmError::DeviceError)?;
        encode_u8_slice(psk_hint, &mut req_buf).map_err(|_| SpdmError::DeviceError)?;
        encode_u8_slice(&requester_context, &mut req_buf).map_err(|_| SpdmError::DeviceError)?;

        self.send_message(None, &mut req_buf).await?;

        let mut rsp_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut rsp_buf = MessageBuf::new(&mut rsp_storage);
        let rsp_hdr = self
            .receive_and_validate(
                None,
                &mut rsp_buf,
                connection_version,
                ReqRespCode::PskExchange,
            )
            .await?;

        let heartbeat_period = rsp_hdr.param1();
        if heartbeat_period != 0
            && (self.local_capability_flags().hbeat_cap() == 0
                || self.peer_capabilities().hbeat_cap() == 0)
        {
            Err(SpdmError::DeviceError)?;
        }

        let rsp_base =
            PskExchangeRspBase::decode(&mut rsp_buf).map_err(|_| SpdmError::DeviceError)?;
        let context_length = rsp_base.context_length as usize;
        let opaque_length = rsp_base.opaque_length as usize;
        if context_length > MAX_PSK_RSP_CONTEXT_LEN {
            Err(SpdmError::SecurityViolation)?;
        }
        if opaque_length > MAX_OPAQUE_DATA_SIZE {
            Err(SpdmError::SecurityViolation)?;
        }
        if rsp_buf.data_len() < meas_summary_hash_size + context_length + opaque_length + hash_size
        {
            Err(SpdmError::DeviceError)?;
        }

        let mut measurement_summary_hash = DigestBuf::default();
        for _ in 0..meas_summary_hash_size {
            measurement_summary_hash.push(0);
        }
        decode_u8_slice(&mut rsp_buf, &mut measurement_summary_hash[..])
            .map_err(|_| SpdmError::DeviceError)?;
        rsp_buf
            .pull_data(context_length + opaque_length)
            .map_err(|_| SpdmError::DeviceError)?;

        let rsp_prefix_len = size_of::<SpdmMsgHdr>()
            + size_of::<PskExchangeRspBase>()
            + meas_summary_hash_size
            + context_length
            + opaque_length;

        let session_id =
            SessionManager::compose_session_id(req_session_id, rsp_base.rsp_session_id);
        {
            let session_info = self
                .session_mgr
                .assign(session_id, true)
                .map_err(|_| SpdmError::DeviceError)?;
            session_info.init(
                SessionPolicy::new(session_policy),
                connection_version,
                hash_algo,
                aead_suite,
            );
            session_info.heartbeat_period = heartbeat_period;
        }

        let result = self
            .complete_psk_exchange(
                session_id,
                psk_hint,
                req_buf.message_data().map_err(|_| SpdmError::DeviceError)?,
                &mut rsp_buf,
                rsp_prefix_len,
                hash_size,
            )
            .await;
        if let Err(e) = result {
            let _ = self.session_mgr.free(session_id);
            return Err(e);
        }

        Ok(PskExchangeResult {
            session_id,
            heartbeat_period,
            measurement_summary_hash: (meas_summary_hash_size > 0)
                .then_some(measurement_summary_hash),
        })
    }

    async fn complete_psk_exchange(
        &mut self,
        session_id: u32,
        psk_hint: &[u8],
        req_bytes: &[u8],
        rsp_buf: &mut MessageBuf<'_>,
        rsp_prefix_len: usize,
        hash_size: usize,
    ) -> SpdmResult<()> {
        let crypto = self.crypto;

        let psk = crypto
            .resolve_psk(psk_hint)
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;
        let pre_master_secret =
            SharedSecret::from_slice(psk.as_slice()).map_err(|_| SpdmError::DeviceError)?;

        let rsp_bytes = rsp_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        if rsp_bytes.len() < rsp_prefix_len + hash_size {
            Err(SpdmError::DeviceError)?;
        }
        let rsp_prefix = &rsp_bytes[..rsp_prefix_len];
        let verify_data = &rsp_bytes[rsp_prefix_len..rsp_prefix_len + hash_size];

        // PSK transcripts bind A but no certificate chain
        let mut seed = ArrayVec::<u8, 1024>::new();
        seed.try_extend_from_slice(self.transcript.as_slice(TranscriptContext::A))
            .map_err(|_| SpdmError::SecurityViolation)?;

        {
            let session_info = self
                .session_mgr
                .session_info_mut(session_id)
                .map_err(|_| SpdmError::DeviceError)?;
            session_info
                .append_transcript_k(seed.as_slice())
                .map_err(|_| SpdmError::SecurityViolation)?;
            session_info
                .append_transcript_k(req_bytes)
                .map_err(|_| SpdmError::SecurityViolation)?;
            session_info
                .append_transcript_k(rsp_prefix)
                .map_err(|_| SpdmError::SecurityViolation)?;
            session_info.set_pre_master_secret(pre_master_secret);
        }

        // TH1 keys, then the responder's verify_data HMAC
        let th1 = self.session_transcript_hash(session_id).await?;
        self.session_mgr
            .session_info_mut(session_id)
            .map_err(|_| SpdmError::DeviceError)?
            .generate_session_handshake_key(crypto, th1.as_slice())
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;

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
        if !constant_time_eq(expected.as_slice(), verify_data) {
            warn!("psk exchange verify_data mismatch");
            Err(SpdmError::SecurityViolation)?;
        }

        let session_info = self
            .session_mgr
            .session_info_mut(session_id)
            .map_err(|_| SpdmError::DeviceError)?;
        session_info
            .append_transcript_k(verify_data)
            .map_err(|_| SpdmError::SecurityViolation)?;
        session_info.set_session_state(SessionState::Handshaking);

        // Without responder session context there is no PSK_FINISH:
        // compute TH2 and enter the application phase directly
        if self.peer_capabilities().psk_cap() != PskCapability::PskWithContext as u8 {
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
            debug!("psk session {:#010x} established (no responder context)", session_id);
        } else {
            debug!("psk session {:#010x} handshaking", session_id);
        }

        Ok(())
    }

    /// Complete a PSK session against a responder that maintains
    /// session context.
    pub async fn psk_finish(&mut self, session_id: u32) -> SpdmResult<()> {
        let mut attempts = 0u8;
        loop {
            match self.try_psk_finish(session_id).await {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_psk_finish(&mut self, session_id: u32) -> SpdmResult<()> {
        let session_info = self
            .session_mgr
            .session_info(session_id)
            .map_err(|_| SpdmError::Unsupported)?;
        if !session_info.use_psk || session_info.session_state != SessionState::Handshaking {
            Err(SpdmError::Unsupported)?;
        }
        let transcript_mark = session_info.transcript_k.checkpoint();

        let result = self.exchange_psk_finish(session_id).await;
        match result {
            Ok(()) => Ok(()),
            Err(SpdmError::NoResponse) => {
                if let Ok(info) = self.session_mgr.session_info_mut(session_id) {
                    let _ = info.transcript_k.rollback_to(transcript_mark);
                }
                Err(SpdmError::NoResponse)
            }
            Err(e) => {
                let _ = self.session_mgr.free(session_id);
                Err(e)
            }
        }
    }

    async fn exchange_psk_finish(&mut self, session_id: u32) -> SpdmResult<()> {
        let connection_version = self.connection_version();
        let crypto = self.crypto;

        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;
        SpdmMsgHdr::new(connection_version, ReqRespCode::PskFinish, 0, 0)
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;

        {
            let req_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
            self.session_mgr
                .session_info_mut(session_id)
                .map_err(|_| SpdmError::DeviceError)?
                .append_transcript_k(req_bytes)
                .map_err(|_| SpdmError::SecurityViolation)?;
        }

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
            ReqRespCode::PskFinish,
        )
        .await?;

        {
            let rsp_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
            self.session_mgr
                .session_info_mut(session_id)
                .map_err(|_| SpdmError::DeviceError)?
                .append_transcript_k(&rsp_bytes[..size_of::<SpdmMsgHdr>()])
                .map_err(|_| SpdmError::SecurityViolation)?;
        }

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

        debug!("psk session {:#010x} established", session_id);
        Ok(())
    }
}
