// Licensed under the Apache-2.0 license

use crate::cert_store::{MAX_CERT_SLOTS_SUPPORTED, PROVISIONED_SLOT_ID};
use crate::codec::{decode_u8_slice, encode_u8_slice, Codec, CommonCodec, MessageBuf};
use crate::crypto::{DigestBuf, SpdmDheExchange};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::algorithms::{BaseAsymAlgoType, BaseHashAlgoType};
use crate::protocol::common::{
    spdm_signing_context, ReqRespCode, SpdmMsgHdr, NONCE_LEN, SPDM_SIGNING_CONTEXT_LEN,
};
use crate::protocol::version::SpdmVersion;
use crate::requester::{RequesterContext, MAX_OPAQUE_DATA_SIZE, MAX_SPDM_MSG_SIZE};
use crate::session::{SessionKeyType, SessionManager, SessionPolicy, SessionState};
use crate::state::ConnectionState;
use crate::transcript::TranscriptContext;
use arrayvec::ArrayVec;
use constant_time_eq::constant_time_eq;
use core::mem::size_of;
use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[allow(dead_code)]
#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
struct KeyExchangeReqBase {
    req_session_id: u16,
    session_policy: u8,
    reserved: u8,
}

impl CommonCodec for KeyExchangeReqBase {}

#[allow(dead_code)]
#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
struct KeyExchangeRspBase {
    rsp_session_id: u16,
    mut_auth_requested: u8,
    req_slot_id_param: u8,
}

impl CommonCodec for KeyExchangeRspBase {}

/// Outputs of a successful KEY_EXCHANGE.
#[derive(Debug)]
pub struct KeyExchangeResult {
    pub session_id: u32,
    pub heartbeat_period: u8,
    pub measurement_summary_hash: Option<DigestBuf>,
}

impl<'a> RequesterContext<'a> {
    /// Establish a DHE session with the responder. On success the
    /// session is Handshaking; `finish` promotes it to Established.
    pub async fn key_exchange(
        &mut self,
        slot_id: u8,
        measurement_hash_type: u8,
        session_policy: u8,
    ) -> SpdmResult<KeyExchangeResult> {
        let mut attempts = 0u8;
        loop {
            match self
                .try_key_exchange(slot_id, measurement_hash_type, session_policy)
                .await
            {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_key_exchange(
        &mut self,
        slot_id: u8,
        measurement_hash_type: u8,
        session_policy: u8,
    ) -> SpdmResult<KeyExchangeResult> {
        if self.local_capability_flags().key_ex_cap() == 0
            || self.peer_capabilities().key_ex_cap() == 0
        {
            Err(SpdmError::Unsupported)?;
        }
        if self.connection_state() < ConnectionState::Negotiated {
            Err(SpdmError::Unsupported)?;
        }
        if slot_id >= MAX_CERT_SLOTS_SUPPORTED && slot_id != PROVISIONED_SLOT_ID {
            Err(SpdmError::InvalidParam)?;
        }
        self.peer_cert_store
            .cert_chain(slot_id)
            .map_err(|_| SpdmError::InvalidParam)?;

        let connection_version = self.connection_version();
        let algorithms = self.state.connection_info.peer_algorithms();
        let hash_algo = algorithms.base_hash_algo_type()?;
        let asym_algo = algorithms.base_asym_algo_type()?;
        let dhe_group = algorithms.dhe_group_type()?;
        let aead_suite = algorithms.aead_cipher_suite_type()?;
        let hash_size = hash_algo.hash_size();
        let signature_size = asym_algo.signature_size();
        let dhe_size = dhe_group.exchange_data_size();
        let meas_summary_hash_size = if self.peer_capabilities().meas_cap() == 0 {
            0
        } else {
            algorithms.measurement_summary_hash_size(measurement_hash_type)
        };

        // Ephemeral DHE keypair for this session
        let mut dhe_ctx = self
            .crypto
            .dhe_new(dhe_group)
            .await
            .map_err(|_| SpdmError::DeviceError)?;
        if dhe_ctx.exchange_data().len() != dhe_size {
            Err(SpdmError::DeviceError)?;
        }

        let req_session_id = self.session_mgr.allocate_req_session_id();
        let random_data = self.random_nonce().await?;

        let mut req_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut req_buf = MessageBuf::new(&mut req_storage);
        self.prepare_request_buffer(&mut req_buf)?;
        SpdmMsgHdr::new(
            connection_version,
            ReqRespCode::KeyExchange,
            measurement_hash_type,
            slot_id,
        )
        .encode(&mut req_buf)
        .map_err(|_| SpdmError::DeviceError)?;
        KeyExchangeReqBase {
            req_session_id,
            session_policy: if connection_version >= SpdmVersion::V12 {
                session_policy
            } else {
                0
            },
            reserved: 0,
        }
        .encode(&mut req_buf)
        .map_err(|_| SpdmError::DeviceError)?;
        encode_u8_slice(&random_data, &mut req_buf).map_err(|_| SpdmError::DeviceError)?;
        encode_u8_slice(dhe_ctx.exchange_data(), &mut req_buf)
            .map_err(|_| SpdmError::DeviceError)?;
        0u16.encode(&mut req_buf).map_err(|_| SpdmError::DeviceError)?;

        self.send_message(None, &mut req_buf).await?;

        let mut rsp_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut rsp_buf = MessageBuf::new(&mut rsp_storage);
        let rsp_hdr = self
            .receive_and_validate(
                None,
                &mut rsp_buf,
                connection_version,
                ReqRespCode::KeyExchange,
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
            KeyExchangeRspBase::decode(&mut rsp_buf).map_err(|_| SpdmError::DeviceError)?;

        let mut responder_random = [0u8; NONCE_LEN];
        decode_u8_slice(&mut rsp_buf, &mut responder_random)
            .map_err(|_| SpdmError::DeviceError)?;

        let mut peer_exchange = ArrayVec::<u8, { crate::crypto::MAX_DHE_EXCHANGE_DATA_SIZE }>::new();
        for _ in 0..dhe_size {
            peer_exchange.push(0);
        }
        decode_u8_slice(&mut rsp_buf, &mut peer_exchange[..])
            .map_err(|_| SpdmError::DeviceError)?;

        let mut measurement_summary_hash = DigestBuf::default();
        for _ in 0..meas_summary_hash_size {
            measurement_summary_hash.push(0);
        }
        decode_u8_slice(&mut rsp_buf, &mut measurement_summary_hash[..])
            .map_err(|_| SpdmError::DeviceError)?;

        let opaque_length = u16::decode(&mut rsp_buf).map_err(|_| SpdmError::DeviceError)?;
        if opaque_length as usize > MAX_OPAQUE_DATA_SIZE {
            Err(SpdmError::SecurityViolation)?;
        }
        if rsp_buf.data_len() < opaque_length as usize + signature_size + hash_size {
            Err(SpdmError::DeviceError)?;
        }
        rsp_buf
            .pull_data(opaque_length as usize)
            .map_err(|_| SpdmError::DeviceError)?;

        let rsp_prefix_len = size_of::<SpdmMsgHdr>()
            + size_of::<KeyExchangeRspBase>()
            + NONCE_LEN
            + dhe_size
            + meas_summary_hash_size
            + size_of::<u16>()
            + opaque_length as usize;

        // Session transcript seed: A plus the hash of the chain in use
        let chain = self
            .peer_cert_store
            .cert_chain(slot_id)
            .map_err(|_| SpdmError::InvalidParam)?;
        let cert_chain_hash = self
            .crypto
            .hash(hash_algo, chain)
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;

        let session_id =
            SessionManager::compose_session_id(req_session_id, rsp_base.rsp_session_id);
        {
            let session_info = self
                .session_mgr
                .assign(session_id, false)
                .map_err(|_| SpdmError::DeviceError)?;
            session_info.init(
                SessionPolicy::new(session_policy),
                connection_version,
                hash_algo,
                aead_suite,
            );
            session_info.heartbeat_period = heartbeat_period;
            session_info.mut_auth_requested = rsp_base.mut_auth_requested;
        }

        let result = self
            .complete_key_exchange(
                session_id,
                slot_id,
                hash_algo,
                asym_algo,
                cert_chain_hash,
                dhe_ctx.as_mut(),
                peer_exchange.as_slice(),
                req_buf.message_data().map_err(|_| SpdmError::DeviceError)?,
                &mut rsp_buf,
                rsp_prefix_len,
                signature_size,
                hash_size,
            )
            .await;
        if let Err(e) = result {
            let _ = self.session_mgr.free(session_id);
            return Err(e);
        }

        debug!("session {:#010x} handshaking", session_id);
        Ok(KeyExchangeResult {
            session_id,
            heartbeat_period,
            measurement_summary_hash: (meas_summary_hash_size > 0)
                .then_some(measurement_summary_hash),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_key_exchange(
        &mut self,
        session_id: u32,
        slot_id: u8,
        hash_algo: BaseHashAlgoType,
        asym_algo: BaseAsymAlgoType,
        cert_chain_hash: DigestBuf,
        dhe_ctx: &mut dyn SpdmDheExchange,
        peer_exchange: &[u8],
        req_bytes: &[u8],
        rsp_buf: &mut MessageBuf<'_>,
        rsp_prefix_len: usize,
        signature_size: usize,
        hash_size: usize,
    ) -> SpdmResult<()> {
        let connection_version = self.connection_version();
        let crypto = self.crypto;

        // Bind A, the cert chain hash and both key-exchange messages
        // (minus the verification fields) into transcript K
        let mut seed = ArrayVec::<u8, 1024>::new();
        seed.try_extend_from_slice(self.transcript.as_slice(TranscriptContext::A))
            .map_err(|_| SpdmError::SecurityViolation)?;
        seed.try_extend_from_slice(cert_chain_hash.as_slice())
            .map_err(|_| SpdmError::SecurityViolation)?;

        let rsp_bytes = rsp_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        if rsp_bytes.len() < rsp_prefix_len + signature_size + hash_size {
            Err(SpdmError::DeviceError)?;
        }
        let rsp_prefix = &rsp_bytes[..rsp_prefix_len];
        let signature = &rsp_bytes[rsp_prefix_len..rsp_prefix_len + signature_size];
        let verify_data =
            &rsp_bytes[rsp_prefix_len + signature_size..rsp_prefix_len + signature_size + hash_size];

        let shared_secret = dhe_ctx
            .compute_shared_secret(peer_exchange)
            .await
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
            session_info.set_pre_master_secret(shared_secret);
        }

        // Signature over the session transcript so far
        let transcript_digest = self.session_transcript_hash(session_id).await?;
        let msg_hash = self
            .key_exchange_signing_digest(connection_version, hash_algo, &transcript_digest)
            .await?;
        let chain = self
            .peer_cert_store
            .cert_chain(slot_id)
            .map_err(|_| SpdmError::InvalidParam)?;
        if crypto
            .asym_verify(asym_algo, chain, msg_hash.as_slice(), signature)
            .await
            .is_err()
        {
            warn!("key exchange signature verification failed");
            Err(SpdmError::SecurityViolation)?;
        }

        self.session_mgr
            .session_info_mut(session_id)
            .map_err(|_| SpdmError::DeviceError)?
            .append_transcript_k(signature)
            .map_err(|_| SpdmError::SecurityViolation)?;

        // TH1 keys, then the responder's verify_data HMAC
        let th1 = self.session_transcript_hash(session_id).await?;
        let session_info = self
            .session_mgr
            .session_info_mut(session_id)
            .map_err(|_| SpdmError::DeviceError)?;
        session_info
            .generate_session_handshake_key(crypto, th1.as_slice())
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;

        let th_digest = self.session_transcript_hash(session_id).await?;
        let session_info = self
            .session_mgr
            .session_info(session_id)
            .map_err(|_| SpdmError::DeviceError)?;
        let expected_verify_data = session_info
            .compute_hmac(crypto, SessionKeyType::ResponseFinishedKey, th_digest.as_slice())
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;
        if !constant_time_eq(expected_verify_data.as_slice(), verify_data) {
            warn!("key exchange verify_data mismatch");
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
        Ok(())
    }

    pub(crate) async fn key_exchange_signing_digest(
        &self,
        version: SpdmVersion,
        hash_algo: BaseHashAlgoType,
        transcript_digest: &DigestBuf,
    ) -> SpdmResult<DigestBuf> {
        if version < SpdmVersion::V12 {
            return Ok(transcript_digest.clone());
        }
        let context = spdm_signing_context(version, ReqRespCode::KeyExchangeRsp, false)?;
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
