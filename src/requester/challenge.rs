// Licensed under the Apache-2.0 license

use crate::cert_store::{MAX_CERT_SLOTS_SUPPORTED, PROVISIONED_SLOT_ID};
use crate::codec::{decode_u8_slice, encode_u8_slice, Codec, MessageBuf};
use crate::crypto::DigestBuf;
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{
    spdm_signing_context, ReqRespCode, SpdmMsgHdr, NONCE_LEN, SPDM_SIGNING_CONTEXT_LEN,
};
use crate::protocol::version::SpdmVersion;
use crate::requester::{RequesterContext, MAX_OPAQUE_DATA_SIZE, MAX_SPDM_MSG_SIZE};
use crate::state::ConnectionState;
use crate::transcript::TranscriptContext;
use constant_time_eq::constant_time_eq;
use core::mem::size_of;
use log::{debug, warn};

// CHALLENGE_AUTH attribute byte
const AUTH_ATTRIBUTE_SLOT_ID_MASK: u8 = 0x0F;
const AUTH_ATTRIBUTE_BASIC_MUT_AUTH_REQ: u8 = 0x80;

/// Outputs of a successful CHALLENGE exchange.
#[derive(Debug)]
pub struct ChallengeResult {
    pub slot_mask: u8,
    pub measurement_summary_hash: Option<DigestBuf>,
    pub requester_nonce: [u8; NONCE_LEN],
    pub responder_nonce: [u8; NONCE_LEN],
}

impl<'a> RequesterContext<'a> {
    /// Authenticate the responder against the chain in `slot_id` via a
    /// signed challenge. Runs the basic mutual-authentication flow when
    /// the responder requests it, then marks the connection
    /// Authenticated.
    pub async fn challenge(
        &mut self,
        slot_id: u8,
        measurement_hash_type: u8,
        requester_nonce_in: Option<&[u8; NONCE_LEN]>,
    ) -> SpdmResult<ChallengeResult> {
        let mut attempts = 0u8;
        loop {
            match self
                .try_challenge(slot_id, measurement_hash_type, requester_nonce_in)
                .await
            {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_challenge(
        &mut self,
        slot_id: u8,
        measurement_hash_type: u8,
        requester_nonce_in: Option<&[u8; NONCE_LEN]>,
    ) -> SpdmResult<ChallengeResult> {
        if slot_id >= MAX_CERT_SLOTS_SUPPORTED && slot_id != PROVISIONED_SLOT_ID {
            Err(SpdmError::InvalidParam)?;
        }
        self.reset_transcript_via_request_code(ReqRespCode::Challenge);

        if self.peer_capabilities().chal_cap() == 0 {
            Err(SpdmError::Unsupported)?;
        }
        if self.connection_state() < ConnectionState::Negotiated {
            Err(SpdmError::Unsupported)?;
        }
        if slot_id == PROVISIONED_SLOT_ID && !self.peer_cert_store.has_provisioned_chain() {
            Err(SpdmError::InvalidParam)?;
        }

        let connection_version = self.connection_version();
        let requester_nonce = match requester_nonce_in {
            Some(nonce) => *nonce,
            None => self.random_nonce().await?,
        };

        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;
        SpdmMsgHdr::new(
            connection_version,
            ReqRespCode::Challenge,
            slot_id,
            measurement_hash_type,
        )
        .encode(&mut msg_buf)
        .map_err(|_| SpdmError::DeviceError)?;
        encode_u8_slice(&requester_nonce, &mut msg_buf).map_err(|_| SpdmError::DeviceError)?;

        let mark = self.transcript.checkpoint(TranscriptContext::C);
        let result = self
            .exchange_challenge(
                slot_id,
                measurement_hash_type,
                requester_nonce,
                &mut msg_buf,
            )
            .await;
        if result.is_err() {
            let _ = self.transcript.rollback_to(TranscriptContext::C, mark);
        }
        result
    }

    async fn exchange_challenge(
        &mut self,
        slot_id: u8,
        measurement_hash_type: u8,
        requester_nonce: [u8; NONCE_LEN],
        msg_buf: &mut MessageBuf<'_>,
    ) -> SpdmResult<ChallengeResult> {
        let connection_version = self.connection_version();
        let req_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        self.transcript
            .append(TranscriptContext::C, req_bytes)
            .map_err(|_| SpdmError::SecurityViolation)?;

        self.send_message(None, msg_buf).await?;
        let rsp_hdr = self
            .receive_and_validate(None, msg_buf, connection_version, ReqRespCode::Challenge)
            .await?;

        // Attribute and slot mask checks
        let auth_attribute = rsp_hdr.param1();
        let slot_mask = rsp_hdr.param2();
        if connection_version >= SpdmVersion::V11 && slot_id == PROVISIONED_SLOT_ID {
            if auth_attribute & AUTH_ATTRIBUTE_SLOT_ID_MASK != 0x0F || slot_mask != 0 {
                Err(SpdmError::DeviceError)?;
            }
        } else {
            let attr_slot = if connection_version >= SpdmVersion::V11 {
                auth_attribute & AUTH_ATTRIBUTE_SLOT_ID_MASK
            } else {
                auth_attribute
            };
            if attr_slot != slot_id || slot_mask & (1 << slot_id) == 0 {
                Err(SpdmError::DeviceError)?;
            }
        }

        let mut_auth_requested = auth_attribute & AUTH_ATTRIBUTE_BASIC_MUT_AUTH_REQ != 0;
        if mut_auth_requested
            && (self.local_capability_flags().mut_auth_cap() == 0
                || self.peer_capabilities().mut_auth_cap() == 0)
        {
            Err(SpdmError::DeviceError)?;
        }

        let algorithms = self.state.connection_info.peer_algorithms();
        let hash_algo = algorithms.base_hash_algo_type()?;
        let asym_algo = algorithms.base_asym_algo_type()?;
        let hash_size = hash_algo.hash_size();
        let signature_size = asym_algo.signature_size();
        let meas_summary_hash_size = if self.peer_capabilities().meas_cap() == 0 {
            0
        } else {
            algorithms.measurement_summary_hash_size(measurement_hash_type)
        };

        // Fixed-size fields
        let mut cert_chain_hash = DigestBuf::default();
        for _ in 0..hash_size {
            cert_chain_hash.push(0);
        }
        decode_u8_slice(msg_buf, &mut cert_chain_hash[..]).map_err(|_| SpdmError::DeviceError)?;

        let mut responder_nonce = [0u8; NONCE_LEN];
        decode_u8_slice(msg_buf, &mut responder_nonce).map_err(|_| SpdmError::DeviceError)?;

        let mut measurement_summary_hash = DigestBuf::default();
        for _ in 0..meas_summary_hash_size {
            measurement_summary_hash.push(0);
        }
        decode_u8_slice(msg_buf, &mut measurement_summary_hash[..])
            .map_err(|_| SpdmError::DeviceError)?;

        let opaque_length = u16::decode(msg_buf).map_err(|_| SpdmError::DeviceError)?;
        if opaque_length as usize > MAX_OPAQUE_DATA_SIZE {
            Err(SpdmError::SecurityViolation)?;
        }
        if msg_buf.data_len() < opaque_length as usize + signature_size {
            Err(SpdmError::DeviceError)?;
        }

        // Certificate chain hash must match the chain in use
        let chain = self
            .peer_cert_store
            .cert_chain(slot_id)
            .map_err(|_| SpdmError::InvalidParam)?;
        let expected_chain_hash = self
            .crypto
            .hash(hash_algo, chain)
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;
        if !constant_time_eq(expected_chain_hash.as_slice(), cert_chain_hash.as_slice()) {
            warn!("challenge: certificate chain hash mismatch");
            Err(SpdmError::SecurityViolation)?;
        }

        // Response prefix (everything except the trailing signature)
        // joins transcript C before the signature is checked
        let rsp_prefix_len = size_of::<SpdmMsgHdr>()
            + hash_size
            + NONCE_LEN
            + meas_summary_hash_size
            + size_of::<u16>()
            + opaque_length as usize;
        let rsp_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        if rsp_bytes.len() < rsp_prefix_len + signature_size {
            Err(SpdmError::DeviceError)?;
        }
        self.transcript
            .append(TranscriptContext::C, &rsp_bytes[..rsp_prefix_len])
            .map_err(|_| SpdmError::SecurityViolation)?;

        msg_buf
            .pull_data(opaque_length as usize)
            .map_err(|_| SpdmError::DeviceError)?;
        let signature = msg_buf
            .data(signature_size)
            .map_err(|_| SpdmError::DeviceError)?;

        // Signature over transcript C
        let transcript_digest = self.transcript_hash(TranscriptContext::C).await?;
        let msg_hash = self
            .challenge_auth_signing_digest(connection_version, hash_algo, &transcript_digest)
            .await?;

        let chain = self
            .peer_cert_store
            .cert_chain(slot_id)
            .map_err(|_| SpdmError::InvalidParam)?;
        if self
            .crypto
            .asym_verify(asym_algo, chain, msg_hash.as_slice(), signature)
            .await
            .is_err()
        {
            warn!("challenge auth signature verification failed");
            Err(SpdmError::SecurityViolation)?;
        }

        if mut_auth_requested {
            debug!("responder requested basic mutual authentication");
            self.process_encapsulated_requests().await?;
        }

        debug!("challenge complete, connection authenticated");
        self.state
            .connection_info
            .set_state(ConnectionState::Authenticated);

        Ok(ChallengeResult {
            slot_mask,
            measurement_summary_hash: (meas_summary_hash_size > 0)
                .then_some(measurement_summary_hash),
            requester_nonce,
            responder_nonce,
        })
    }

    // For SPDM 1.2+ the signature covers
    // hash(combined_spdm_prefix || hash(transcript)); earlier versions
    // sign the transcript hash directly.
    pub(crate) async fn challenge_auth_signing_digest(
        &self,
        version: SpdmVersion,
        hash_algo: crate::protocol::algorithms::BaseHashAlgoType,
        transcript_digest: &DigestBuf,
    ) -> SpdmResult<DigestBuf> {
        if version < SpdmVersion::V12 {
            return Ok(transcript_digest.clone());
        }
        let context = spdm_signing_context(version, ReqRespCode::ChallengeAuth, false)?;
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
