// Licensed under the Apache-2.0 license

//! Basic mutual authentication: the responder authenticates this
//! requester through encapsulated requests carried inside
//! GET_ENCAPSULATED_REQUEST / DELIVER_ENCAPSULATED_RESPONSE. The
//! requester answers embedded GET_DIGESTS, GET_CERTIFICATE and
//! CHALLENGE against its local certificate chains; the encapsulated
//! exchanges are bound into the M1M2 transcript that the embedded
//! CHALLENGE_AUTH signature covers.

use crate::codec::{encode_u8_slice, Codec, CommonCodec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::common::{
    spdm_signing_context, ReqRespCode, SpdmMsgHdr, SPDM_SIGNING_CONTEXT_LEN,
};
use crate::protocol::version::SpdmVersion;
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::transcript::TranscriptContext;
use core::mem::size_of;
use log::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

// ENCAPSULATED_RESPONSE_ACK payload types
const ACK_PAYLOAD_TYPE_ABSENT: u8 = 0;
const ACK_PAYLOAD_TYPE_PRESENT: u8 = 1;

// Bound on encapsulated rounds within one mutual-auth flow
const MAX_ENCAP_ROUNDS: usize = 8;

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C)]
struct EncapCertificateReq {
    offset: u16,
    length: u16,
}

impl CommonCodec for EncapCertificateReq {}

impl<'a> RequesterContext<'a> {
    /// Run the encapsulated-request loop until the responder reports
    /// it is done authenticating us.
    pub(crate) async fn process_encapsulated_requests(&mut self) -> SpdmResult<()> {
        if self.local_capability_flags().encap_cap() == 0
            || self.peer_capabilities().encap_cap() == 0
        {
            Err(SpdmError::Unsupported)?;
        }
        self.transcript.reset(TranscriptContext::M1M2);

        let connection_version = self.connection_version();
        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;
        SpdmMsgHdr::new(connection_version, ReqRespCode::GetEncapsulatedRequest, 0, 0)
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;

        self.send_message(None, &mut msg_buf).await?;
        let rsp_hdr = self
            .receive_and_validate(
                None,
                &mut msg_buf,
                connection_version,
                ReqRespCode::GetEncapsulatedRequest,
            )
            .await?;
        let mut request_id = rsp_hdr.param1();

        let mut embedded_req = [0u8; MAX_SPDM_MSG_SIZE];
        let mut embedded_req_len = msg_buf.data_len();
        embedded_req[..embedded_req_len].copy_from_slice(
            msg_buf
                .data(embedded_req_len)
                .map_err(|_| SpdmError::DeviceError)?,
        );

        for _ in 0..MAX_ENCAP_ROUNDS {
            if embedded_req_len == 0 {
                Err(SpdmError::DeviceError)?;
            }

            let mut embedded_rsp_storage = [0u8; MAX_SPDM_MSG_SIZE];
            let mut embedded_rsp = MessageBuf::new(&mut embedded_rsp_storage);
            self.handle_encapsulated_request(
                &embedded_req[..embedded_req_len],
                &mut embedded_rsp,
            )
            .await?;

            // DELIVER_ENCAPSULATED_RESPONSE with the embedded response
            self.prepare_request_buffer(&mut msg_buf)?;
            SpdmMsgHdr::new(
                connection_version,
                ReqRespCode::DeliverEncapsulatedResponse,
                request_id,
                0,
            )
            .encode(&mut msg_buf)
            .map_err(|_| SpdmError::DeviceError)?;
            encode_u8_slice(
                embedded_rsp
                    .message_data()
                    .map_err(|_| SpdmError::DeviceError)?,
                &mut msg_buf,
            )
            .map_err(|_| SpdmError::DeviceError)?;

            self.send_message(None, &mut msg_buf).await?;
            let ack_hdr = self
                .receive_and_validate(
                    None,
                    &mut msg_buf,
                    connection_version,
                    ReqRespCode::DeliverEncapsulatedResponse,
                )
                .await?;
            if ack_hdr.param1() != request_id {
                Err(SpdmError::DeviceError)?;
            }

            match ack_hdr.param2() {
                ACK_PAYLOAD_TYPE_ABSENT => {
                    debug!("mutual authentication complete");
                    return Ok(());
                }
                ACK_PAYLOAD_TYPE_PRESENT => {
                    request_id = ack_hdr.param1();
                    embedded_req_len = msg_buf.data_len();
                    embedded_req[..embedded_req_len].copy_from_slice(
                        msg_buf
                            .data(embedded_req_len)
                            .map_err(|_| SpdmError::DeviceError)?,
                    );
                }
                _ => Err(SpdmError::DeviceError)?,
            }
        }

        warn!("encapsulated request loop exceeded its round budget");
        Err(SpdmError::DeviceError)
    }

    // Answer one embedded request against the local certificate chains.
    async fn handle_encapsulated_request(
        &mut self,
        embedded_req: &[u8],
        rsp: &mut MessageBuf<'_>,
    ) -> SpdmResult<()> {
        let connection_version = self.connection_version();
        let hash_algo = self
            .state
            .connection_info
            .peer_algorithms()
            .base_hash_algo_type()?;

        if embedded_req.len() < size_of::<SpdmMsgHdr>() {
            Err(SpdmError::DeviceError)?;
        }
        let mut req_storage = [0u8; MAX_SPDM_MSG_SIZE];
        req_storage[..embedded_req.len()].copy_from_slice(embedded_req);
        let mut req_buf = MessageBuf::new(&mut req_storage);
        req_buf
            .put_data(embedded_req.len())
            .map_err(|_| SpdmError::DeviceError)?;
        let req_hdr = SpdmMsgHdr::decode(&mut req_buf).map_err(|_| SpdmError::DeviceError)?;
        if req_hdr.version().ok() != Some(connection_version) {
            Err(SpdmError::DeviceError)?;
        }

        self.transcript
            .append(TranscriptContext::M1M2, embedded_req)
            .map_err(|_| SpdmError::SecurityViolation)?;

        match req_hdr.req_resp_code()? {
            ReqRespCode::GetDigests => {
                let slot_mask = self.local_cert_store.slot_mask();
                SpdmMsgHdr::new(connection_version, ReqRespCode::Digests, 0, slot_mask)
                    .encode(rsp)
                    .map_err(|_| SpdmError::DeviceError)?;
                for slot_id in 0..8u8 {
                    if slot_mask & (1 << slot_id) != 0 {
                        let chain = self
                            .local_cert_store
                            .cert_chain(slot_id)
                            .map_err(|_| SpdmError::DeviceError)?;
                        let digest = self
                            .crypto
                            .hash(hash_algo, chain)
                            .await
                            .map_err(|_| SpdmError::SecurityViolation)?;
                        encode_u8_slice(digest.as_slice(), rsp)
                            .map_err(|_| SpdmError::DeviceError)?;
                    }
                }
            }
            ReqRespCode::GetCertificate => {
                let slot_id = req_hdr.param1() & 0x0F;
                let window =
                    EncapCertificateReq::decode(&mut req_buf).map_err(|_| SpdmError::DeviceError)?;
                let chain = self
                    .local_cert_store
                    .cert_chain(slot_id)
                    .map_err(|_| SpdmError::DeviceError)?;
                let offset = window.offset as usize;
                if offset >= chain.len() {
                    Err(SpdmError::DeviceError)?;
                }
                let portion_length = core::cmp::min(window.length as usize, chain.len() - offset);
                let remainder_length = chain.len() - offset - portion_length;

                SpdmMsgHdr::new(connection_version, ReqRespCode::Certificate, slot_id, 0)
                    .encode(rsp)
                    .map_err(|_| SpdmError::DeviceError)?;
                (portion_length as u16)
                    .encode(rsp)
                    .map_err(|_| SpdmError::DeviceError)?;
                (remainder_length as u16)
                    .encode(rsp)
                    .map_err(|_| SpdmError::DeviceError)?;
                encode_u8_slice(&chain[offset..offset + portion_length], rsp)
                    .map_err(|_| SpdmError::DeviceError)?;
            }
            ReqRespCode::Challenge => {
                self.answer_encapsulated_challenge(req_hdr, rsp).await?;
                // The signature itself stays out of M1M2
                return Ok(());
            }
            _ => Err(SpdmError::DeviceError)?,
        }

        self.transcript
            .append(
                TranscriptContext::M1M2,
                rsp.message_data().map_err(|_| SpdmError::DeviceError)?,
            )
            .map_err(|_| SpdmError::SecurityViolation)?;
        Ok(())
    }

    // Embedded CHALLENGE: sign the M1M2 transcript with the requester
    // key of the challenged slot.
    async fn answer_encapsulated_challenge(
        &mut self,
        req_hdr: SpdmMsgHdr,
        rsp: &mut MessageBuf<'_>,
    ) -> SpdmResult<()> {
        let connection_version = self.connection_version();
        let algorithms = self.state.connection_info.peer_algorithms();
        let hash_algo = algorithms.base_hash_algo_type()?;
        let req_asym_algo = algorithms.req_base_asym_algo_type()?;

        let slot_id = req_hdr.param1() & 0x0F;
        let chain = self
            .local_cert_store
            .cert_chain(slot_id)
            .map_err(|_| SpdmError::DeviceError)?;
        let chain_digest = self
            .crypto
            .hash(hash_algo, chain)
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;
        let nonce = self.random_nonce().await?;

        SpdmMsgHdr::new(
            connection_version,
            ReqRespCode::ChallengeAuth,
            slot_id,
            1 << slot_id,
        )
        .encode(rsp)
        .map_err(|_| SpdmError::DeviceError)?;
        encode_u8_slice(chain_digest.as_slice(), rsp).map_err(|_| SpdmError::DeviceError)?;
        encode_u8_slice(&nonce, rsp).map_err(|_| SpdmError::DeviceError)?;
        // No measurement summary hash; zero-length opaque data
        0u16.encode(rsp).map_err(|_| SpdmError::DeviceError)?;

        // Response joins M1M2 up to (not including) the signature
        self.transcript
            .append(
                TranscriptContext::M1M2,
                rsp.message_data().map_err(|_| SpdmError::DeviceError)?,
            )
            .map_err(|_| SpdmError::SecurityViolation)?;

        let transcript_digest = self
            .transcript
            .hash(TranscriptContext::M1M2, self.crypto, hash_algo)
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;
        let msg_hash = if connection_version < SpdmVersion::V12 {
            transcript_digest
        } else {
            let context = spdm_signing_context(connection_version, ReqRespCode::ChallengeAuth, true)?;
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
                .map_err(|_| SpdmError::SecurityViolation)?
        };

        let mut signature = [0u8; crate::crypto::MAX_SIGNATURE_SIZE];
        let sig_len = self
            .crypto
            .asym_sign(req_asym_algo, slot_id, msg_hash.as_slice(), &mut signature)
            .await
            .map_err(|_| SpdmError::SecurityViolation)?;
        if sig_len != req_asym_algo.signature_size() {
            Err(SpdmError::SecurityViolation)?;
        }
        encode_u8_slice(&signature[..sig_len], rsp).map_err(|_| SpdmError::DeviceError)?;
        Ok(())
    }
}
