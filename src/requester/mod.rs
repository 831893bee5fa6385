// Licensed under the Apache-2.0 license

//! Requester context and per-request procedures.
//!
//! Every procedure follows the same shape: precondition checks,
//! transcript reset by request code, build + record + send, receive,
//! ERROR delegation, validation, cryptographic checks, then commit
//! (advance state) or roll back tentative transcript/session state.

pub mod algorithms;
pub mod capabilities;
pub mod certificate;
pub mod challenge;
pub mod digests;
pub mod encapsulated;
pub mod end_session;
pub mod error_rsp;
pub mod finish;
pub mod heartbeat;
pub mod key_exchange;
pub mod key_update;
pub mod psk_exchange;
pub mod version;


use crate::cert_store::{
    CertChainValidator, LocalCertStore, PeerCertStore, MAX_CERT_SLOTS_SUPPORTED,
};
use crate::codec::{Codec, MessageBuf};
use crate::crypto::{DigestBuf, SpdmCryptoProvider};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::algorithms::LocalDeviceAlgorithms;
use crate::protocol::capabilities::{CapabilityFlags, DeviceCapabilities};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::protocol::version::{validate_supported_versions, SpdmVersion};
use crate::session::{SessionManager, SessionState};
use crate::state::{ConnectionState, State};
use crate::transcript::{Transcript, TranscriptContext};
use crate::transport::{SpdmTransport, TransportError};
use crate::time::SpdmTimer;
use crate::session::SessionError;
use crate::session::key_schedule::KeyScheduleError;
use crate::crypto::CryptoError;

pub use crate::session::info::SessionState as SpdmSessionState;

pub(crate) const MAX_SPDM_MSG_SIZE: usize = 4096;
pub(crate) const MAX_OPAQUE_DATA_SIZE: usize = 1024;
pub(crate) const PSK_CONTEXT_LEN: usize = 32;
pub const MAX_PSK_HINT_SIZE: usize = 16;

const DEFAULT_SUPPORTED_VERSIONS: &[SpdmVersion] = &[SpdmVersion::V11, SpdmVersion::V12];

/// Embedding-supplied configuration for a requester context.
pub struct RequesterConfig<'a> {
    pub supported_versions: &'a [SpdmVersion],
    pub local_capabilities: DeviceCapabilities,
    pub local_algorithms: LocalDeviceAlgorithms,
    /// Hint identifying the pre-shared key for PSK_EXCHANGE.
    pub psk_hint: Option<&'a [u8]>,
    /// Out-of-band provisioned peer chain, addressed as slot 0xFF.
    pub provisioned_peer_cert_chain: Option<&'a [u8]>,
    /// Local chains answering encapsulated mutual-auth requests.
    pub local_cert_chains: [Option<&'a [u8]>; MAX_CERT_SLOTS_SUPPORTED as usize],
    /// Extra attempts after the first on `NoResponse`.
    pub retry_times: u8,
    /// ResponseNotReady polling budget per exchange.
    pub max_rnr_polls: u8,
}

impl Default for RequesterConfig<'_> {
    fn default() -> Self {
        Self {
            supported_versions: DEFAULT_SUPPORTED_VERSIONS,
            local_capabilities: DeviceCapabilities {
                ct_exponent: 0,
                flags: CapabilityFlags::default(),
                data_transfer_size: MAX_SPDM_MSG_SIZE as u32,
                max_spdm_msg_size: MAX_SPDM_MSG_SIZE as u32,
            },
            local_algorithms: LocalDeviceAlgorithms::default(),
            psk_hint: None,
            provisioned_peer_cert_chain: None,
            local_cert_chains: [None; MAX_CERT_SLOTS_SUPPORTED as usize],
            retry_times: 1,
            max_rnr_polls: 2,
        }
    }
}

pub struct RequesterContext<'a> {
    transport: &'a mut dyn SpdmTransport,
    pub(crate) crypto: &'a dyn SpdmCryptoProvider,
    pub(crate) timer: &'a dyn SpdmTimer,
    pub(crate) cert_validator: &'a dyn CertChainValidator,
    pub(crate) supported_versions: &'a [SpdmVersion],
    pub(crate) state: State,
    pub(crate) local_capabilities: DeviceCapabilities,
    pub(crate) local_algorithms: LocalDeviceAlgorithms,
    pub(crate) transcript: Transcript,
    pub(crate) session_mgr: SessionManager,
    pub(crate) peer_cert_store: PeerCertStore<'a>,
    pub(crate) local_cert_store: LocalCertStore<'a>,
    pub(crate) psk_hint: Option<&'a [u8]>,
    pub(crate) retry_times: u8,
    pub(crate) max_rnr_polls: u8,
}

impl<'a> RequesterContext<'a> {
    pub fn new(
        transport: &'a mut dyn SpdmTransport,
        crypto: &'a dyn SpdmCryptoProvider,
        timer: &'a dyn SpdmTimer,
        cert_validator: &'a dyn CertChainValidator,
        config: RequesterConfig<'a>,
    ) -> SpdmResult<Self> {
        validate_supported_versions(config.supported_versions)?;
        if let Some(psk_hint) = config.psk_hint {
            if psk_hint.is_empty() || psk_hint.len() > MAX_PSK_HINT_SIZE {
                Err(SpdmError::InvalidParam)?;
            }
        }
        if let Some(chain) = config.provisioned_peer_cert_chain {
            if chain.is_empty() {
                Err(SpdmError::InvalidParam)?;
            }
        }

        Ok(Self {
            transport,
            crypto,
            timer,
            cert_validator,
            supported_versions: config.supported_versions,
            state: State::new(),
            local_capabilities: config.local_capabilities,
            local_algorithms: config.local_algorithms,
            transcript: Transcript::new(),
            session_mgr: SessionManager::new(),
            peer_cert_store: PeerCertStore::new(config.provisioned_peer_cert_chain),
            local_cert_store: LocalCertStore::new(config.local_cert_chains),
            psk_hint: config.psk_hint,
            retry_times: config.retry_times,
            max_rnr_polls: config.max_rnr_polls,
        })
    }

    /// Tear down all connection and session state.
    pub fn reset(&mut self) {
        self.state.reset();
        self.transcript.reset_all();
        self.session_mgr.reset();
        self.peer_cert_store.drop_retrieval();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_info.state()
    }

    pub fn connection_version(&self) -> SpdmVersion {
        self.state.connection_info.version_number()
    }

    pub fn session_state(&self, session_id: u32) -> Option<SessionState> {
        self.session_mgr
            .session_info(session_id)
            .ok()
            .map(|info| info.session_state)
    }

    pub fn session_heartbeat_period(&self, session_id: u32) -> Option<u8> {
        self.session_mgr
            .session_info(session_id)
            .ok()
            .map(|info| info.heartbeat_period)
    }

    pub(crate) fn peer_capabilities(&self) -> CapabilityFlags {
        self.state.connection_info.peer_capabilities().flags
    }

    pub(crate) fn local_capability_flags(&self) -> CapabilityFlags {
        self.local_capabilities.flags
    }

    /// Transcript resets keyed by the request about to be sent, so a
    /// retried request reproduces an identical transcript.
    pub(crate) fn reset_transcript_via_request_code(&mut self, request_code: ReqRespCode) {
        match request_code {
            ReqRespCode::GetVersion => self.transcript.reset_all(),
            ReqRespCode::GetCapabilities | ReqRespCode::NegotiateAlgorithms => {
                self.transcript.reset(TranscriptContext::B);
                self.transcript.reset(TranscriptContext::C);
            }
            ReqRespCode::GetDigests => self.transcript.reset(TranscriptContext::B),
            ReqRespCode::Challenge => self.transcript.reset(TranscriptContext::C),
            _ => {}
        }
    }

    pub(crate) fn prepare_request_buffer(&self, buf: &mut MessageBuf<'_>) -> SpdmResult<()> {
        buf.reset();
        buf.reserve(self.transport.header_size())
            .map_err(|_| SpdmError::DeviceError)
    }

    pub(crate) async fn random_nonce(
        &self,
    ) -> SpdmResult<[u8; crate::protocol::common::NONCE_LEN]> {
        let mut nonce = [0u8; crate::protocol::common::NONCE_LEN];
        self.crypto
            .random(&mut nonce)
            .await
            .map_err(|_| SpdmError::DeviceError)?;
        Ok(nonce)
    }

    /// Send a request, sealing it into the secured-message format when
    /// it belongs to a session.
    pub(crate) async fn send_message(
        &mut self,
        session_id: Option<u32>,
        req: &mut MessageBuf<'_>,
    ) -> SpdmResult<()> {
        match session_id {
            None => self
                .transport
                .send_request(None, req)
                .await
                .map_err(map_transport_error),
            Some(id) => {
                let crypto = self.crypto;
                let mut secure_storage = [0u8; MAX_SPDM_MSG_SIZE + 64];
                let mut secure_buf = MessageBuf::new(&mut secure_storage);
                secure_buf
                    .reserve(self.transport.header_size())
                    .map_err(|_| SpdmError::DeviceError)?;
                let app_data = req.message_data().map_err(|_| SpdmError::DeviceError)?;
                self.session_mgr
                    .encode_secure_message(crypto, id, app_data, &mut secure_buf)
                    .await
                    .map_err(map_session_error)?;
                self.transport
                    .send_request(Some(id), &mut secure_buf)
                    .await
                    .map_err(map_transport_error)
            }
        }
    }

    /// Receive a response, opening the secured-message envelope for
    /// session traffic.
    pub(crate) async fn receive_message(
        &mut self,
        session_id: Option<u32>,
        rsp: &mut MessageBuf<'_>,
    ) -> SpdmResult<()> {
        match session_id {
            None => {
                rsp.reset();
                self.transport
                    .receive_response(rsp)
                    .await
                    .map_err(map_transport_error)
            }
            Some(id) => {
                let crypto = self.crypto;
                let mut secure_storage = [0u8; MAX_SPDM_MSG_SIZE + 64];
                let mut secure_buf = MessageBuf::new(&mut secure_storage);
                self.transport
                    .receive_response(&mut secure_buf)
                    .await
                    .map_err(map_transport_error)?;
                let mut app_data = [0u8; MAX_SPDM_MSG_SIZE];
                let app_len = self
                    .session_mgr
                    .decode_secure_message(crypto, id, &mut secure_buf, &mut app_data)
                    .await
                    .map_err(map_session_error)?;
                rsp.reset();
                rsp.put_data(app_len).map_err(|_| SpdmError::DeviceError)?;
                rsp.data_mut(app_len)
                    .map_err(|_| SpdmError::DeviceError)?
                    .copy_from_slice(&app_data[..app_len]);
                Ok(())
            }
        }
    }

    /// Receive a reply, delegate ERROR frames, and validate version and
    /// response code. Returns the (possibly refreshed) response header
    /// with the buffer positioned after it.
    pub(crate) async fn receive_and_validate(
        &mut self,
        session_id: Option<u32>,
        rsp: &mut MessageBuf<'_>,
        request_version: SpdmVersion,
        request_code: ReqRespCode,
    ) -> SpdmResult<SpdmMsgHdr> {
        self.receive_message(session_id, rsp).await?;

        let mut rsp_hdr = SpdmMsgHdr::decode(rsp).map_err(|_| SpdmError::DeviceError)?;
        if rsp_hdr.version().ok() != Some(request_version) {
            Err(SpdmError::DeviceError)?;
        }
        if rsp_hdr.req_resp_code().ok() == Some(ReqRespCode::Error) {
            rsp_hdr = self
                .handle_error_response(session_id, request_code, rsp_hdr, rsp)
                .await?;
            if rsp_hdr.version().ok() != Some(request_version) {
                Err(SpdmError::DeviceError)?;
            }
        }
        if rsp_hdr.req_resp_code().ok() != Some(request_code.response_code()?) {
            Err(SpdmError::DeviceError)?;
        }
        Ok(rsp_hdr)
    }

    /// Transcript hash for a connection-level context under the
    /// negotiated hash algorithm.
    pub(crate) async fn transcript_hash(
        &self,
        context: TranscriptContext,
    ) -> SpdmResult<DigestBuf> {
        let hash_algo = self
            .state
            .connection_info
            .peer_algorithms()
            .base_hash_algo_type()?;
        self.transcript
            .hash(context, self.crypto, hash_algo)
            .await
            .map_err(|_| SpdmError::SecurityViolation)
    }

    /// Hash of a session's K transcript.
    pub(crate) async fn session_transcript_hash(
        &self,
        session_id: u32,
    ) -> SpdmResult<DigestBuf> {
        let hash_algo = self
            .state
            .connection_info
            .peer_algorithms()
            .base_hash_algo_type()?;
        let session_info = self
            .session_mgr
            .session_info(session_id)
            .map_err(|_| SpdmError::Unsupported)?;
        self.crypto
            .hash(hash_algo, session_info.transcript_k.as_slice())
            .await
            .map_err(|_| SpdmError::SecurityViolation)
    }
}

pub(crate) fn map_transport_error(err: TransportError) -> SpdmError {
    match err {
        TransportError::Timeout => SpdmError::Timeout,
        _ => SpdmError::DeviceError,
    }
}

pub(crate) fn map_session_error(err: SessionError) -> SpdmError {
    match err {
        SessionError::KeySchedule(KeyScheduleError::Crypto(CryptoError::AeadTagMismatch)) => {
            SpdmError::SecurityViolation
        }
        _ => SpdmError::DeviceError,
    }
}
