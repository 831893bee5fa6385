// Licensed under the Apache-2.0 license

use super::{KeySchedule, KeyUpdateDirection, SessionError, SessionKeyType, SessionResult};
use crate::crypto::{DigestBuf, SharedSecret, SpdmCryptoProvider, AEAD_TAG_SIZE};
use crate::protocol::algorithms::{AeadCipherSuiteType, BaseHashAlgoType};
use crate::protocol::version::SpdmVersion;
use crate::transcript::{TranscriptBuf, TranscriptResult};
use bitfield::bitfield;
use zerocopy::{FromBytes, Immutable, IntoBytes};

const SESSION_TRANSCRIPT_K_SIZE: usize = 4096;

bitfield! {
    #[derive(FromBytes, IntoBytes, Immutable, Clone, Copy, Default)]
    #[repr(C)]
    pub struct SessionPolicy(u8);
    impl Debug;
    u8;
    pub termination_policy, set_termination_policy: 0, 0;
    reserved, _: 7, 1;
}

impl SessionPolicy {
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }
}

/// Session lifecycle.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SessionState {
    // Before KEY_EXCHANGE/PSK_EXCHANGE completes
    NotStarted,
    // Handshake keys derived, FINISH outstanding
    Handshaking,
    // Data keys derived, application phase
    Established,
    // After END_SESSION or teardown
    Terminated,
}

pub(crate) struct SessionInfo {
    pub(crate) session_id: u32,
    pub(crate) use_psk: bool,
    pub(crate) session_policy: SessionPolicy,
    pub(crate) session_state: SessionState,
    pub(crate) heartbeat_period: u8,
    pub(crate) mut_auth_requested: u8,
    key_schedule: KeySchedule,
    // Messages bound into TH1/TH2 for this session
    pub(crate) transcript_k: TranscriptBuf<SESSION_TRANSCRIPT_K_SIZE>,
}

impl SessionInfo {
    pub fn new(session_id: u32, use_psk: bool) -> Self {
        Self {
            session_id,
            use_psk,
            session_policy: SessionPolicy::default(),
            session_state: SessionState::NotStarted,
            heartbeat_period: 0,
            mut_auth_requested: 0,
            key_schedule: KeySchedule::default(),
            transcript_k: TranscriptBuf::new(),
        }
    }

    pub fn init(
        &mut self,
        session_policy: SessionPolicy,
        spdm_version: SpdmVersion,
        hash_algo: BaseHashAlgoType,
        aead_suite: AeadCipherSuiteType,
    ) {
        self.session_policy = session_policy;
        self.session_state = SessionState::NotStarted;
        self.key_schedule.init(spdm_version, hash_algo, aead_suite);
    }

    pub fn set_session_state(&mut self, state: SessionState) {
        self.session_state = state;
    }

    pub fn append_transcript_k(&mut self, data: &[u8]) -> TranscriptResult<()> {
        self.transcript_k.append(data)
    }

    /// Install the DHE shared secret or resolved PSK for key derivation.
    pub fn set_pre_master_secret(&mut self, secret: SharedSecret) {
        self.key_schedule.set_pre_master_secret(secret);
    }

    pub async fn generate_session_handshake_key(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        th1_transcript_hash: &[u8],
    ) -> SessionResult<()> {
        self.key_schedule
            .generate_session_handshake_key(crypto, th1_transcript_hash)
            .await
            .map_err(SessionError::KeySchedule)
    }

    pub async fn generate_session_data_key(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        th2_transcript_hash: &[u8],
    ) -> SessionResult<()> {
        self.key_schedule
            .generate_session_data_key(crypto, th2_transcript_hash)
            .await
            .map_err(SessionError::KeySchedule)
    }

    pub async fn compute_hmac(
        &self,
        crypto: &dyn SpdmCryptoProvider,
        session_key_type: SessionKeyType,
        data: &[u8],
    ) -> SessionResult<DigestBuf> {
        self.key_schedule
            .hmac(crypto, session_key_type, data)
            .await
            .map_err(SessionError::KeySchedule)
    }

    pub async fn create_update_data_key(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        direction: KeyUpdateDirection,
    ) -> SessionResult<()> {
        self.key_schedule
            .create_update_data_key(crypto, direction)
            .await
            .map_err(SessionError::KeySchedule)
    }

    pub fn activate_update_data_key(
        &mut self,
        direction: KeyUpdateDirection,
        use_new_key: bool,
    ) -> SessionResult<()> {
        self.key_schedule
            .activate_update_data_key(direction, use_new_key)
            .map_err(SessionError::KeySchedule)
    }

    pub fn key_epoch(&self, direction: KeyUpdateDirection) -> u32 {
        self.key_schedule.key_epoch(direction)
    }

    pub fn update_pending(&self, direction: KeyUpdateDirection) -> bool {
        self.key_schedule.update_pending(direction)
    }

    /// Requester-to-responder traffic: handshake keys until FINISH
    /// completes, data keys afterwards.
    pub async fn encrypt_secure_message(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        aad_data: &[u8],
        plaintext_message: &[u8],
        encrypted_message: &mut [u8],
    ) -> SessionResult<(usize, [u8; AEAD_TAG_SIZE])> {
        let session_key_type = match self.session_state {
            SessionState::NotStarted | SessionState::Terminated => {
                return Err(SessionError::InvalidState)
            }
            SessionState::Handshaking => SessionKeyType::RequestHandshakeEncDecKey,
            SessionState::Established => SessionKeyType::RequestDataEncDecKey,
        };

        self.key_schedule
            .encrypt_message(
                crypto,
                session_key_type,
                aad_data,
                plaintext_message,
                encrypted_message,
            )
            .await
            .map_err(SessionError::KeySchedule)
    }

    /// Responder-to-requester traffic.
    pub async fn decrypt_secure_message(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        aad_data: &[u8],
        encrypted_message: &[u8],
        tag: [u8; AEAD_TAG_SIZE],
        plaintext_message: &mut [u8],
    ) -> SessionResult<usize> {
        let session_key_type = match self.session_state {
            SessionState::NotStarted | SessionState::Terminated => {
                return Err(SessionError::InvalidState)
            }
            SessionState::Handshaking => SessionKeyType::ResponseHandshakeEncDecKey,
            SessionState::Established => SessionKeyType::ResponseDataEncDecKey,
        };

        self.key_schedule
            .decrypt_message(
                crypto,
                session_key_type,
                aad_data,
                encrypted_message,
                tag,
                plaintext_message,
            )
            .await
            .map_err(SessionError::KeySchedule)
    }
}
