// Licensed under the Apache-2.0 license

//! SPDM key schedule.
//! Secret derivation and management for SPDM secure sessions: the
//! handshake/data secret chains keyed by TH1/TH2, per-direction AEAD
//! sequence numbers and the key-update ratchet.

use crate::crypto::{
    AeadKey, CryptoError, DigestBuf, HashSecret, SharedSecret, SpdmCryptoProvider, AEAD_TAG_SIZE,
    MAX_AEAD_IV_SIZE,
};
use crate::protocol::algorithms::{AeadCipherSuiteType, BaseHashAlgoType};
use crate::protocol::version::SpdmVersion;
use arrayvec::ArrayVec;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum KeyScheduleError {
    BufferTooSmall,
    InvalidSessionKeyType,
    PreMasterSecretNotFound,
    HandshakeSecretNotFound,
    MasterSecretNotFound,
    DataSecretNotFound,
    NoPendingKeyUpdate,
    Crypto(CryptoError),
}

pub type KeyScheduleResult<T> = Result<T, KeyScheduleError>;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SessionKeyType {
    RequestFinishedKey,
    ResponseFinishedKey,
    RequestHandshakeEncDecKey,
    ResponseHandshakeEncDecKey,
    RequestDataEncDecKey,
    ResponseDataEncDecKey,
}

/// Direction of a data-key rotation.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum KeyUpdateDirection {
    Requester,
    Responder,
}

#[derive(Default)]
pub(crate) struct KeySchedule {
    spdm_version: SpdmVersion,
    hash_algo: Option<BaseHashAlgoType>,
    aead_suite: Option<AeadCipherSuiteType>,
    master_secret_ctx: MasterSecretCtx,
    handshake_secret_ctx: HandshakeSecretCtx,
    data_secret_ctx: DataSecretCtx,
    export_master_secret: Option<HashSecret>,
}

impl KeySchedule {
    const MAX_BIN_STR_LEN: usize = 128;

    pub fn init(
        &mut self,
        spdm_version: SpdmVersion,
        hash_algo: BaseHashAlgoType,
        aead_suite: AeadCipherSuiteType,
    ) {
        self.spdm_version = spdm_version;
        self.hash_algo = Some(hash_algo);
        self.aead_suite = Some(aead_suite);
    }

    /// Install the DHE shared secret or the resolved PSK.
    pub fn set_pre_master_secret(&mut self, secret: SharedSecret) {
        self.master_secret_ctx.pre_master_secret = Some(secret);
    }

    pub async fn generate_session_handshake_key(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        th1_transcript_hash: &[u8],
    ) -> KeyScheduleResult<()> {
        self.generate_handshake_secret(crypto).await?;
        self.generate_req_rsp_handshake_secret(crypto, th1_transcript_hash)
            .await?;
        self.generate_req_rsp_finished_key(crypto).await
    }

    pub async fn generate_session_data_key(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        th2_transcript_hash: &[u8],
    ) -> KeyScheduleResult<()> {
        self.generate_master_secret(crypto).await?;
        self.generate_req_rsp_data_secret(crypto, th2_transcript_hash)
            .await?;
        self.generate_export_master_secret(crypto, th2_transcript_hash)
            .await
    }

    pub fn data_keys_ready(&self) -> bool {
        self.data_secret_ctx.request_data_secret.is_some()
            && self.data_secret_ctx.response_data_secret.is_some()
    }

    /// Secret exported to the embedding for out-of-band key derivation.
    pub fn export_master_secret(&self) -> Option<&HashSecret> {
        self.export_master_secret.as_ref()
    }

    /// HMAC keyed by a finished key (FINISH/PSK verify_data).
    pub async fn hmac(
        &self,
        crypto: &dyn SpdmCryptoProvider,
        key_type: SessionKeyType,
        data: &[u8],
    ) -> KeyScheduleResult<DigestBuf> {
        let key = match key_type {
            SessionKeyType::RequestFinishedKey => self
                .handshake_secret_ctx
                .request_finished_key
                .as_ref()
                .ok_or(KeyScheduleError::HandshakeSecretNotFound)?,
            SessionKeyType::ResponseFinishedKey => self
                .handshake_secret_ctx
                .response_finished_key
                .as_ref()
                .ok_or(KeyScheduleError::HandshakeSecretNotFound)?,
            _ => Err(KeyScheduleError::InvalidSessionKeyType)?,
        };

        crypto
            .hmac(self.hash_algo()?, key.as_slice(), data)
            .await
            .map_err(KeyScheduleError::Crypto)
    }

    pub async fn encrypt_message(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        session_key_type: SessionKeyType,
        aad_data: &[u8],
        plaintext_message: &[u8],
        encrypted_message: &mut [u8],
    ) -> KeyScheduleResult<(usize, [u8; AEAD_TAG_SIZE])> {
        let sequence_num = self.sequence_number(session_key_type)?;
        let (key, nonce) = self
            .message_key_and_nonce(crypto, session_key_type, sequence_num)
            .await?;

        let result = crypto
            .aead_seal(
                self.aead_suite()?,
                key.as_slice(),
                &nonce,
                aad_data,
                plaintext_message,
                encrypted_message,
            )
            .await
            .map_err(KeyScheduleError::Crypto)?;

        self.increment_sequence_number(session_key_type)?;
        Ok(result)
    }

    pub async fn decrypt_message(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        session_key_type: SessionKeyType,
        aad_data: &[u8],
        encrypted_msg: &[u8],
        tag: [u8; AEAD_TAG_SIZE],
        plaintext_msg: &mut [u8],
    ) -> KeyScheduleResult<usize> {
        let sequence_num = self.sequence_number(session_key_type)?;
        let (key, nonce) = self
            .message_key_and_nonce(crypto, session_key_type, sequence_num)
            .await?;

        let decrypted_size = crypto
            .aead_open(
                self.aead_suite()?,
                key.as_slice(),
                &nonce,
                aad_data,
                encrypted_msg,
                &tag,
                plaintext_msg,
            )
            .await
            .map_err(KeyScheduleError::Crypto)?;

        self.increment_sequence_number(session_key_type)?;
        Ok(decrypted_size)
    }

    /// Ratchet the data secret of one direction.
    ///
    /// The new secret becomes current immediately (the peer switches
    /// as soon as it processes KEY_UPDATE); the old secret and its
    /// sequence number are retained for rollback until
    /// `activate_update_data_key` commits or reverts.
    pub async fn create_update_data_key(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        direction: KeyUpdateDirection,
    ) -> KeyScheduleResult<()> {
        let hash_algo = self.hash_algo()?;
        let hash_size = hash_algo.hash_size();
        let bin_str9 = self.bin_concat(SpdmBinStr::BinStr9, hash_size as u16, None)?;

        let (current, seq) = match direction {
            KeyUpdateDirection::Requester => (
                self.data_secret_ctx
                    .request_data_secret
                    .take()
                    .ok_or(KeyScheduleError::DataSecretNotFound)?,
                self.data_secret_ctx.request_sequence_num,
            ),
            KeyUpdateDirection::Responder => (
                self.data_secret_ctx
                    .response_data_secret
                    .take()
                    .ok_or(KeyScheduleError::DataSecretNotFound)?,
                self.data_secret_ctx.response_sequence_num,
            ),
        };

        let next = hkdf_expand(
            crypto,
            hash_algo,
            current.as_slice(),
            bin_str9.as_slice(),
            hash_size,
        )
        .await?;

        let backup = DataSecretBackup {
            secret: current,
            sequence_num: seq,
        };
        match direction {
            KeyUpdateDirection::Requester => {
                self.data_secret_ctx.request_data_secret = Some(next);
                self.data_secret_ctx.request_sequence_num = 0;
                self.data_secret_ctx.request_backup = Some(backup);
            }
            KeyUpdateDirection::Responder => {
                self.data_secret_ctx.response_data_secret = Some(next);
                self.data_secret_ctx.response_sequence_num = 0;
                self.data_secret_ctx.response_backup = Some(backup);
            }
        }
        Ok(())
    }

    /// Commit (`use_new_key`) or roll back a pending data-key rotation.
    pub fn activate_update_data_key(
        &mut self,
        direction: KeyUpdateDirection,
        use_new_key: bool,
    ) -> KeyScheduleResult<()> {
        match direction {
            KeyUpdateDirection::Requester => {
                let backup = self
                    .data_secret_ctx
                    .request_backup
                    .take()
                    .ok_or(KeyScheduleError::NoPendingKeyUpdate)?;
                if use_new_key {
                    self.data_secret_ctx.request_epoch += 1;
                } else {
                    self.data_secret_ctx.request_data_secret = Some(backup.secret);
                    self.data_secret_ctx.request_sequence_num = backup.sequence_num;
                }
            }
            KeyUpdateDirection::Responder => {
                let backup = self
                    .data_secret_ctx
                    .response_backup
                    .take()
                    .ok_or(KeyScheduleError::NoPendingKeyUpdate)?;
                if use_new_key {
                    self.data_secret_ctx.response_epoch += 1;
                } else {
                    self.data_secret_ctx.response_data_secret = Some(backup.secret);
                    self.data_secret_ctx.response_sequence_num = backup.sequence_num;
                }
            }
        }
        Ok(())
    }

    pub fn update_pending(&self, direction: KeyUpdateDirection) -> bool {
        match direction {
            KeyUpdateDirection::Requester => self.data_secret_ctx.request_backup.is_some(),
            KeyUpdateDirection::Responder => self.data_secret_ctx.response_backup.is_some(),
        }
    }

    /// Number of committed key rotations in a direction.
    pub fn key_epoch(&self, direction: KeyUpdateDirection) -> u32 {
        match direction {
            KeyUpdateDirection::Requester => self.data_secret_ctx.request_epoch,
            KeyUpdateDirection::Responder => self.data_secret_ctx.response_epoch,
        }
    }

    fn hash_algo(&self) -> KeyScheduleResult<BaseHashAlgoType> {
        self.hash_algo
            .ok_or(KeyScheduleError::InvalidSessionKeyType)
    }

    fn aead_suite(&self) -> KeyScheduleResult<AeadCipherSuiteType> {
        self.aead_suite
            .ok_or(KeyScheduleError::InvalidSessionKeyType)
    }

    fn sequence_number(&self, session_key_type: SessionKeyType) -> KeyScheduleResult<u64> {
        match session_key_type {
            SessionKeyType::RequestHandshakeEncDecKey => {
                Ok(self.handshake_secret_ctx.request_sequence_num)
            }
            SessionKeyType::ResponseHandshakeEncDecKey => {
                Ok(self.handshake_secret_ctx.response_sequence_num)
            }
            SessionKeyType::RequestDataEncDecKey => Ok(self.data_secret_ctx.request_sequence_num),
            SessionKeyType::ResponseDataEncDecKey => Ok(self.data_secret_ctx.response_sequence_num),
            _ => Err(KeyScheduleError::InvalidSessionKeyType),
        }
    }

    fn major_secret(&self, session_key_type: SessionKeyType) -> KeyScheduleResult<&HashSecret> {
        match session_key_type {
            SessionKeyType::RequestHandshakeEncDecKey => self
                .handshake_secret_ctx
                .request_handshake_secret
                .as_ref()
                .ok_or(KeyScheduleError::HandshakeSecretNotFound),
            SessionKeyType::ResponseHandshakeEncDecKey => self
                .handshake_secret_ctx
                .response_handshake_secret
                .as_ref()
                .ok_or(KeyScheduleError::HandshakeSecretNotFound),
            SessionKeyType::RequestDataEncDecKey => self
                .data_secret_ctx
                .request_data_secret
                .as_ref()
                .ok_or(KeyScheduleError::DataSecretNotFound),
            SessionKeyType::ResponseDataEncDecKey => self
                .data_secret_ctx
                .response_data_secret
                .as_ref()
                .ok_or(KeyScheduleError::DataSecretNotFound),
            _ => Err(KeyScheduleError::InvalidSessionKeyType),
        }
    }

    fn increment_sequence_number(
        &mut self,
        session_key_type: SessionKeyType,
    ) -> KeyScheduleResult<()> {
        match session_key_type {
            SessionKeyType::RequestHandshakeEncDecKey => {
                self.handshake_secret_ctx.request_sequence_num += 1;
            }
            SessionKeyType::ResponseHandshakeEncDecKey => {
                self.handshake_secret_ctx.response_sequence_num += 1;
            }
            SessionKeyType::RequestDataEncDecKey => {
                self.data_secret_ctx.request_sequence_num += 1;
            }
            SessionKeyType::ResponseDataEncDecKey => {
                self.data_secret_ctx.response_sequence_num += 1;
            }
            _ => return Err(KeyScheduleError::InvalidSessionKeyType),
        }

        Ok(())
    }

    // Per-message AEAD key and nonce from the direction's major secret.
    // The nonce is the derived IV with the sequence number XORed into
    // its trailing 8 bytes, little-endian.
    async fn message_key_and_nonce(
        &self,
        crypto: &dyn SpdmCryptoProvider,
        session_key_type: SessionKeyType,
        sequence_num: u64,
    ) -> KeyScheduleResult<(AeadKey, ArrayVec<u8, MAX_AEAD_IV_SIZE>)> {
        let hash_algo = self.hash_algo()?;
        let aead_suite = self.aead_suite()?;
        let major_secret = self.major_secret(session_key_type)?;

        let key_size = aead_suite.key_size();
        let iv_size = aead_suite.iv_size();

        let bin_str5 = self.bin_concat(SpdmBinStr::BinStr5, key_size as u16, None)?;
        let bin_str6 = self.bin_concat(SpdmBinStr::BinStr6, iv_size as u16, None)?;

        let key_secret = hkdf_expand(
            crypto,
            hash_algo,
            major_secret.as_slice(),
            bin_str5.as_slice(),
            key_size,
        )
        .await?;
        let key =
            AeadKey::from_slice(key_secret.as_slice()).map_err(KeyScheduleError::Crypto)?;

        let iv_secret = hkdf_expand(
            crypto,
            hash_algo,
            major_secret.as_slice(),
            bin_str6.as_slice(),
            iv_size,
        )
        .await?;

        let mut nonce = ArrayVec::<u8, MAX_AEAD_IV_SIZE>::new();
        nonce
            .try_extend_from_slice(iv_secret.as_slice())
            .map_err(|_| KeyScheduleError::BufferTooSmall)?;
        let sequence_bytes = sequence_num.to_le_bytes();
        if nonce.len() < sequence_bytes.len() {
            Err(KeyScheduleError::BufferTooSmall)?;
        }
        let seq_offset = nonce.len() - sequence_bytes.len();
        for (i, b) in sequence_bytes.iter().enumerate() {
            nonce[seq_offset + i] ^= b;
        }

        Ok((key, nonce))
    }

    // Handshake-Secret = HKDF-Extract(Salt_0, DHE-Secret | PSK)
    async fn generate_handshake_secret(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
    ) -> KeyScheduleResult<()> {
        let hash_algo = self.hash_algo()?;
        let salt_0 = [0u8; crate::crypto::MAX_HASH_SIZE];

        let pre_master_secret = self
            .master_secret_ctx
            .pre_master_secret
            .as_ref()
            .ok_or(KeyScheduleError::PreMasterSecretNotFound)?;

        let extract = hkdf_extract(
            crypto,
            hash_algo,
            &salt_0[..hash_algo.hash_size()],
            pre_master_secret.as_slice(),
        )
        .await?;

        self.master_secret_ctx.handshake_secret = Some(extract);
        Ok(())
    }

    // Request/Response-Handshake-Secret = HKDF-Expand(Handshake-Secret, bin_str1/2, Hash.Length)
    async fn generate_req_rsp_handshake_secret(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        th1_transcript_hash: &[u8],
    ) -> KeyScheduleResult<()> {
        let hash_algo = self.hash_algo()?;
        let hash_size = hash_algo.hash_size();
        let bin_str1 = self.bin_concat(
            SpdmBinStr::BinStr1,
            hash_size as u16,
            Some(th1_transcript_hash),
        )?;
        let bin_str2 = self.bin_concat(
            SpdmBinStr::BinStr2,
            hash_size as u16,
            Some(th1_transcript_hash),
        )?;

        let handshake_secret = self
            .master_secret_ctx
            .handshake_secret
            .as_ref()
            .ok_or(KeyScheduleError::HandshakeSecretNotFound)?;

        let expand_req = hkdf_expand(
            crypto,
            hash_algo,
            handshake_secret.as_slice(),
            bin_str1.as_slice(),
            hash_size,
        )
        .await?;
        let expand_rsp = hkdf_expand(
            crypto,
            hash_algo,
            handshake_secret.as_slice(),
            bin_str2.as_slice(),
            hash_size,
        )
        .await?;

        self.handshake_secret_ctx.request_handshake_secret = Some(expand_req);
        self.handshake_secret_ctx.response_handshake_secret = Some(expand_rsp);
        self.handshake_secret_ctx.request_sequence_num = 0;
        self.handshake_secret_ctx.response_sequence_num = 0;

        Ok(())
    }

    // Request/Response-Finished-Key = HKDF-Expand(direction handshake secret, bin_str7, Hash.Length)
    async fn generate_req_rsp_finished_key(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
    ) -> KeyScheduleResult<()> {
        let hash_algo = self.hash_algo()?;
        let hash_size = hash_algo.hash_size();
        let bin_str7 = self.bin_concat(SpdmBinStr::BinStr7, hash_size as u16, None)?;

        let request_secret = self
            .handshake_secret_ctx
            .request_handshake_secret
            .as_ref()
            .ok_or(KeyScheduleError::HandshakeSecretNotFound)?;
        let response_secret = self
            .handshake_secret_ctx
            .response_handshake_secret
            .as_ref()
            .ok_or(KeyScheduleError::HandshakeSecretNotFound)?;

        let expand_req = hkdf_expand(
            crypto,
            hash_algo,
            request_secret.as_slice(),
            bin_str7.as_slice(),
            hash_size,
        )
        .await?;
        let expand_rsp = hkdf_expand(
            crypto,
            hash_algo,
            response_secret.as_slice(),
            bin_str7.as_slice(),
            hash_size,
        )
        .await?;

        self.handshake_secret_ctx.request_finished_key = Some(expand_req);
        self.handshake_secret_ctx.response_finished_key = Some(expand_rsp);
        Ok(())
    }

    // Salt_1 = HKDF-Expand(Handshake-Secret, bin_str0, Hash.Length)
    // Master-Secret = HKDF-Extract(Salt_1, 0_filled)
    async fn generate_master_secret(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
    ) -> KeyScheduleResult<()> {
        let hash_algo = self.hash_algo()?;
        let hash_size = hash_algo.hash_size();
        let bin_str0 = self.bin_concat(SpdmBinStr::BinStr0, hash_size as u16, None)?;

        let handshake_secret = self
            .master_secret_ctx
            .handshake_secret
            .as_ref()
            .ok_or(KeyScheduleError::HandshakeSecretNotFound)?;

        let salt_1 = hkdf_expand(
            crypto,
            hash_algo,
            handshake_secret.as_slice(),
            bin_str0.as_slice(),
            hash_size,
        )
        .await?;

        let zero_filled = [0u8; crate::crypto::MAX_HASH_SIZE];
        let extract = hkdf_extract(
            crypto,
            hash_algo,
            salt_1.as_slice(),
            &zero_filled[..hash_size],
        )
        .await?;

        self.master_secret_ctx.master_secret = Some(extract);
        Ok(())
    }

    // Request/Response-Direction-Data-Secret = HKDF-Expand(Master-Secret, bin_str3/4, Hash.Length)
    async fn generate_req_rsp_data_secret(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        th2_transcript_hash: &[u8],
    ) -> KeyScheduleResult<()> {
        let hash_algo = self.hash_algo()?;
        let hash_size = hash_algo.hash_size();
        let bin_str3 = self.bin_concat(
            SpdmBinStr::BinStr3,
            hash_size as u16,
            Some(th2_transcript_hash),
        )?;
        let bin_str4 = self.bin_concat(
            SpdmBinStr::BinStr4,
            hash_size as u16,
            Some(th2_transcript_hash),
        )?;

        let master_secret = self
            .master_secret_ctx
            .master_secret
            .as_ref()
            .ok_or(KeyScheduleError::MasterSecretNotFound)?;

        let expand_req = hkdf_expand(
            crypto,
            hash_algo,
            master_secret.as_slice(),
            bin_str3.as_slice(),
            hash_size,
        )
        .await?;
        let expand_rsp = hkdf_expand(
            crypto,
            hash_algo,
            master_secret.as_slice(),
            bin_str4.as_slice(),
            hash_size,
        )
        .await?;

        self.data_secret_ctx.request_data_secret = Some(expand_req);
        self.data_secret_ctx.response_data_secret = Some(expand_rsp);
        self.data_secret_ctx.request_sequence_num = 0;
        self.data_secret_ctx.response_sequence_num = 0;

        Ok(())
    }

    // Export-Master-Secret = HKDF-Expand(Master-Secret, bin_str8, Hash.Length)
    async fn generate_export_master_secret(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        th2_transcript_hash: &[u8],
    ) -> KeyScheduleResult<()> {
        let hash_algo = self.hash_algo()?;
        let hash_size = hash_algo.hash_size();
        let bin_str8 = self.bin_concat(
            SpdmBinStr::BinStr8,
            hash_size as u16,
            Some(th2_transcript_hash),
        )?;

        let master_secret = self
            .master_secret_ctx
            .master_secret
            .as_ref()
            .ok_or(KeyScheduleError::MasterSecretNotFound)?;

        let expand = hkdf_expand(
            crypto,
            hash_algo,
            master_secret.as_slice(),
            bin_str8.as_slice(),
            hash_size,
        )
        .await?;

        self.export_master_secret = Some(expand);
        Ok(())
    }

    fn bin_concat(
        &self,
        bin_str_type: SpdmBinStr,
        length: u16,
        context: Option<&[u8]>,
    ) -> KeyScheduleResult<ArrayVec<u8, { Self::MAX_BIN_STR_LEN }>> {
        let mut bin_str_buf = ArrayVec::<u8, { Self::MAX_BIN_STR_LEN }>::new();
        let length_bytes = length.to_le_bytes();
        let version_bytes = self.version_str().as_bytes();
        let label_bytes = bin_str_type.label().as_bytes();

        bin_str_buf
            .try_extend_from_slice(&length_bytes)
            .map_err(|_| KeyScheduleError::BufferTooSmall)?;
        bin_str_buf
            .try_extend_from_slice(version_bytes)
            .map_err(|_| KeyScheduleError::BufferTooSmall)?;
        bin_str_buf
            .try_extend_from_slice(label_bytes)
            .map_err(|_| KeyScheduleError::BufferTooSmall)?;
        if let Some(context) = context {
            bin_str_buf
                .try_extend_from_slice(context)
                .map_err(|_| KeyScheduleError::BufferTooSmall)?;
        }

        Ok(bin_str_buf)
    }

    fn version_str(&self) -> &'static str {
        match self.spdm_version {
            SpdmVersion::V10 => "spdm1.0 ",
            SpdmVersion::V11 => "spdm1.1 ",
            SpdmVersion::V12 => "spdm1.2 ",
            SpdmVersion::V13 => "spdm1.3 ",
        }
    }
}

// HKDF-Extract(salt, ikm) = HMAC(salt, ikm)
pub(crate) async fn hkdf_extract(
    crypto: &dyn SpdmCryptoProvider,
    hash_algo: BaseHashAlgoType,
    salt: &[u8],
    ikm: &[u8],
) -> KeyScheduleResult<HashSecret> {
    let prk = crypto
        .hmac(hash_algo, salt, ikm)
        .await
        .map_err(KeyScheduleError::Crypto)?;
    HashSecret::from_slice(prk.as_slice()).map_err(KeyScheduleError::Crypto)
}

// HKDF-Expand(prk, info, out_len); out_len never exceeds one digest
// here, but the block loop keeps the construction general.
pub(crate) async fn hkdf_expand(
    crypto: &dyn SpdmCryptoProvider,
    hash_algo: BaseHashAlgoType,
    prk: &[u8],
    info: &[u8],
    out_len: usize,
) -> KeyScheduleResult<HashSecret> {
    let hash_size = hash_algo.hash_size();
    if out_len > crate::crypto::MAX_HASH_SIZE {
        Err(KeyScheduleError::BufferTooSmall)?;
    }

    let mut okm = [0u8; crate::crypto::MAX_HASH_SIZE];
    let mut generated = 0usize;
    let mut previous: Option<DigestBuf> = None;
    let mut counter = 1u8;

    while generated < out_len {
        let mut block_input = ArrayVec::<u8, 256>::new();
        if let Some(prev) = &previous {
            block_input
                .try_extend_from_slice(prev.as_slice())
                .map_err(|_| KeyScheduleError::BufferTooSmall)?;
        }
        block_input
            .try_extend_from_slice(info)
            .map_err(|_| KeyScheduleError::BufferTooSmall)?;
        block_input.push(counter);

        let block = crypto
            .hmac(hash_algo, prk, block_input.as_slice())
            .await
            .map_err(KeyScheduleError::Crypto)?;

        let take = core::cmp::min(hash_size, out_len - generated);
        okm[generated..generated + take].copy_from_slice(&block.as_slice()[..take]);
        generated += take;
        previous = Some(block);
        counter += 1;
    }

    let secret = HashSecret::from_slice(&okm[..out_len]).map_err(KeyScheduleError::Crypto)?;
    okm.iter_mut().for_each(|b| *b = 0);
    Ok(secret)
}

#[derive(Default)]
struct MasterSecretCtx {
    // DHE shared secret or resolved PSK
    pre_master_secret: Option<SharedSecret>,
    // Handshake secret
    handshake_secret: Option<HashSecret>,
    // Master secret
    master_secret: Option<HashSecret>,
}

#[derive(Default)]
struct HandshakeSecretCtx {
    request_handshake_secret: Option<HashSecret>,
    response_handshake_secret: Option<HashSecret>,
    request_finished_key: Option<HashSecret>,
    response_finished_key: Option<HashSecret>,
    request_sequence_num: u64,
    response_sequence_num: u64,
}

struct DataSecretBackup {
    secret: HashSecret,
    sequence_num: u64,
}

#[derive(Default)]
struct DataSecretCtx {
    request_data_secret: Option<HashSecret>,
    response_data_secret: Option<HashSecret>,
    request_sequence_num: u64,
    response_sequence_num: u64,
    request_epoch: u32,
    response_epoch: u32,
    request_backup: Option<DataSecretBackup>,
    response_backup: Option<DataSecretBackup>,
}

#[allow(dead_code)]
enum SpdmBinStr {
    BinStr0,
    BinStr1,
    BinStr2,
    BinStr3,
    BinStr4,
    BinStr5,
    BinStr6,
    BinStr7,
    BinStr8,
    BinStr9,
}

impl SpdmBinStr {
    fn label(&self) -> &'static str {
        match self {
            SpdmBinStr::BinStr0 => "derived",
            SpdmBinStr::BinStr1 => "req hs data",
            SpdmBinStr::BinStr2 => "rsp hs data",
            SpdmBinStr::BinStr3 => "req app data",
            SpdmBinStr::BinStr4 => "rsp app data",
            SpdmBinStr::BinStr5 => "key",
            SpdmBinStr::BinStr6 => "iv",
            SpdmBinStr::BinStr7 => "finished",
            SpdmBinStr::BinStr8 => "exp master",
            SpdmBinStr::BinStr9 => "traffic upd",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SharedSecret;
    use crate::test_utils::MockCryptoProvider;
    use futures::executor::block_on;

    fn schedule_with_keys() -> KeySchedule {
        let crypto = MockCryptoProvider::new();
        let mut key_schedule = KeySchedule::default();
        key_schedule.init(
            SpdmVersion::V12,
            BaseHashAlgoType::TpmAlgSha384,
            AeadCipherSuiteType::Aes256Gcm,
        );
        key_schedule.set_pre_master_secret(SharedSecret::from_slice(&[0x44; 48]).unwrap());
        block_on(async {
            key_schedule
                .generate_session_handshake_key(&crypto, &[0x11; 48])
                .await
                .unwrap();
            key_schedule
                .generate_session_data_key(&crypto, &[0x22; 48])
                .await
                .unwrap();
        });
        key_schedule
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let a = schedule_with_keys();
        let b = schedule_with_keys();
        assert!(a.data_keys_ready());
        assert!(a.export_master_secret().is_some());
        let crypto = MockCryptoProvider::new();
        block_on(async {
            let hmac_a = a
                .hmac(&crypto, SessionKeyType::RequestFinishedKey, &[1, 2, 3])
                .await
                .unwrap();
            let hmac_b = b
                .hmac(&crypto, SessionKeyType::RequestFinishedKey, &[1, 2, 3])
                .await
                .unwrap();
            assert_eq!(hmac_a.as_slice(), hmac_b.as_slice());
        });
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip_with_sequence() {
        let mut sender = schedule_with_keys();
        let mut receiver = schedule_with_keys();
        let crypto = MockCryptoProvider::new();
        block_on(async {
            for round in 0u8..3 {
                let plaintext = [round; 24];
                let mut ciphertext = [0u8; 64];
                let mut decrypted = [0u8; 64];
                let (ct_len, tag) = sender
                    .encrypt_message(
                        &crypto,
                        SessionKeyType::RequestDataEncDecKey,
                        b"aad",
                        &plaintext,
                        &mut ciphertext,
                    )
                    .await
                    .unwrap();
                let pt_len = receiver
                    .decrypt_message(
                        &crypto,
                        SessionKeyType::RequestDataEncDecKey,
                        b"aad",
                        &ciphertext[..ct_len],
                        tag,
                        &mut decrypted,
                    )
                    .await
                    .unwrap();
                assert_eq!(&decrypted[..pt_len], &plaintext);
            }
        });
    }

    #[test]
    fn test_key_update_commit_and_rollback() {
        let mut key_schedule = schedule_with_keys();
        let crypto = MockCryptoProvider::new();
        let mut peer = schedule_with_keys();
        block_on(async {
            assert_eq!(key_schedule.key_epoch(KeyUpdateDirection::Responder), 0);

            // Rollback restores the old key material
            key_schedule
                .create_update_data_key(&crypto, KeyUpdateDirection::Responder)
                .await
                .unwrap();
            assert!(key_schedule.update_pending(KeyUpdateDirection::Responder));
            key_schedule
                .activate_update_data_key(KeyUpdateDirection::Responder, false)
                .unwrap();
            assert_eq!(key_schedule.key_epoch(KeyUpdateDirection::Responder), 0);

            // A rolled-back schedule still interoperates with a peer
            // that never rotated
            let mut ciphertext = [0u8; 64];
            let mut decrypted = [0u8; 64];
            let (ct_len, tag) = key_schedule
                .encrypt_message(
                    &crypto,
                    SessionKeyType::ResponseDataEncDecKey,
                    b"",
                    &[9; 8],
                    &mut ciphertext,
                )
                .await
                .unwrap();
            peer.decrypt_message(
                &crypto,
                SessionKeyType::ResponseDataEncDecKey,
                b"",
                &ciphertext[..ct_len],
                tag,
                &mut decrypted,
            )
            .await
            .unwrap();

            // Commit advances the epoch
            key_schedule
                .create_update_data_key(&crypto, KeyUpdateDirection::Responder)
                .await
                .unwrap();
            key_schedule
                .activate_update_data_key(KeyUpdateDirection::Responder, true)
                .unwrap();
            assert_eq!(key_schedule.key_epoch(KeyUpdateDirection::Responder), 1);
            assert!(!key_schedule.update_pending(KeyUpdateDirection::Responder));
        });
    }

    #[test]
    fn test_activate_without_create_is_rejected() {
        let mut key_schedule = schedule_with_keys();
        assert_eq!(
            key_schedule.activate_update_data_key(KeyUpdateDirection::Requester, true),
            Err(KeyScheduleError::NoPendingKeyUpdate)
        );
    }
}
