// Licensed under the Apache-2.0 license

//! Uniform interface over the cryptographic primitives the requester
//! consumes. The embedding selects a provider; the core never touches
//! key material representations beyond opaque byte secrets.

extern crate alloc;
use crate::protocol::algorithms::{
    AeadCipherSuiteType, BaseAsymAlgoType, BaseHashAlgoType, DheGroupType, ReqBaseAsymAlgType,
};
use alloc::boxed::Box;
use arrayvec::ArrayVec;
use async_trait::async_trait;
use zeroize::Zeroize;

pub const MAX_HASH_SIZE: usize = 64;
pub const MAX_SIGNATURE_SIZE: usize = 512;
pub const MAX_DHE_EXCHANGE_DATA_SIZE: usize = 512;
pub const MAX_DHE_SHARED_SECRET_SIZE: usize = 512;
pub const MAX_AEAD_KEY_SIZE: usize = 32;
pub const MAX_AEAD_IV_SIZE: usize = 12;
pub const AEAD_TAG_SIZE: usize = 16;

pub type CryptoResult<T> = Result<T, CryptoError>;

pub type DigestBuf = ArrayVec<u8, MAX_HASH_SIZE>;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum CryptoError {
    UnsupportedAlgorithm,
    SignatureMismatch,
    AeadTagMismatch,
    BufferTooSmall,
    EntropyFailure,
    UnknownPskHint,
    ProviderFailure,
}

/// Fixed-capacity secret byte buffer, wiped on drop.
pub struct SecretBuf<const N: usize> {
    data: [u8; N],
    len: usize,
}

impl<const N: usize> SecretBuf<N> {
    pub fn from_slice(src: &[u8]) -> CryptoResult<Self> {
        if src.len() > N {
            Err(CryptoError::BufferTooSmall)?;
        }
        let mut data = [0u8; N];
        data[..src.len()].copy_from_slice(src);
        Ok(Self {
            data,
            len: src.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Drop for SecretBuf<N> {
    fn drop(&mut self) {
        self.data.zeroize();
        self.len = 0;
    }
}

pub type SharedSecret = SecretBuf<MAX_DHE_SHARED_SECRET_SIZE>;
pub type HashSecret = SecretBuf<MAX_HASH_SIZE>;
pub type AeadKey = SecretBuf<MAX_AEAD_KEY_SIZE>;

/// An in-progress ephemeral DHE exchange.
#[async_trait]
pub trait SpdmDheExchange: Send {
    /// Local public exchange data to place in the request.
    fn exchange_data(&self) -> &[u8];

    /// Complete the exchange against the peer's public exchange data.
    async fn compute_shared_secret(
        &mut self,
        peer_exchange_data: &[u8],
    ) -> CryptoResult<SharedSecret>;
}

/// Cryptographic provider supplied by the embedding.
#[async_trait]
pub trait SpdmCryptoProvider: Send + Sync {
    async fn hash(&self, algo: BaseHashAlgoType, data: &[u8]) -> CryptoResult<DigestBuf>;

    async fn hmac(
        &self,
        algo: BaseHashAlgoType,
        key: &[u8],
        data: &[u8],
    ) -> CryptoResult<DigestBuf>;

    /// Verify `signature` over `msg_hash` against the leaf key of the
    /// peer certificate chain. The provider owns chain parsing and
    /// public key extraction.
    async fn asym_verify(
        &self,
        algo: BaseAsymAlgoType,
        cert_chain: &[u8],
        msg_hash: &[u8],
        signature: &[u8],
    ) -> CryptoResult<()>;

    /// Sign `msg_hash` with the local key for `slot_id` (mutual auth).
    /// Returns the signature length written into `signature`.
    async fn asym_sign(
        &self,
        algo: ReqBaseAsymAlgType,
        slot_id: u8,
        msg_hash: &[u8],
        signature: &mut [u8],
    ) -> CryptoResult<usize>;

    /// Start an ephemeral DHE exchange for the negotiated group.
    async fn dhe_new(&self, group: DheGroupType) -> CryptoResult<Box<dyn SpdmDheExchange>>;

    /// Seal `plaintext` into `ciphertext`; returns ciphertext length
    /// and the authentication tag.
    async fn aead_seal(
        &self,
        suite: AeadCipherSuiteType,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
        ciphertext: &mut [u8],
    ) -> CryptoResult<(usize, [u8; AEAD_TAG_SIZE])>;

    /// Open `ciphertext` into `plaintext`; tag mismatch is
    /// `AeadTagMismatch`. Returns the plaintext length.
    async fn aead_open(
        &self,
        suite: AeadCipherSuiteType,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8; AEAD_TAG_SIZE],
        plaintext: &mut [u8],
    ) -> CryptoResult<usize>;

    /// Fill `out` with cryptographically secure random bytes.
    async fn random(&self, out: &mut [u8]) -> CryptoResult<()>;

    /// Resolve a PSK hint to the pre-shared secret it names.
    async fn resolve_psk(&self, psk_hint: &[u8]) -> CryptoResult<HashSecret>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_buf() {
        let secret = HashSecret::from_slice(&[0xAB; 48]).unwrap();
        assert_eq!(secret.len(), 48);
        assert_eq!(secret.as_slice(), &[0xAB; 48]);
        assert!(HashSecret::from_slice(&[0; MAX_HASH_SIZE + 1]).is_err());
    }
}
