// Licensed under the Apache-2.0 license

//! Deterministic test doubles: a mock crypto provider whose outputs
//! tests can recompute, a scripted transport, a mirror of the session
//! key schedule for building valid responder traffic, and a fake
//! monotonic timer.

extern crate alloc;

use crate::cert_store::{CertChainValidator, CertStoreResult};
use crate::codec::MessageBuf;
use crate::crypto::{
    CryptoError, CryptoResult, DigestBuf, HashSecret, SharedSecret, SpdmCryptoProvider,
    SpdmDheExchange, AEAD_TAG_SIZE,
};
use crate::protocol::algorithms::{
    AeadCipherSuiteType, BaseAsymAlgoType, BaseHashAlgoType, DheGroupType, ReqBaseAsymAlgType,
};
use crate::time::SpdmTimer;
use crate::transport::{SpdmTransport, TransportError, TransportResult};
use alloc::boxed::Box;
use alloc::vec::Vec;
use async_trait::async_trait;
use core::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Deterministic digest primitives
// ---------------------------------------------------------------------------

/// Keyless mixing function standing in for a hash; deterministic and
/// recomputable from test code.
pub(crate) fn fake_digest(len: usize, parts: &[&[u8]]) -> DigestBuf {
    let mut state = [0x5Au8; 64];
    let mut i: usize = 0;
    for part in parts {
        // Separate the parts so concatenation boundaries matter
        state[i % 64] ^= 0xA7;
        i = i.wrapping_add(7);
        for &b in *part {
            let idx = i % 64;
            state[idx] = state[idx].wrapping_mul(31) ^ b ^ (i as u8);
            i = i.wrapping_add(1);
        }
    }
    state[0] ^= (i & 0xFF) as u8;
    state[1] ^= ((i >> 8) & 0xFF) as u8;

    for _ in 0..2 {
        let mut carry = 0x17u8;
        for idx in 0..64 {
            carry = carry.wrapping_mul(131).wrapping_add(state[idx]).rotate_left(3);
            state[idx] = carry;
        }
        let mut carry = 0x29u8;
        for idx in (0..64).rev() {
            carry = carry.wrapping_mul(137).wrapping_add(state[idx]).rotate_left(5);
            state[idx] = carry;
        }
    }

    let mut out = DigestBuf::default();
    out.try_extend_from_slice(&state[..len]).unwrap();
    out
}

/// Arbitrary-length deterministic byte stream.
pub(crate) fn fake_stream(len: usize, parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut counter = 0u8;
    while out.len() < len {
        let mut block_parts: Vec<&[u8]> = parts.to_vec();
        let counter_bytes = [counter];
        block_parts.push(&counter_bytes);
        let block = fake_digest(64, &block_parts);
        out.extend_from_slice(block.as_slice());
        counter = counter.wrapping_add(1);
    }
    out.truncate(len);
    out
}

pub(crate) fn sync_hash(len: usize, data: &[u8]) -> Vec<u8> {
    fake_digest(len, &[b"hash", data]).to_vec()
}

pub(crate) fn sync_hmac(len: usize, key: &[u8], data: &[u8]) -> Vec<u8> {
    fake_digest(len, &[b"hmac", key, data]).to_vec()
}

pub(crate) fn sync_hkdf_extract(len: usize, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    sync_hmac(len, salt, ikm)
}

pub(crate) fn sync_hkdf_expand(
    hash_len: usize,
    prk: &[u8],
    info: &[u8],
    out_len: usize,
) -> Vec<u8> {
    let mut okm = Vec::new();
    let mut previous: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while okm.len() < out_len {
        let mut input = previous.clone();
        input.extend_from_slice(info);
        input.push(counter);
        previous = sync_hmac(hash_len, prk, &input);
        okm.extend_from_slice(&previous);
        counter += 1;
    }
    okm.truncate(out_len);
    okm
}

pub(crate) fn bin_concat(
    version_label: &str,
    label: &str,
    out_len: u16,
    context: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&out_len.to_le_bytes());
    out.extend_from_slice(version_label.as_bytes());
    out.extend_from_slice(label.as_bytes());
    out.extend_from_slice(context);
    out
}

pub(crate) fn mock_responder_signature(
    sig_len: usize,
    cert_chain: &[u8],
    msg_hash: &[u8],
) -> Vec<u8> {
    fake_stream(sig_len, &[b"sig-rsp", cert_chain, msg_hash])
}

pub(crate) fn mock_requester_signature(sig_len: usize, slot_id: u8, msg_hash: &[u8]) -> Vec<u8> {
    fake_stream(sig_len, &[b"sig-req", &[slot_id], msg_hash])
}

pub(crate) fn mock_psk_secret(psk_hint: &[u8]) -> Vec<u8> {
    fake_digest(32, &[b"psk", psk_hint]).to_vec()
}

pub(crate) fn mock_dhe_public(seed: &[u8], size: usize) -> Vec<u8> {
    fake_stream(size, &[b"dhe-pub", seed])
}

/// Shared secret symmetric in the two public values.
pub(crate) fn mock_dhe_shared(pub_a: &[u8], pub_b: &[u8]) -> Vec<u8> {
    let (lo, hi) = if pub_a <= pub_b {
        (pub_a, pub_b)
    } else {
        (pub_b, pub_a)
    };
    fake_stream(32, &[b"dhe-shared", lo, hi])
}

fn aead_keystream(len: usize, key: &[u8], nonce: &[u8]) -> Vec<u8> {
    fake_stream(len, &[b"aead-ks", key, nonce])
}

fn aead_tag(key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> [u8; AEAD_TAG_SIZE] {
    let tag = fake_digest(AEAD_TAG_SIZE, &[b"aead-tag", key, nonce, aad, ciphertext]);
    let mut out = [0u8; AEAD_TAG_SIZE];
    out.copy_from_slice(tag.as_slice());
    out
}

// ---------------------------------------------------------------------------
// Mock crypto provider
// ---------------------------------------------------------------------------

pub(crate) struct MockCryptoProvider {
    rng_counter: AtomicU64,
}

impl MockCryptoProvider {
    pub fn new() -> Self {
        Self {
            rng_counter: AtomicU64::new(0),
        }
    }
}

pub(crate) struct MockDheExchange {
    public: Vec<u8>,
}

#[async_trait]
impl SpdmDheExchange for MockDheExchange {
    fn exchange_data(&self) -> &[u8] {
        &self.public
    }

    async fn compute_shared_secret(
        &mut self,
        peer_exchange_data: &[u8],
    ) -> CryptoResult<SharedSecret> {
        let shared = mock_dhe_shared(&self.public, peer_exchange_data);
        SharedSecret::from_slice(&shared)
    }
}

#[async_trait]
impl SpdmCryptoProvider for MockCryptoProvider {
    async fn hash(&self, algo: BaseHashAlgoType, data: &[u8]) -> CryptoResult<DigestBuf> {
        Ok(fake_digest(algo.hash_size(), &[b"hash", data]))
    }

    async fn hmac(
        &self,
        algo: BaseHashAlgoType,
        key: &[u8],
        data: &[u8],
    ) -> CryptoResult<DigestBuf> {
        Ok(fake_digest(algo.hash_size(), &[b"hmac", key, data]))
    }

    async fn asym_verify(
        &self,
        algo: BaseAsymAlgoType,
        cert_chain: &[u8],
        msg_hash: &[u8],
        signature: &[u8],
    ) -> CryptoResult<()> {
        let expected = mock_responder_signature(algo.signature_size(), cert_chain, msg_hash);
        if expected == signature {
            Ok(())
        } else {
            Err(CryptoError::SignatureMismatch)
        }
    }

    async fn asym_sign(
        &self,
        algo: ReqBaseAsymAlgType,
        slot_id: u8,
        msg_hash: &[u8],
        signature: &mut [u8],
    ) -> CryptoResult<usize> {
        let sig = mock_requester_signature(algo.signature_size(), slot_id, msg_hash);
        if signature.len() < sig.len() {
            Err(CryptoError::BufferTooSmall)?;
        }
        signature[..sig.len()].copy_from_slice(&sig);
        Ok(sig.len())
    }

    async fn dhe_new(&self, group: DheGroupType) -> CryptoResult<Box<dyn SpdmDheExchange>> {
        Ok(Box::new(MockDheExchange {
            public: mock_dhe_public(b"requester", group.exchange_data_size()),
        }))
    }

    async fn aead_seal(
        &self,
        _suite: AeadCipherSuiteType,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
        ciphertext: &mut [u8],
    ) -> CryptoResult<(usize, [u8; AEAD_TAG_SIZE])> {
        if ciphertext.len() < plaintext.len() {
            Err(CryptoError::BufferTooSmall)?;
        }
        let keystream = aead_keystream(plaintext.len(), key, nonce);
        for (i, b) in plaintext.iter().enumerate() {
            ciphertext[i] = b ^ keystream[i];
        }
        let tag = aead_tag(key, nonce, aad, &ciphertext[..plaintext.len()]);
        Ok((plaintext.len(), tag))
    }

    async fn aead_open(
        &self,
        _suite: AeadCipherSuiteType,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8; AEAD_TAG_SIZE],
        plaintext: &mut [u8],
    ) -> CryptoResult<usize> {
        let expected_tag = aead_tag(key, nonce, aad, ciphertext);
        if &expected_tag != tag {
            Err(CryptoError::AeadTagMismatch)?;
        }
        if plaintext.len() < ciphertext.len() {
            Err(CryptoError::BufferTooSmall)?;
        }
        let keystream = aead_keystream(ciphertext.len(), key, nonce);
        for (i, b) in ciphertext.iter().enumerate() {
            plaintext[i] = b ^ keystream[i];
        }
        Ok(ciphertext.len())
    }

    async fn random(&self, out: &mut [u8]) -> CryptoResult<()> {
        let counter = self.rng_counter.fetch_add(1, Ordering::Relaxed);
        let stream = fake_stream(out.len(), &[b"rng", &counter.to_le_bytes()]);
        out.copy_from_slice(&stream);
        Ok(())
    }

    async fn resolve_psk(&self, psk_hint: &[u8]) -> CryptoResult<HashSecret> {
        HashSecret::from_slice(&mock_psk_secret(psk_hint))
    }
}

// ---------------------------------------------------------------------------
// Responder-side mirror of the session key schedule
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
pub(crate) enum MirrorKey {
    ReqHandshake,
    RspHandshake,
    ReqData,
    RspData,
}

/// A responder's view of one session's secrets, derived with the sync
/// primitives above; used by scripted responders to produce traffic
/// the requester under test accepts.
pub(crate) struct MirrorSession {
    pub hash_len: usize,
    pub key_len: usize,
    pub version_label: &'static str,
    pub handshake_secret: Vec<u8>,
    pub req_hs_secret: Vec<u8>,
    pub rsp_hs_secret: Vec<u8>,
    pub req_finished_key: Vec<u8>,
    pub rsp_finished_key: Vec<u8>,
    pub req_data_secret: Vec<u8>,
    pub rsp_data_secret: Vec<u8>,
    pub req_hs_seq: u64,
    pub rsp_hs_seq: u64,
    pub req_data_seq: u64,
    pub rsp_data_seq: u64,
}

impl MirrorSession {
    pub fn new(
        hash_len: usize,
        key_len: usize,
        version_label: &'static str,
        pre_master_secret: &[u8],
    ) -> Self {
        let salt0 = alloc::vec![0u8; hash_len];
        let handshake_secret = sync_hkdf_extract(hash_len, &salt0, pre_master_secret);
        Self {
            hash_len,
            key_len,
            version_label,
            handshake_secret,
            req_hs_secret: Vec::new(),
            rsp_hs_secret: Vec::new(),
            req_finished_key: Vec::new(),
            rsp_finished_key: Vec::new(),
            req_data_secret: Vec::new(),
            rsp_data_secret: Vec::new(),
            req_hs_seq: 0,
            rsp_hs_seq: 0,
            req_data_seq: 0,
            rsp_data_seq: 0,
        }
    }

    pub fn derive_handshake(&mut self, th1: &[u8]) {
        let len = self.hash_len as u16;
        let bin1 = bin_concat(self.version_label, "req hs data", len, th1);
        let bin2 = bin_concat(self.version_label, "rsp hs data", len, th1);
        let bin7 = bin_concat(self.version_label, "finished", len, &[]);
        self.req_hs_secret =
            sync_hkdf_expand(self.hash_len, &self.handshake_secret, &bin1, self.hash_len);
        self.rsp_hs_secret =
            sync_hkdf_expand(self.hash_len, &self.handshake_secret, &bin2, self.hash_len);
        self.req_finished_key =
            sync_hkdf_expand(self.hash_len, &self.req_hs_secret, &bin7, self.hash_len);
        self.rsp_finished_key =
            sync_hkdf_expand(self.hash_len, &self.rsp_hs_secret, &bin7, self.hash_len);
    }

    pub fn derive_data(&mut self, th2: &[u8]) {
        let len = self.hash_len as u16;
        let bin0 = bin_concat(self.version_label, "derived", len, &[]);
        let salt1 = sync_hkdf_expand(self.hash_len, &self.handshake_secret, &bin0, self.hash_len);
        let zero = alloc::vec![0u8; self.hash_len];
        let master = sync_hkdf_extract(self.hash_len, &salt1, &zero);
        let bin3 = bin_concat(self.version_label, "req app data", len, th2);
        let bin4 = bin_concat(self.version_label, "rsp app data", len, th2);
        self.req_data_secret = sync_hkdf_expand(self.hash_len, &master, &bin3, self.hash_len);
        self.rsp_data_secret = sync_hkdf_expand(self.hash_len, &master, &bin4, self.hash_len);
        self.req_data_seq = 0;
        self.rsp_data_seq = 0;
    }

    pub fn ratchet(&mut self, key: MirrorKey) {
        let bin9 = bin_concat(self.version_label, "traffic upd", self.hash_len as u16, &[]);
        match key {
            MirrorKey::ReqData => {
                self.req_data_secret =
                    sync_hkdf_expand(self.hash_len, &self.req_data_secret, &bin9, self.hash_len);
                self.req_data_seq = 0;
            }
            MirrorKey::RspData => {
                self.rsp_data_secret =
                    sync_hkdf_expand(self.hash_len, &self.rsp_data_secret, &bin9, self.hash_len);
                self.rsp_data_seq = 0;
            }
            _ => {}
        }
    }

    fn secret_and_seq(&mut self, key: MirrorKey) -> (Vec<u8>, u64) {
        match key {
            MirrorKey::ReqHandshake => {
                let s = (self.req_hs_secret.clone(), self.req_hs_seq);
                self.req_hs_seq += 1;
                s
            }
            MirrorKey::RspHandshake => {
                let s = (self.rsp_hs_secret.clone(), self.rsp_hs_seq);
                self.rsp_hs_seq += 1;
                s
            }
            MirrorKey::ReqData => {
                let s = (self.req_data_secret.clone(), self.req_data_seq);
                self.req_data_seq += 1;
                s
            }
            MirrorKey::RspData => {
                let s = (self.rsp_data_secret.clone(), self.rsp_data_seq);
                self.rsp_data_seq += 1;
                s
            }
        }
    }

    fn key_and_nonce(&self, major: &[u8], seq: u64) -> (Vec<u8>, Vec<u8>) {
        let bin5 = bin_concat(self.version_label, "key", self.key_len as u16, &[]);
        let bin6 = bin_concat(self.version_label, "iv", 12, &[]);
        let key = sync_hkdf_expand(self.hash_len, major, &bin5, self.key_len);
        let mut nonce = sync_hkdf_expand(self.hash_len, major, &bin6, 12);
        // Sequence number lands in the trailing 8 bytes of the IV
        let seq_offset = nonce.len() - 8;
        for (i, b) in seq.to_le_bytes().iter().enumerate() {
            nonce[seq_offset + i] ^= b;
        }
        (key, nonce)
    }

    /// Seal an application message in the secured-message envelope.
    pub fn seal(&mut self, key_type: MirrorKey, session_id: u32, app: &[u8]) -> Vec<u8> {
        let (major, seq) = self.secret_and_seq(key_type);
        let (key, nonce) = self.key_and_nonce(&major, seq);

        let mut plaintext = Vec::new();
        plaintext.extend_from_slice(&(app.len() as u16).to_le_bytes());
        plaintext.extend_from_slice(app);

        let length = (plaintext.len() + AEAD_TAG_SIZE) as u16;
        let mut aad = Vec::new();
        aad.extend_from_slice(&session_id.to_le_bytes());
        aad.extend_from_slice(&length.to_le_bytes());

        let keystream = aead_keystream(plaintext.len(), &key, &nonce);
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .zip(keystream.iter())
            .map(|(p, k)| p ^ k)
            .collect();
        let tag = aead_tag(&key, &nonce, &aad, &ciphertext);

        let mut out = Vec::new();
        out.extend_from_slice(&session_id.to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        out
    }

    /// Open a secured message; panics on malformed test traffic.
    pub fn open(&mut self, key_type: MirrorKey, bytes: &[u8]) -> Vec<u8> {
        let length = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let ciphertext = &bytes[6..6 + length - AEAD_TAG_SIZE];
        let tag: [u8; AEAD_TAG_SIZE] = bytes[6 + length - AEAD_TAG_SIZE..6 + length]
            .try_into()
            .unwrap();

        let (major, seq) = self.secret_and_seq(key_type);
        let (key, nonce) = self.key_and_nonce(&major, seq);
        let aad = &bytes[..6];
        assert_eq!(tag, aead_tag(&key, &nonce, aad, ciphertext), "bad tag");

        let keystream = aead_keystream(ciphertext.len(), &key, &nonce);
        let plaintext: Vec<u8> = ciphertext
            .iter()
            .zip(keystream.iter())
            .map(|(c, k)| c ^ k)
            .collect();
        let app_len = u16::from_le_bytes([plaintext[0], plaintext[1]]) as usize;
        plaintext[2..2 + app_len].to_vec()
    }
}

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

/// Transport whose handler maps each outgoing request to the bytes the
/// "responder" answers with (or a transport error).
pub(crate) struct MockTransport<F>
where
    F: FnMut(Option<u32>, &[u8]) -> Result<Vec<u8>, TransportError> + Send,
{
    handler: F,
    pending_response: Option<Vec<u8>>,
    pub requests_seen: usize,
}

impl<F> MockTransport<F>
where
    F: FnMut(Option<u32>, &[u8]) -> Result<Vec<u8>, TransportError> + Send,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            pending_response: None,
            requests_seen: 0,
        }
    }
}

#[async_trait]
impl<F> SpdmTransport for MockTransport<F>
where
    F: FnMut(Option<u32>, &[u8]) -> Result<Vec<u8>, TransportError> + Send,
{
    async fn send_request<'a>(
        &mut self,
        session_id: Option<u32>,
        req: &mut MessageBuf<'a>,
    ) -> TransportResult<()> {
        self.requests_seen += 1;
        let bytes = req.message_data().map_err(|_| TransportError::DriverError)?;
        let rsp = (self.handler)(session_id, bytes)?;
        self.pending_response = Some(rsp);
        Ok(())
    }

    async fn receive_response<'a>(&mut self, rsp: &mut MessageBuf<'a>) -> TransportResult<()> {
        let bytes = self
            .pending_response
            .take()
            .ok_or(TransportError::NoRequestInFlight)?;
        rsp.reset();
        rsp.put_data(bytes.len())
            .map_err(|_| TransportError::BufferTooSmall)?;
        rsp.data_mut(bytes.len())
            .map_err(|_| TransportError::BufferTooSmall)?
            .copy_from_slice(&bytes);
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        crate::requester::MAX_SPDM_MSG_SIZE
    }

    fn header_size(&self) -> usize {
        0
    }
}

// ---------------------------------------------------------------------------
// Fake timer and cert validation
// ---------------------------------------------------------------------------

pub(crate) struct FakeTimer {
    now_ms: AtomicU64,
    pub total_slept_ms: AtomicU64,
}

impl FakeTimer {
    pub fn new() -> Self {
        Self {
            now_ms: AtomicU64::new(0),
            total_slept_ms: AtomicU64::new(0),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn slept_ms(&self) -> u64 {
        self.total_slept_ms.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SpdmTimer for FakeTimer {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Relaxed)
    }

    async fn sleep_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::Relaxed);
        self.total_slept_ms.fetch_add(ms, Ordering::Relaxed);
    }
}

pub(crate) struct AcceptAllValidator;

#[async_trait]
impl CertChainValidator for AcceptAllValidator {
    async fn validate_cert_chain(&self, _slot_id: u8, _cert_chain: &[u8]) -> CertStoreResult<()> {
        Ok(())
    }
}
