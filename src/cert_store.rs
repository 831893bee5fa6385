// Licensed under the Apache-2.0 license

extern crate alloc;
use alloc::boxed::Box;
use arrayvec::ArrayVec;
use async_trait::async_trait;

pub const MAX_CERT_SLOTS_SUPPORTED: u8 = 8;
pub const MAX_CERT_CHAIN_SIZE: usize = 4096;

/// Slot value selecting the pre-provisioned peer chain.
pub const PROVISIONED_SLOT_ID: u8 = 0xFF;

pub type CertChainBuf = ArrayVec<u8, MAX_CERT_CHAIN_SIZE>;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum CertStoreError {
    InvalidSlotId,
    ChainTooLarge,
    ChainNotAvailable,
    ValidationFailed,
}

pub type CertStoreResult<T> = Result<T, CertStoreError>;

/// Certificate chain parser/verifier supplied by the embedding.
#[async_trait]
pub trait CertChainValidator: Send + Sync {
    /// Validate a retrieved peer chain (format, signatures, roots).
    async fn validate_cert_chain(&self, slot_id: u8, cert_chain: &[u8]) -> CertStoreResult<()>;
}

/// Peer certificate chains known to the requester.
///
/// One retrieved chain is cached at a time (the chain in use for the
/// current authentication flow) alongside an optional pre-provisioned
/// chain addressed as slot 0xFF.
pub(crate) struct PeerCertStore<'a> {
    provisioned_cert_chain: Option<&'a [u8]>,
    retrieved_slot_id: Option<u8>,
    retrieved_cert_chain: CertChainBuf,
}

impl<'a> PeerCertStore<'a> {
    pub fn new(provisioned_cert_chain: Option<&'a [u8]>) -> Self {
        Self {
            provisioned_cert_chain,
            retrieved_slot_id: None,
            retrieved_cert_chain: CertChainBuf::new(),
        }
    }

    pub fn has_provisioned_chain(&self) -> bool {
        self.provisioned_cert_chain.is_some()
    }

    /// Begin caching a freshly retrieved chain for `slot_id`.
    pub fn start_retrieval(&mut self, slot_id: u8) -> CertStoreResult<()> {
        if slot_id >= MAX_CERT_SLOTS_SUPPORTED {
            Err(CertStoreError::InvalidSlotId)?;
        }
        self.retrieved_slot_id = Some(slot_id);
        self.retrieved_cert_chain.clear();
        Ok(())
    }

    pub fn append_chain_portion(&mut self, portion: &[u8]) -> CertStoreResult<()> {
        self.retrieved_cert_chain
            .try_extend_from_slice(portion)
            .map_err(|_| CertStoreError::ChainTooLarge)
    }

    pub fn drop_retrieval(&mut self) {
        self.retrieved_slot_id = None;
        self.retrieved_cert_chain.clear();
    }

    /// Chain to use for `slot_id`; 0xFF selects the provisioned chain.
    pub fn cert_chain(&self, slot_id: u8) -> CertStoreResult<&[u8]> {
        if slot_id == PROVISIONED_SLOT_ID {
            return self
                .provisioned_cert_chain
                .ok_or(CertStoreError::ChainNotAvailable);
        }
        if slot_id >= MAX_CERT_SLOTS_SUPPORTED {
            Err(CertStoreError::InvalidSlotId)?;
        }
        match self.retrieved_slot_id {
            Some(cached) if cached == slot_id && !self.retrieved_cert_chain.is_empty() => {
                Ok(self.retrieved_cert_chain.as_slice())
            }
            _ => Err(CertStoreError::ChainNotAvailable),
        }
    }
}

/// Local (requester) certificate chains used to answer encapsulated
/// mutual-auth requests. Borrowed from the embedding configuration.
#[derive(Clone, Copy, Default)]
pub(crate) struct LocalCertStore<'a> {
    slots: [Option<&'a [u8]>; MAX_CERT_SLOTS_SUPPORTED as usize],
}

impl<'a> LocalCertStore<'a> {
    pub fn new(slots: [Option<&'a [u8]>; MAX_CERT_SLOTS_SUPPORTED as usize]) -> Self {
        Self { slots }
    }

    pub fn cert_chain(&self, slot_id: u8) -> CertStoreResult<&'a [u8]> {
        if slot_id >= MAX_CERT_SLOTS_SUPPORTED {
            Err(CertStoreError::InvalidSlotId)?;
        }
        self.slots[slot_id as usize].ok_or(CertStoreError::ChainNotAvailable)
    }

    pub fn slot_mask(&self) -> u8 {
        let mut mask = 0u8;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_some() {
                mask |= 1 << i;
            }
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_cert_store_slots() {
        let provisioned = [0xC0u8; 16];
        let mut store = PeerCertStore::new(Some(&provisioned));

        assert_eq!(store.cert_chain(PROVISIONED_SLOT_ID).unwrap(), &provisioned);
        assert_eq!(store.cert_chain(0), Err(CertStoreError::ChainNotAvailable));
        assert_eq!(store.cert_chain(8), Err(CertStoreError::InvalidSlotId));

        store.start_retrieval(2).unwrap();
        store.append_chain_portion(&[1, 2, 3]).unwrap();
        store.append_chain_portion(&[4]).unwrap();
        assert_eq!(store.cert_chain(2).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(store.cert_chain(1), Err(CertStoreError::ChainNotAvailable));

        store.drop_retrieval();
        assert_eq!(store.cert_chain(2), Err(CertStoreError::ChainNotAvailable));
    }

    #[test]
    fn test_local_cert_store_mask() {
        let chain = [0u8; 8];
        let mut slots: [Option<&[u8]>; 8] = [None; 8];
        slots[0] = Some(&chain);
        slots[3] = Some(&chain);
        let store = LocalCertStore::new(slots);
        assert_eq!(store.slot_mask(), 0b0000_1001);
        assert!(store.cert_chain(0).is_ok());
        assert_eq!(store.cert_chain(1), Err(CertStoreError::ChainNotAvailable));
    }
}
