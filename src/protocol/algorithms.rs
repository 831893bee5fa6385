// Licensed under the Apache-2.0 license

use crate::error::{SpdmError, SpdmResult};
use bitfield::bitfield;
use zerocopy::{FromBytes, Immutable, IntoBytes};

// Measurement Specification field
bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Default, Clone, Copy)]
#[repr(C)]
pub struct MeasurementSpecification(u8);
impl Debug;
u8;
pub dmtf_measurement_spec, set_dmtf_measurement_spec: 0,0;
reserved, _: 7,1;
}

// Other Param Support field for request and response
bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Default, Clone, Copy)]
#[repr(C)]
pub struct OtherParamSupport(u8);
impl Debug;
u8;
pub opaque_data_fmt0, set_opaque_data_fmt0: 0,0;
pub opaque_data_fmt1, set_opaque_data_fmt1: 1,1;
reserved, _: 7,2;
}

// Measurement Hash Algorithm field
bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Default, Clone, Copy)]
#[repr(C)]
pub struct MeasurementHashAlgo(u32);
impl Debug;
u8;
pub raw_bit_stream, set_raw_bit_stream: 0,0;
pub tpm_alg_sha_256, set_tpm_alg_sha_256: 1,1;
pub tpm_alg_sha_384, set_tpm_alg_sha_384: 2,2;
pub tpm_alg_sha_512, set_tpm_alg_sha_512: 3,3;
reserved, _: 31,4;
}

// Base Asymmetric Algorithm field
bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Default, Clone, Copy)]
#[repr(C)]
pub struct BaseAsymAlgo(u32);
impl Debug;
u8;
pub tpm_alg_rsassa_2048, set_tpm_alg_rsassa_2048: 0,0;
pub tpm_alg_rsapss_2048, set_tpm_alg_rsapss_2048: 1,1;
pub tpm_alg_rsassa_3072, set_tpm_alg_rsassa_3072: 2,2;
pub tpm_alg_rsapss_3072, set_tpm_alg_rsapss_3072: 3,3;
pub tpm_alg_ecdsa_ecc_nist_p256, set_tpm_alg_ecdsa_ecc_nist_p256: 4,4;
pub tpm_alg_rsassa_4096, set_tpm_alg_rsassa_4096: 5,5;
pub tpm_alg_rsapss_4096, set_tpm_alg_rsapss_4096: 6,6;
pub tpm_alg_ecdsa_ecc_nist_p384, set_tpm_alg_ecdsa_ecc_nist_p384: 7,7;
pub tpm_alg_ecdsa_ecc_nist_p521, set_tpm_alg_ecdsa_ecc_nist_p521: 8,8;
reserved, _: 31,9;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaseAsymAlgoType {
    TpmAlgRsassa2048,
    TpmAlgRsapss2048,
    TpmAlgRsassa3072,
    TpmAlgRsapss3072,
    TpmAlgEcdsaEccNistP256,
    TpmAlgRsassa4096,
    TpmAlgRsapss4096,
    TpmAlgEcdsaEccNistP384,
    TpmAlgEcdsaEccNistP521,
}

impl From<BaseAsymAlgoType> for u32 {
    fn from(base_asym_algo_type: BaseAsymAlgoType) -> u32 {
        1 << (base_asym_algo_type as u32)
    }
}

impl BaseAsymAlgoType {
    /// Raw signature size in bytes for the algorithm.
    pub fn signature_size(&self) -> usize {
        match self {
            BaseAsymAlgoType::TpmAlgRsassa2048 | BaseAsymAlgoType::TpmAlgRsapss2048 => 256,
            BaseAsymAlgoType::TpmAlgRsassa3072 | BaseAsymAlgoType::TpmAlgRsapss3072 => 384,
            BaseAsymAlgoType::TpmAlgRsassa4096 | BaseAsymAlgoType::TpmAlgRsapss4096 => 512,
            BaseAsymAlgoType::TpmAlgEcdsaEccNistP256 => 64,
            BaseAsymAlgoType::TpmAlgEcdsaEccNistP384 => 96,
            BaseAsymAlgoType::TpmAlgEcdsaEccNistP521 => 132,
        }
    }
}

// Base Hash Algorithm field
bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Default, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct BaseHashAlgo(u32);
impl Debug;
u8;
pub tpm_alg_sha_256, set_tpm_alg_sha_256: 0,0;
pub tpm_alg_sha_384, set_tpm_alg_sha_384: 1,1;
pub tpm_alg_sha_512, set_tpm_alg_sha_512: 2,2;
reserved, _: 31,3;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaseHashAlgoType {
    TpmAlgSha256,
    TpmAlgSha384,
    TpmAlgSha512,
}

impl From<BaseHashAlgoType> for BaseHashAlgo {
    fn from(base_hash_algo_type: BaseHashAlgoType) -> Self {
        BaseHashAlgo(1 << (base_hash_algo_type as u32))
    }
}

impl BaseHashAlgoType {
    /// Digest size in bytes for the algorithm.
    pub fn hash_size(&self) -> usize {
        match self {
            BaseHashAlgoType::TpmAlgSha256 => 32,
            BaseHashAlgoType::TpmAlgSha384 => 48,
            BaseHashAlgoType::TpmAlgSha512 => 64,
        }
    }
}

// AlgSupported field for DHE named group
bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Default, Clone, Copy)]
#[repr(C)]
pub struct DheNamedGroup(u16);
impl Debug;
u8;
pub ffdhe2048, set_ffdhe2048: 0,0;
pub ffdhe3072, set_ffdhe3072: 1,1;
pub ffdhe4096, set_ffdhe4096: 2,2;
pub secp256r1, set_secp256r1: 3,3;
pub secp384r1, set_secp384r1: 4,4;
pub secp521r1, set_secp521r1: 5,5;
reserved, _: 15,6;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DheGroupType {
    Ffdhe2048,
    Ffdhe3072,
    Ffdhe4096,
    Secp256r1,
    Secp384r1,
    Secp521r1,
}

impl From<DheGroupType> for u16 {
    fn from(dhe_group_type: DheGroupType) -> u16 {
        1 << (dhe_group_type as u16)
    }
}

impl DheGroupType {
    /// Exchange data size in bytes (uncompressed point or modulus).
    pub fn exchange_data_size(&self) -> usize {
        match self {
            DheGroupType::Ffdhe2048 => 256,
            DheGroupType::Ffdhe3072 => 384,
            DheGroupType::Ffdhe4096 => 512,
            DheGroupType::Secp256r1 => 64,
            DheGroupType::Secp384r1 => 96,
            DheGroupType::Secp521r1 => 132,
        }
    }
}

// AlgSupported field for AEAD cipher suite
bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Default, Clone, Copy)]
#[repr(C)]
pub struct AeadCipherSuite(u16);
impl Debug;
u8;
pub aes128_gcm, set_aes128_gcm: 0,0;
pub aes256_gcm, set_aes256_gcm: 1,1;
pub chacha20_poly1305, set_chacha20_poly1305: 2,2;
reserved, _: 15,3;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AeadCipherSuiteType {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl From<AeadCipherSuiteType> for u16 {
    fn from(aead_cipher_suite_type: AeadCipherSuiteType) -> u16 {
        1 << (aead_cipher_suite_type as u16)
    }
}

impl AeadCipherSuiteType {
    pub fn key_size(&self) -> usize {
        match self {
            AeadCipherSuiteType::Aes128Gcm => 16,
            AeadCipherSuiteType::Aes256Gcm | AeadCipherSuiteType::Chacha20Poly1305 => 32,
        }
    }

    pub fn iv_size(&self) -> usize {
        12
    }
}

// AlgSupported field for Request Base Asym Algorithm
bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Default, Clone, Copy)]
#[repr(C)]
pub struct ReqBaseAsymAlg(u16);
impl Debug;
u8;
pub tpm_alg_rsa_ssa_2048, set_tpm_alg_rsa_ssa_2048: 0,0;
pub tpm_alg_rsa_pss_2048, set_tpm_alg_rsa_pss_2048: 1,1;
pub tpm_alg_rsa_ssa_3072, set_tpm_alg_rsa_ssa_3072: 2,2;
pub tpm_alg_rsa_pss_3072, set_tpm_alg_rsa_pss_3072: 3,3;
pub tpm_alg_ecdsa_ecc_nist_p256, set_tpm_alg_ecdsa_ecc_nist_p256: 4,4;
pub tpm_alg_rsa_ssa_4096, set_tpm_alg_rsa_ssa_4096: 5,5;
pub tpm_alg_rsa_pss_4096, set_tpm_alg_rsa_pss_4096: 6,6;
pub tpm_alg_ecdsa_ecc_nist_p384, set_tpm_alg_ecdsa_ecc_nist_p384: 7,7;
reserved, _: 15,8;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReqBaseAsymAlgType {
    TpmAlgRsaSsa2048,
    TpmAlgRsaPss2048,
    TpmAlgRsaSsa3072,
    TpmAlgRsaPss3072,
    TpmAlgEcdsaEccNistP256,
    TpmAlgRsaSsa4096,
    TpmAlgRsaPss4096,
    TpmAlgEcdsaEccNistP384,
}

impl From<ReqBaseAsymAlgType> for u16 {
    fn from(req_base_asym_alg_type: ReqBaseAsymAlgType) -> u16 {
        1 << (req_base_asym_alg_type as u16)
    }
}

impl ReqBaseAsymAlgType {
    pub fn signature_size(&self) -> usize {
        match self {
            ReqBaseAsymAlgType::TpmAlgRsaSsa2048 | ReqBaseAsymAlgType::TpmAlgRsaPss2048 => 256,
            ReqBaseAsymAlgType::TpmAlgRsaSsa3072 | ReqBaseAsymAlgType::TpmAlgRsaPss3072 => 384,
            ReqBaseAsymAlgType::TpmAlgRsaSsa4096 | ReqBaseAsymAlgType::TpmAlgRsaPss4096 => 512,
            ReqBaseAsymAlgType::TpmAlgEcdsaEccNistP256 => 64,
            ReqBaseAsymAlgType::TpmAlgEcdsaEccNistP384 => 96,
        }
    }
}

// AlgSupported field for Key Schedule
bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Default, Clone, Copy)]
#[repr(C)]
pub struct KeySchedule(u16);
impl Debug;
u8;
pub spdm_key_schedule, set_spdm_key_schedule: 0,0;
pub reserved, _: 15,1;
}

/// The set of algorithms a device supports, or (when every field has
/// exactly one bit set) the negotiated selection.
#[derive(Debug, Clone, Default)]
pub struct DeviceAlgorithms {
    pub measurement_spec: MeasurementSpecification,
    pub other_param_support: OtherParamSupport,
    pub measurement_hash_algo: MeasurementHashAlgo,
    pub base_asym_algo: BaseAsymAlgo,
    pub base_hash_algo: BaseHashAlgo,
    pub dhe_group: DheNamedGroup,
    pub aead_cipher_suite: AeadCipherSuite,
    pub req_base_asym_algo: ReqBaseAsymAlg,
    pub key_schedule: KeySchedule,
}

impl DeviceAlgorithms {
    pub fn num_alg_struct_tables(&self) -> usize {
        let mut num = 0;
        if self.dhe_group.0 != 0 {
            num += 1;
        }
        if self.aead_cipher_suite.0 != 0 {
            num += 1;
        }
        if self.req_base_asym_algo.0 != 0 {
            num += 1;
        }
        if self.key_schedule.0 != 0 {
            num += 1;
        }
        num
    }

    /// Selected base hash algorithm; requires exactly one bit set.
    pub fn base_hash_algo_type(&self) -> SpdmResult<BaseHashAlgoType> {
        match single_bit(self.base_hash_algo.0)? {
            0 => Ok(BaseHashAlgoType::TpmAlgSha256),
            1 => Ok(BaseHashAlgoType::TpmAlgSha384),
            2 => Ok(BaseHashAlgoType::TpmAlgSha512),
            _ => Err(SpdmError::Unsupported),
        }
    }

    pub fn base_asym_algo_type(&self) -> SpdmResult<BaseAsymAlgoType> {
        match single_bit(self.base_asym_algo.0)? {
            0 => Ok(BaseAsymAlgoType::TpmAlgRsassa2048),
            1 => Ok(BaseAsymAlgoType::TpmAlgRsapss2048),
            2 => Ok(BaseAsymAlgoType::TpmAlgRsassa3072),
            3 => Ok(BaseAsymAlgoType::TpmAlgRsapss3072),
            4 => Ok(BaseAsymAlgoType::TpmAlgEcdsaEccNistP256),
            5 => Ok(BaseAsymAlgoType::TpmAlgRsassa4096),
            6 => Ok(BaseAsymAlgoType::TpmAlgRsapss4096),
            7 => Ok(BaseAsymAlgoType::TpmAlgEcdsaEccNistP384),
            8 => Ok(BaseAsymAlgoType::TpmAlgEcdsaEccNistP521),
            _ => Err(SpdmError::Unsupported),
        }
    }

    pub fn dhe_group_type(&self) -> SpdmResult<DheGroupType> {
        match single_bit(self.dhe_group.0 as u32)? {
            0 => Ok(DheGroupType::Ffdhe2048),
            1 => Ok(DheGroupType::Ffdhe3072),
            2 => Ok(DheGroupType::Ffdhe4096),
            3 => Ok(DheGroupType::Secp256r1),
            4 => Ok(DheGroupType::Secp384r1),
            5 => Ok(DheGroupType::Secp521r1),
            _ => Err(SpdmError::Unsupported),
        }
    }

    pub fn aead_cipher_suite_type(&self) -> SpdmResult<AeadCipherSuiteType> {
        match single_bit(self.aead_cipher_suite.0 as u32)? {
            0 => Ok(AeadCipherSuiteType::Aes128Gcm),
            1 => Ok(AeadCipherSuiteType::Aes256Gcm),
            2 => Ok(AeadCipherSuiteType::Chacha20Poly1305),
            _ => Err(SpdmError::Unsupported),
        }
    }

    pub fn req_base_asym_algo_type(&self) -> SpdmResult<ReqBaseAsymAlgType> {
        match single_bit(self.req_base_asym_algo.0 as u32)? {
            0 => Ok(ReqBaseAsymAlgType::TpmAlgRsaSsa2048),
            1 => Ok(ReqBaseAsymAlgType::TpmAlgRsaPss2048),
            2 => Ok(ReqBaseAsymAlgType::TpmAlgRsaSsa3072),
            3 => Ok(ReqBaseAsymAlgType::TpmAlgRsaPss3072),
            4 => Ok(ReqBaseAsymAlgType::TpmAlgEcdsaEccNistP256),
            5 => Ok(ReqBaseAsymAlgType::TpmAlgRsaSsa4096),
            6 => Ok(ReqBaseAsymAlgType::TpmAlgRsaPss4096),
            7 => Ok(ReqBaseAsymAlgType::TpmAlgEcdsaEccNistP384),
            _ => Err(SpdmError::Unsupported),
        }
    }

    /// Measurement summary hash size in bytes, 0 when no measurement
    /// hash was requested or none is negotiated.
    pub fn measurement_summary_hash_size(&self, measurement_hash_type: u8) -> usize {
        if measurement_hash_type == 0 || self.measurement_hash_algo.0 == 0 {
            return 0;
        }
        if self.measurement_hash_algo.tpm_alg_sha_512() != 0 {
            64
        } else if self.measurement_hash_algo.tpm_alg_sha_384() != 0 {
            48
        } else {
            32
        }
    }
}

// Raw constructors/accessors for use outside this module; the
// bitfield tuple fields themselves are module-private.
macro_rules! raw_accessors {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(impl $name {
            pub fn new(raw: $ty) -> Self {
                Self(raw)
            }

            pub fn raw(&self) -> $ty {
                self.0
            }
        })*
    };
}

raw_accessors! {
    MeasurementSpecification: u8,
    OtherParamSupport: u8,
    MeasurementHashAlgo: u32,
    BaseAsymAlgo: u32,
    BaseHashAlgo: u32,
    DheNamedGroup: u16,
    AeadCipherSuite: u16,
    ReqBaseAsymAlg: u16,
    KeySchedule: u16,
}

fn single_bit(value: u32) -> SpdmResult<u32> {
    if value.count_ones() != 1 {
        Err(SpdmError::Unsupported)?;
    }
    Ok(value.trailing_zeros())
}

/// Requester-supported algorithm sets offered in NEGOTIATE_ALGORITHMS.
#[derive(Debug, Clone)]
pub struct LocalDeviceAlgorithms {
    pub device_algorithms: DeviceAlgorithms,
}

impl Default for LocalDeviceAlgorithms {
    fn default() -> Self {
        let mut algorithms = DeviceAlgorithms::default();
        algorithms.measurement_spec.set_dmtf_measurement_spec(1);
        algorithms.other_param_support.set_opaque_data_fmt1(1);
        algorithms.measurement_hash_algo.set_tpm_alg_sha_384(1);
        algorithms
            .base_asym_algo
            .set_tpm_alg_ecdsa_ecc_nist_p384(1);
        algorithms.base_hash_algo.set_tpm_alg_sha_384(1);
        algorithms.base_hash_algo.set_tpm_alg_sha_256(1);
        algorithms.dhe_group.set_secp384r1(1);
        algorithms.dhe_group.set_secp256r1(1);
        algorithms.aead_cipher_suite.set_aes256_gcm(1);
        algorithms
            .req_base_asym_algo
            .set_tpm_alg_ecdsa_ecc_nist_p384(1);
        algorithms.key_schedule.set_spdm_key_schedule(1);
        LocalDeviceAlgorithms {
            device_algorithms: algorithms,
        }
    }
}

/// Façade-side validation of a negotiated algorithm selection.
///
/// The selection must name exactly one hash with a non-zero size, the
/// SPDM key schedule and (when measurements are in play) the DMTF
/// measurement specification.
pub(crate) fn validate_negotiated_algorithms(
    algorithms: &DeviceAlgorithms,
    peer_meas_cap: bool,
) -> SpdmResult<()> {
    let hash_algo = algorithms.base_hash_algo_type()?;
    if hash_algo.hash_size() == 0 {
        Err(SpdmError::Unsupported)?;
    }
    if algorithms.key_schedule.spdm_key_schedule() != 1
        || algorithms.key_schedule.0.count_ones() != 1
    {
        Err(SpdmError::Unsupported)?;
    }
    if peer_meas_cap {
        if algorithms.measurement_spec.dmtf_measurement_spec() != 1 {
            Err(SpdmError::Unsupported)?;
        }
        if algorithms.measurement_hash_algo.0.count_ones() != 1 {
            Err(SpdmError::Unsupported)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_bit_selection() {
        let mut algorithms = DeviceAlgorithms::default();
        algorithms.base_hash_algo.set_tpm_alg_sha_384(1);
        assert_eq!(
            algorithms.base_hash_algo_type().unwrap(),
            BaseHashAlgoType::TpmAlgSha384
        );

        algorithms.base_hash_algo.set_tpm_alg_sha_256(1);
        assert!(algorithms.base_hash_algo_type().is_err());
    }

    #[test]
    fn test_size_tables() {
        assert_eq!(BaseHashAlgoType::TpmAlgSha256.hash_size(), 32);
        assert_eq!(BaseHashAlgoType::TpmAlgSha512.hash_size(), 64);
        assert_eq!(BaseAsymAlgoType::TpmAlgEcdsaEccNistP384.signature_size(), 96);
        assert_eq!(BaseAsymAlgoType::TpmAlgRsassa4096.signature_size(), 512);
        assert_eq!(DheGroupType::Secp384r1.exchange_data_size(), 96);
        assert_eq!(AeadCipherSuiteType::Aes256Gcm.key_size(), 32);
    }

    #[test]
    fn test_validate_negotiated_algorithms() {
        let mut algorithms = DeviceAlgorithms::default();
        algorithms.base_hash_algo.set_tpm_alg_sha_384(1);
        algorithms.key_schedule.set_spdm_key_schedule(1);
        algorithms.measurement_spec.set_dmtf_measurement_spec(1);
        algorithms.measurement_hash_algo.set_tpm_alg_sha_384(1);
        assert!(validate_negotiated_algorithms(&algorithms, true).is_ok());

        let mut no_key_schedule = algorithms.clone();
        no_key_schedule.key_schedule = KeySchedule(0);
        assert!(validate_negotiated_algorithms(&no_key_schedule, false).is_err());

        let mut bad_meas = algorithms.clone();
        bad_meas.measurement_spec = MeasurementSpecification(0);
        assert!(validate_negotiated_algorithms(&bad_meas, true).is_err());
        assert!(validate_negotiated_algorithms(&bad_meas, false).is_ok());
    }
}
