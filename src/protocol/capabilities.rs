// Licensed under the Apache-2.0 license

use bitfield::bitfield;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const MIN_DATA_TRANSFER_SIZE_V12: u32 = 42;

// Maximum cryptographic processing timeout exponent a peer may report
pub const MAX_CT_EXPONENT: u8 = 31;

/// Measurements Capability
#[derive(Debug, Clone, Copy)]
pub enum MeasCapability {
    NoMeasurement = 0,
    MeasurementsWithNoSignature = 1,
    MeasurementsWithSignature = 2,
    Reserved = 3,
}

/// Pre-shared Key(PSK) Capability
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PskCapability {
    // PSK capability not supported
    NoPsk = 0,
    // PSK capability supported without session context
    PskWithNoContext = 1,
    // PSK capability supported with session context (responder only)
    PskWithContext = 2,
    // Reserved
    Reserved = 3,
}

/// Device Capabilities
#[derive(Default, Debug, Clone, Copy)]
pub struct DeviceCapabilities {
    pub ct_exponent: u8,
    pub flags: CapabilityFlags,
    // Only used for >= SPDM 1.2
    pub data_transfer_size: u32,
    pub max_spdm_msg_size: u32,
}

bitfield! {
#[derive(FromBytes, IntoBytes, Immutable, Clone, Copy)]
#[repr(C)]
pub struct CapabilityFlags(u32);
impl Debug;
u8;
pub cache_cap, set_cache_cap: 0, 0;
pub cert_cap, set_cert_cap: 1, 1;
pub chal_cap, set_chal_cap: 2, 2;
pub meas_cap, set_meas_cap: 4, 3;
pub meas_fresh_cap, set_meas_fresh_cap: 5, 5;
pub encrypt_cap, set_encrypt_cap: 6, 6;
pub mac_cap, set_mac_cap: 7, 7;
pub mut_auth_cap, set_mut_auth_cap: 8, 8;
pub key_ex_cap, set_key_ex_cap: 9, 9;
pub psk_cap, set_psk_cap: 11, 10;
pub encap_cap, set_encap_cap: 12, 12;
pub hbeat_cap, set_hbeat_cap: 13, 13;
pub key_upd_cap, set_key_upd_cap: 14, 14;
pub handshake_in_the_clear_cap, set_handshake_in_the_clear_cap: 15, 15;
pub pub_key_id_cap, set_pub_key_id_cap: 16, 16;
pub chunk_cap, set_chunk_cap: 17, 17;
pub alias_cert_cap, set_alias_cert_cap: 18, 18;
reserved, _: 31, 19;
}

impl CapabilityFlags {
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        // Requester-side defaults: authenticate the peer, establish
        // encrypted+authenticated sessions, rotate keys, heartbeat.
        let mut capability_flags = CapabilityFlags::new(0);
        capability_flags.set_chal_cap(1);
        capability_flags.set_encrypt_cap(1);
        capability_flags.set_mac_cap(1);
        capability_flags.set_key_ex_cap(1);
        capability_flags.set_psk_cap(PskCapability::PskWithNoContext as u8);
        capability_flags.set_encap_cap(1);
        capability_flags.set_hbeat_cap(1);
        capability_flags.set_key_upd_cap(1);
        capability_flags.set_mut_auth_cap(1);
        capability_flags.set_cert_cap(1);

        capability_flags
    }
}

/// Validate the capability flags a responder reported.
///
/// Mirrors the request-flag compatibility rules on the responder side
/// of the protocol for the subset of capabilities this requester uses.
pub(crate) fn rsp_flag_compatible(flags: &CapabilityFlags) -> bool {
    // Checks that originate from key exchange capabilities
    if flags.key_ex_cap() == 1 || flags.psk_cap() != PskCapability::NoPsk as u8 {
        if flags.mac_cap() == 0 && flags.encrypt_cap() == 0 {
            return false;
        }
    } else if flags.mac_cap() == 1
        || flags.encrypt_cap() == 1
        || flags.handshake_in_the_clear_cap() == 1
        || flags.hbeat_cap() == 1
        || flags.key_upd_cap() == 1
    {
        return false;
    }

    if flags.key_ex_cap() == 0
        && flags.psk_cap() == PskCapability::PskWithNoContext as u8
        && flags.handshake_in_the_clear_cap() == 1
    {
        return false;
    }

    // Checks that originate from certificate or public key capabilities
    if flags.cert_cap() == 1 || flags.pub_key_id_cap() == 1 {
        // Certificate capabilities and public key capabilities can not both be set
        if flags.cert_cap() == 1 && flags.pub_key_id_cap() == 1 {
            return false;
        }
    } else if flags.chal_cap() == 1 || flags.key_ex_cap() == 1 {
        // Challenge and key exchange require a certificate or public key
        return false;
    }

    // Mutual authentication requires encapsulated requests
    if flags.mut_auth_cap() == 1 && flags.encap_cap() == 0 {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_requester_flags() {
        let flags = CapabilityFlags::default();
        assert_eq!(flags.chal_cap(), 1);
        assert_eq!(flags.key_ex_cap(), 1);
        assert_eq!(flags.key_upd_cap(), 1);
        assert_eq!(flags.psk_cap(), PskCapability::PskWithNoContext as u8);
    }

    #[test]
    fn test_rsp_flag_compatible() {
        let mut flags = CapabilityFlags::new(0);
        flags.set_cert_cap(1);
        flags.set_chal_cap(1);
        flags.set_key_ex_cap(1);
        flags.set_mac_cap(1);
        flags.set_encrypt_cap(1);
        assert!(rsp_flag_compatible(&flags));

        // Key exchange without MAC or encryption is illegal
        flags.set_mac_cap(0);
        flags.set_encrypt_cap(0);
        assert!(!rsp_flag_compatible(&flags));

        // Challenge without a certificate is illegal
        let mut flags = CapabilityFlags::new(0);
        flags.set_chal_cap(1);
        assert!(!rsp_flag_compatible(&flags));

        // Heartbeat with no session capability is illegal
        let mut flags = CapabilityFlags::new(0);
        flags.set_hbeat_cap(1);
        assert!(!rsp_flag_compatible(&flags));
    }
}
