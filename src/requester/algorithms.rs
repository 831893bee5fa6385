// Licensed under the Apache-2.0 license

use crate::codec::{Codec, CommonCodec, MessageBuf};
use crate::error::{SpdmError, SpdmResult};
use crate::protocol::algorithms::{
    validate_negotiated_algorithms, AeadCipherSuite, BaseAsymAlgo, BaseHashAlgo, DeviceAlgorithms,
    DheNamedGroup, KeySchedule, MeasurementHashAlgo, MeasurementSpecification, OtherParamSupport,
    ReqBaseAsymAlg,
};
use crate::protocol::common::{ReqRespCode, SpdmMsgHdr};
use crate::requester::{RequesterContext, MAX_SPDM_MSG_SIZE};
use crate::state::ConnectionState;
use crate::transcript::TranscriptContext;
use core::mem::size_of;
use log::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes};

// AlgType identifiers for the algorithm structure tables
const ALG_TYPE_DHE: u8 = 2;
const ALG_TYPE_AEAD: u8 = 3;
const ALG_TYPE_REQ_BASE_ASYM: u8 = 4;
const ALG_TYPE_KEY_SCHEDULE: u8 = 5;

// FixedAlgCount = 2, no external algorithms
const ALG_COUNT_FIXED: u8 = 0x20;

#[allow(dead_code)]
#[derive(FromBytes, IntoBytes, Immutable, Default)]
#[repr(C, packed)]
struct NegotiateAlgorithmsBase {
    length: u16,
    measurement_specification: u8,
    other_param_support: u8,
    base_asym_algo: u32,
    base_hash_algo: u32,
    reserved: [u8; 12],
    ext_asym_count: u8,
    ext_hash_count: u8,
    reserved2: [u8; 2],
}

impl CommonCodec for NegotiateAlgorithmsBase {}

#[allow(dead_code)]
#[derive(FromBytes, IntoBytes, Immutable, Default)]
#[repr(C, packed)]
struct AlgorithmsRspBase {
    length: u16,
    measurement_specification_sel: u8,
    other_param_sel: u8,
    measurement_hash_algo: u32,
    base_asym_sel: u32,
    base_hash_sel: u32,
    reserved: [u8; 12],
    ext_asym_sel_count: u8,
    ext_hash_sel_count: u8,
    reserved2: [u8; 2],
}

impl CommonCodec for AlgorithmsRspBase {}

#[derive(FromBytes, IntoBytes, Immutable)]
#[repr(C, packed)]
struct AlgStructTable {
    alg_type: u8,
    alg_count: u8,
    alg_supported: u16,
}

impl CommonCodec for AlgStructTable {}

impl<'a> RequesterContext<'a> {
    /// Offer the local algorithm sets and validate the responder's
    /// selection. Each selected field must be a single bit out of what
    /// was offered.
    pub async fn negotiate_algorithms(&mut self) -> SpdmResult<()> {
        let mut attempts = 0u8;
        loop {
            match self.try_negotiate_algorithms().await {
                Err(SpdmError::NoResponse) if attempts < self.retry_times => attempts += 1,
                result => return result,
            }
        }
    }

    async fn try_negotiate_algorithms(&mut self) -> SpdmResult<()> {
        if self.connection_state() != ConnectionState::AfterCapabilities {
            Err(SpdmError::Unsupported)?;
        }
        self.reset_transcript_via_request_code(ReqRespCode::NegotiateAlgorithms);

        let connection_version = self.connection_version();
        let local = self.local_algorithms.device_algorithms.clone();
        let num_tables = local.num_alg_struct_tables();

        let mut msg_storage = [0u8; MAX_SPDM_MSG_SIZE];
        let mut msg_buf = MessageBuf::new(&mut msg_storage);
        self.prepare_request_buffer(&mut msg_buf)?;

        let length = (size_of::<SpdmMsgHdr>()
            + size_of::<NegotiateAlgorithmsBase>()
            + num_tables * size_of::<AlgStructTable>()) as u16;

        SpdmMsgHdr::new(
            connection_version,
            ReqRespCode::NegotiateAlgorithms,
            num_tables as u8,
            0,
        )
        .encode(&mut msg_buf)
        .map_err(|_| SpdmError::DeviceError)?;

        NegotiateAlgorithmsBase {
            length,
            measurement_specification: local.measurement_spec.raw(),
            other_param_support: local.other_param_support.raw(),
            base_asym_algo: local.base_asym_algo.raw(),
            base_hash_algo: local.base_hash_algo.raw(),
            reserved: [0; 12],
            ext_asym_count: 0,
            ext_hash_count: 0,
            reserved2: [0; 2],
        }
        .encode(&mut msg_buf)
        .map_err(|_| SpdmError::DeviceError)?;

        for (alg_type, alg_supported) in [
            (ALG_TYPE_DHE, local.dhe_group.raw()),
            (ALG_TYPE_AEAD, local.aead_cipher_suite.raw()),
            (ALG_TYPE_REQ_BASE_ASYM, local.req_base_asym_algo.raw()),
            (ALG_TYPE_KEY_SCHEDULE, local.key_schedule.raw()),
        ] {
            if alg_supported != 0 {
                AlgStructTable {
                    alg_type,
                    alg_count: ALG_COUNT_FIXED,
                    alg_supported,
                }
                .encode(&mut msg_buf)
                .map_err(|_| SpdmError::DeviceError)?;
            }
        }

        let mark = self.transcript.checkpoint(TranscriptContext::A);
        let result = self.exchange_algorithms(&local, &mut msg_buf).await;
        if result.is_err() {
            let _ = self.transcript.rollback_to(TranscriptContext::A, mark);
        }
        result
    }

    async fn exchange_algorithms(
        &mut self,
        local: &DeviceAlgorithms,
        msg_buf: &mut MessageBuf<'_>,
    ) -> SpdmResult<()> {
        let connection_version = self.connection_version();
        let req_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        self.transcript
            .append(TranscriptContext::A, req_bytes)
            .map_err(|_| SpdmError::SecurityViolation)?;

        self.send_message(None, msg_buf).await?;
        let rsp_hdr = self
            .receive_and_validate(
                None,
                msg_buf,
                connection_version,
                ReqRespCode::NegotiateAlgorithms,
            )
            .await?;

        let rsp_base = AlgorithmsRspBase::decode(msg_buf).map_err(|_| SpdmError::DeviceError)?;
        if rsp_base.ext_asym_sel_count != 0 || rsp_base.ext_hash_sel_count != 0 {
            Err(SpdmError::DeviceError)?;
        }

        let mut selected = DeviceAlgorithms {
            measurement_spec: MeasurementSpecification::new(rsp_base.measurement_specification_sel),
            other_param_support: OtherParamSupport::new(rsp_base.other_param_sel),
            measurement_hash_algo: MeasurementHashAlgo::new(rsp_base.measurement_hash_algo),
            base_asym_algo: BaseAsymAlgo::new(rsp_base.base_asym_sel),
            base_hash_algo: BaseHashAlgo::new(rsp_base.base_hash_sel),
            dhe_group: DheNamedGroup::new(0),
            aead_cipher_suite: AeadCipherSuite::new(0),
            req_base_asym_algo: ReqBaseAsymAlg::new(0),
            key_schedule: KeySchedule::new(0),
        };

        let num_rsp_tables = rsp_hdr.param1() as usize;
        for _ in 0..num_rsp_tables {
            let table = AlgStructTable::decode(msg_buf).map_err(|_| SpdmError::DeviceError)?;
            let alg_supported = table.alg_supported;
            match table.alg_type {
                ALG_TYPE_DHE => selected.dhe_group = DheNamedGroup::new(alg_supported),
                ALG_TYPE_AEAD => selected.aead_cipher_suite = AeadCipherSuite::new(alg_supported),
                ALG_TYPE_REQ_BASE_ASYM => {
                    selected.req_base_asym_algo = ReqBaseAsymAlg::new(alg_supported)
                }
                ALG_TYPE_KEY_SCHEDULE => selected.key_schedule = KeySchedule::new(alg_supported),
                _ => Err(SpdmError::DeviceError)?,
            }
        }

        // Selections must be subsets of what was offered
        if selected.base_asym_algo.raw() & !local.base_asym_algo.raw() != 0
            || selected.base_hash_algo.raw() & !local.base_hash_algo.raw() != 0
            || selected.measurement_spec.raw() & !local.measurement_spec.raw() != 0
            || selected.dhe_group.raw() & !local.dhe_group.raw() != 0
            || selected.aead_cipher_suite.raw() & !local.aead_cipher_suite.raw() != 0
            || selected.req_base_asym_algo.raw() & !local.req_base_asym_algo.raw() != 0
            || selected.key_schedule.raw() & !local.key_schedule.raw() != 0
        {
            Err(SpdmError::DeviceError)?;
        }
        selected.base_hash_algo_type().map_err(|_| SpdmError::DeviceError)?;
        selected.base_asym_algo_type().map_err(|_| SpdmError::DeviceError)?;

        let peer_meas_cap = self.peer_capabilities().meas_cap() != 0;
        validate_negotiated_algorithms(&selected, peer_meas_cap)
            .map_err(|_| SpdmError::DeviceError)?;

        let rsp_len = rsp_base.length as usize;
        let rsp_bytes = msg_buf.message_data().map_err(|_| SpdmError::DeviceError)?;
        let expected_len = size_of::<SpdmMsgHdr>()
            + size_of::<AlgorithmsRspBase>()
            + num_rsp_tables * size_of::<AlgStructTable>();
        if rsp_len != expected_len || rsp_bytes.len() < rsp_len {
            Err(SpdmError::DeviceError)?;
        }
        self.transcript
            .append(TranscriptContext::A, &rsp_bytes[..rsp_len])
            .map_err(|_| SpdmError::SecurityViolation)?;

        debug!("negotiated algorithms: {:?}", selected);
        self.state.connection_info.set_peer_algorithms(selected);
        self.state
            .connection_info
            .set_state(ConnectionState::Negotiated);
        Ok(())
    }
}
