// Licensed under the Apache-2.0 license

//! Session management for the SPDM requester: the session table,
//! session id allocation and secure-message sealing/opening.

use crate::codec::{encode_u8_slice, Codec, CodecError, MessageBuf};
use crate::crypto::{SpdmCryptoProvider, AEAD_TAG_SIZE};
use crate::transcript::TranscriptError;
use core::mem::size_of;

pub mod info;
pub mod key_schedule;

pub(crate) use info::{SessionInfo, SessionPolicy, SessionState};
pub(crate) use key_schedule::{KeySchedule, KeyUpdateDirection, SessionKeyType};
pub use key_schedule::KeyScheduleError;

pub const MAX_NUM_SESSIONS: usize = 4;
pub const INVALID_SESSION_ID: u32 = 0;

const MAX_SPDM_AEAD_ASSOCIATED_DATA_SIZE: usize = 16;
const MAX_SECURE_PLAINTEXT_SIZE: usize = 4096;

#[derive(Debug, PartialEq)]
pub enum SessionError {
    SessionsLimitReached,
    DuplicateSessionId,
    InvalidSessionId,
    InvalidState,
    BufferTooSmall,
    DecodeAeadError,
    KeySchedule(KeyScheduleError),
    Transcript(TranscriptError),
    Codec(CodecError),
}

pub type SessionResult<T> = Result<T, SessionError>;

pub(crate) struct SessionManager {
    sessions: [Option<SessionInfo>; MAX_NUM_SESSIONS],
    next_req_session_id: u16,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: core::array::from_fn(|_| None),
            next_req_session_id: 1,
        }
    }

    pub fn reset(&mut self) {
        self.sessions = core::array::from_fn(|_| None);
        self.next_req_session_id = 1;
    }

    /// A fresh requester session id not used by any live session.
    pub fn allocate_req_session_id(&mut self) -> u16 {
        loop {
            let candidate = self.next_req_session_id;
            self.next_req_session_id = self.next_req_session_id.wrapping_add(1).max(1);
            let in_use = self.sessions.iter().any(|s| {
                s.as_ref()
                    .map(|info| (info.session_id >> 16) as u16 == candidate)
                    .unwrap_or(false)
            });
            if !in_use {
                return candidate;
            }
        }
    }

    /// Compose the full session id from requester and responder halves.
    pub fn compose_session_id(req_session_id: u16, rsp_session_id: u16) -> u32 {
        (u32::from(req_session_id) << 16) | u32::from(rsp_session_id)
    }

    /// Create a session entry in its pre-handshake state.
    pub fn assign(&mut self, session_id: u32, use_psk: bool) -> SessionResult<&mut SessionInfo> {
        if self
            .sessions
            .iter()
            .any(|s| s.as_ref().map(|i| i.session_id == session_id) == Some(true))
        {
            Err(SessionError::DuplicateSessionId)?;
        }

        let slot = self
            .sessions
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(SessionError::SessionsLimitReached)?;
        *slot = Some(SessionInfo::new(session_id, use_psk));
        slot.as_mut().ok_or(SessionError::InvalidSessionId)
    }

    pub fn free(&mut self, session_id: u32) -> SessionResult<()> {
        let session_index = self
            .sessions
            .iter()
            .position(|s| {
                s.as_ref()
                    .map(|info| info.session_id == session_id)
                    .unwrap_or(false)
            })
            .ok_or(SessionError::InvalidSessionId)?;

        self.sessions[session_index] = None;
        Ok(())
    }

    pub fn session_info(&self, session_id: u32) -> SessionResult<&SessionInfo> {
        self.sessions
            .iter()
            .find_map(|s| s.as_ref().filter(|info| info.session_id == session_id))
            .ok_or(SessionError::InvalidSessionId)
    }

    pub fn session_info_mut(&mut self, session_id: u32) -> SessionResult<&mut SessionInfo> {
        self.sessions
            .iter_mut()
            .find_map(|s| s.as_mut().filter(|info| info.session_id == session_id))
            .ok_or(SessionError::InvalidSessionId)
    }

    pub fn live_session_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    pub fn live_session_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.sessions
            .iter()
            .filter_map(|s| s.as_ref().map(|info| info.session_id))
    }

    /// Seal an application message into the secured-message format:
    /// session_id, length, ciphertext(app_length + app_data), tag.
    pub async fn encode_secure_message(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        session_id: u32,
        app_data: &[u8],
        secure_message: &mut MessageBuf<'_>,
    ) -> SessionResult<()> {
        let session_info = self.session_info_mut(session_id)?;

        let mut plaintext_data = [0u8; MAX_SECURE_PLAINTEXT_SIZE];
        if app_data.len() + 2 > plaintext_data.len() {
            Err(SessionError::BufferTooSmall)?;
        }
        let app_data_len = app_data.len() as u16;
        plaintext_data[..2].copy_from_slice(&app_data_len.to_le_bytes());
        plaintext_data[2..2 + app_data.len()].copy_from_slice(app_data);
        let plaintext_len = 2 + app_data.len();

        let tag_length = AEAD_TAG_SIZE;
        let length: u16 = (plaintext_len + tag_length) as u16;

        let mut aead_data = [0u8; MAX_SPDM_AEAD_ASSOCIATED_DATA_SIZE];
        let mut aead_buf = MessageBuf::new(&mut aead_data);
        session_id
            .encode(&mut aead_buf)
            .map_err(SessionError::Codec)?;
        length.encode(&mut aead_buf).map_err(SessionError::Codec)?;
        let associated_data = aead_buf.message_data().map_err(SessionError::Codec)?;

        let mut encrypted_data = [0u8; MAX_SECURE_PLAINTEXT_SIZE];
        let (encrypted_size, tag) = session_info
            .encrypt_secure_message(
                crypto,
                associated_data,
                &plaintext_data[..plaintext_len],
                &mut encrypted_data,
            )
            .await?;

        session_id
            .encode(secure_message)
            .map_err(SessionError::Codec)?;
        length.encode(secure_message).map_err(SessionError::Codec)?;
        encode_u8_slice(&encrypted_data[..encrypted_size], secure_message)
            .map_err(SessionError::Codec)?;
        encode_u8_slice(&tag, secure_message).map_err(SessionError::Codec)?;

        Ok(())
    }

    /// Open a secured message; returns the application message length
    /// written into `app_data_buffer`.
    pub async fn decode_secure_message(
        &mut self,
        crypto: &dyn SpdmCryptoProvider,
        expected_session_id: u32,
        secure_message: &mut MessageBuf<'_>,
        app_data_buffer: &mut [u8],
    ) -> SessionResult<usize> {
        let session_id = u32::decode(secure_message).map_err(SessionError::Codec)?;
        if session_id != expected_session_id {
            Err(SessionError::InvalidSessionId)?;
        }
        let session_info = self.session_info_mut(session_id)?;

        let length = u16::decode(secure_message).map_err(SessionError::Codec)?;
        if (length as usize) < AEAD_TAG_SIZE + size_of::<u16>() {
            Err(SessionError::DecodeAeadError)?;
        }
        if secure_message.data_len() < length as usize {
            Err(SessionError::DecodeAeadError)?;
        }

        let mut aead_data = [0u8; MAX_SPDM_AEAD_ASSOCIATED_DATA_SIZE];
        let mut aead_buf = MessageBuf::new(&mut aead_data);
        session_id
            .encode(&mut aead_buf)
            .map_err(SessionError::Codec)?;
        length.encode(&mut aead_buf).map_err(SessionError::Codec)?;

        let encrypted_data_len = length as usize - AEAD_TAG_SIZE;
        let secure_msg_payload = secure_message
            .data(length as usize)
            .map_err(SessionError::Codec)?;
        let mut encrypted_data = [0u8; MAX_SECURE_PLAINTEXT_SIZE];
        if encrypted_data_len > encrypted_data.len() {
            Err(SessionError::BufferTooSmall)?;
        }
        encrypted_data[..encrypted_data_len]
            .copy_from_slice(&secure_msg_payload[..encrypted_data_len]);
        let tag: [u8; AEAD_TAG_SIZE] = secure_msg_payload
            [encrypted_data_len..encrypted_data_len + AEAD_TAG_SIZE]
            .try_into()
            .map_err(|_| SessionError::DecodeAeadError)?;
        let associated_data = aead_buf.message_data().map_err(SessionError::Codec)?;

        let mut plaintext_buffer = [0u8; MAX_SECURE_PLAINTEXT_SIZE];
        let decrypted_size = session_info
            .decrypt_secure_message(
                crypto,
                associated_data,
                &encrypted_data[..encrypted_data_len],
                tag,
                &mut plaintext_buffer,
            )
            .await?;

        if decrypted_size < size_of::<u16>() {
            Err(SessionError::DecodeAeadError)?;
        }
        let app_data_len =
            u16::from_le_bytes([plaintext_buffer[0], plaintext_buffer[1]]) as usize;
        if app_data_len + 2 > decrypted_size || app_data_len > app_data_buffer.len() {
            Err(SessionError::BufferTooSmall)?;
        }
        app_data_buffer[..app_data_len].copy_from_slice(&plaintext_buffer[2..2 + app_data_len]);
        Ok(app_data_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_allocation_is_unique() {
        let mut mgr = SessionManager::new();
        let id_a = mgr.allocate_req_session_id();
        mgr.assign(SessionManager::compose_session_id(id_a, 7), false)
            .unwrap();

        let id_b = mgr.allocate_req_session_id();
        assert_ne!(id_a, id_b);
        mgr.assign(SessionManager::compose_session_id(id_b, 9), true)
            .unwrap();
        assert_eq!(mgr.live_session_count(), 2);

        // A freed id may be reused afterwards
        mgr.free(SessionManager::compose_session_id(id_a, 7)).unwrap();
        assert_eq!(mgr.live_session_count(), 1);
    }

    #[test]
    fn test_session_table_limits() {
        let mut mgr = SessionManager::new();
        for i in 0..MAX_NUM_SESSIONS as u16 {
            let id = SessionManager::compose_session_id(i + 1, 0);
            mgr.assign(id, false).unwrap();
        }
        let overflow = SessionManager::compose_session_id(0x99, 0);
        assert_eq!(
            mgr.assign(overflow, false).err(),
            Some(SessionError::SessionsLimitReached)
        );

        let duplicate = SessionManager::compose_session_id(1, 0);
        mgr.free(duplicate).unwrap();
        mgr.assign(duplicate, false).unwrap();
        assert_eq!(
            mgr.assign(duplicate, false).err(),
            Some(SessionError::DuplicateSessionId)
        );
    }

    #[test]
    fn test_unknown_session_lookup_fails() {
        let mut mgr = SessionManager::new();
        assert_eq!(
            mgr.session_info_mut(0xDEAD_BEEF).err(),
            Some(SessionError::InvalidSessionId)
        );
        assert_eq!(mgr.free(0xDEAD_BEEF).err(), Some(SessionError::InvalidSessionId));
    }
}
