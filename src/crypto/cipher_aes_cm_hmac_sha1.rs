use aes::cipher::generic_array::GenericArray;
use byteorder::{BigEndian, ByteOrder};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use super::key_derivation::*;
use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Authentication tag length of the AES-128-CM + HMAC-SHA1-80 profile.
pub(crate) const AUTH_TAG_LEN: usize = 10;
pub(crate) const SRTCP_INDEX_SIZE: usize = 4;
pub(crate) const SESSION_AUTH_KEY_LEN: usize = 20;

/// The AES-128-CM + HMAC-SHA1-80 transform of RFC 3711.
pub(crate) struct CipherAesCmHmacSha1 {
    srtp_session_key: Vec<u8>,
    srtp_session_salt: Vec<u8>,
    srtp_session_auth: HmacSha1,
    srtcp_session_key: Vec<u8>,
    srtcp_session_salt: Vec<u8>,
    srtcp_session_auth: HmacSha1,
}

impl CipherAesCmHmacSha1 {
    pub fn new(master_key: &[u8], master_salt: &[u8]) -> Result<Self> {
        let srtp_session_key = aes_cm_key_derivation(
            LABEL_SRTP_ENCRYPTION,
            master_key,
            master_salt,
            master_key.len(),
        )?;
        let srtcp_session_key = aes_cm_key_derivation(
            LABEL_SRTCP_ENCRYPTION,
            master_key,
            master_salt,
            master_key.len(),
        )?;

        let srtp_session_salt = aes_cm_key_derivation(
            LABEL_SRTP_SALT,
            master_key,
            master_salt,
            master_salt.len(),
        )?;
        let srtcp_session_salt = aes_cm_key_derivation(
            LABEL_SRTCP_SALT,
            master_key,
            master_salt,
            master_salt.len(),
        )?;

        let srtp_session_auth_key = aes_cm_key_derivation(
            LABEL_SRTP_AUTHENTICATION_TAG,
            master_key,
            master_salt,
            SESSION_AUTH_KEY_LEN,
        )?;
        let srtcp_session_auth_key = aes_cm_key_derivation(
            LABEL_SRTCP_AUTHENTICATION_TAG,
            master_key,
            master_salt,
            SESSION_AUTH_KEY_LEN,
        )?;

        let srtp_session_auth = HmacSha1::new_from_slice(&srtp_session_auth_key)
            .map_err(|_| Error::ErrSrtpMasterLength(16, master_key.len()))?;
        let srtcp_session_auth = HmacSha1::new_from_slice(&srtcp_session_auth_key)
            .map_err(|_| Error::ErrSrtpMasterLength(16, master_key.len()))?;

        Ok(CipherAesCmHmacSha1 {
            srtp_session_key,
            srtp_session_salt,
            srtp_session_auth,
            srtcp_session_key,
            srtcp_session_salt,
            srtcp_session_auth,
        })
    }

    /// HMAC over the authenticated portion concatenated with the rollover
    /// counter, truncated to 80 bits (RFC 3711, section 4.2).
    fn generate_srtp_auth_tag(&mut self, buf: &[u8], roc: u32) -> [u8; AUTH_TAG_LEN] {
        self.srtp_session_auth.update(buf);

        let mut roc_buf = [0u8; 4];
        BigEndian::write_u32(&mut roc_buf, roc);
        self.srtp_session_auth.update(&roc_buf);

        let tag = self.srtp_session_auth.finalize_reset().into_bytes();
        let mut out = [0u8; AUTH_TAG_LEN];
        out.copy_from_slice(&tag[..AUTH_TAG_LEN]);
        out
    }

    fn generate_srtcp_auth_tag(&mut self, buf: &[u8]) -> [u8; AUTH_TAG_LEN] {
        self.srtcp_session_auth.update(buf);

        let tag = self.srtcp_session_auth.finalize_reset().into_bytes();
        let mut out = [0u8; AUTH_TAG_LEN];
        out.copy_from_slice(&tag[..AUTH_TAG_LEN]);
        out
    }

    pub fn encrypt_rtp(
        &mut self,
        payload: &[u8],
        header_len: usize,
        sequence_number: u16,
        ssrc: u32,
        roc: u32,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(payload.len() + AUTH_TAG_LEN);
        out.extend_from_slice(payload);

        let counter = generate_counter(sequence_number, roc, ssrc, &self.srtp_session_salt);
        let mut stream = Aes128Ctr::new(
            GenericArray::from_slice(&self.srtp_session_key),
            GenericArray::from_slice(&counter),
        );
        stream.apply_keystream(&mut out[header_len..]);

        let tag = self.generate_srtp_auth_tag(&out, roc);
        out.extend_from_slice(&tag);

        Ok(out)
    }

    pub fn decrypt_rtp(
        &mut self,
        encrypted: &[u8],
        header_len: usize,
        sequence_number: u16,
        ssrc: u32,
        roc: u32,
    ) -> Result<Vec<u8>> {
        if encrypted.len() < header_len + AUTH_TAG_LEN {
            return Err(Error::ErrSrtpTooShort);
        }

        let boundary = encrypted.len() - AUTH_TAG_LEN;
        let (cipher_text, actual_tag) = encrypted.split_at(boundary);

        let expected_tag = self.generate_srtp_auth_tag(cipher_text, roc);
        if actual_tag.ct_eq(&expected_tag).unwrap_u8() != 1 {
            return Err(Error::ErrSrtpAuthTagMismatch);
        }

        let mut out = cipher_text.to_vec();
        let counter = generate_counter(sequence_number, roc, ssrc, &self.srtp_session_salt);
        let mut stream = Aes128Ctr::new(
            GenericArray::from_slice(&self.srtp_session_key),
            GenericArray::from_slice(&counter),
        );
        stream.apply_keystream(&mut out[header_len..]);

        Ok(out)
    }

    pub fn encrypt_rtcp(&mut self, decrypted: &[u8], index: u32, ssrc: u32) -> Result<Vec<u8>> {
        if decrypted.len() < 8 {
            return Err(Error::ErrSrtpTooShort);
        }

        let mut out = Vec::with_capacity(decrypted.len() + SRTCP_INDEX_SIZE + AUTH_TAG_LEN);
        out.extend_from_slice(decrypted);

        let counter = generate_counter(
            (index & 0xFFFF) as u16,
            index >> 16,
            ssrc,
            &self.srtcp_session_salt,
        );
        let mut stream = Aes128Ctr::new(
            GenericArray::from_slice(&self.srtcp_session_key),
            GenericArray::from_slice(&counter),
        );
        stream.apply_keystream(&mut out[8..]);

        // E flag plus the 31-bit SRTCP index
        let mut index_buf = [0u8; 4];
        BigEndian::write_u32(&mut index_buf, (1 << 31) | index);
        out.extend_from_slice(&index_buf);

        let tag = self.generate_srtcp_auth_tag(&out);
        out.extend_from_slice(&tag);

        Ok(out)
    }

    pub fn decrypt_rtcp(&mut self, encrypted: &[u8]) -> Result<Vec<u8>> {
        if encrypted.len() < 8 + SRTCP_INDEX_SIZE + AUTH_TAG_LEN {
            return Err(Error::ErrSrtpTooShort);
        }

        let tail = encrypted.len() - AUTH_TAG_LEN;
        let (authed, actual_tag) = encrypted.split_at(tail);

        let expected_tag = self.generate_srtcp_auth_tag(authed);
        if actual_tag.ct_eq(&expected_tag).unwrap_u8() != 1 {
            return Err(Error::ErrSrtpAuthTagMismatch);
        }

        let index_offset = tail - SRTCP_INDEX_SIZE;
        let index = BigEndian::read_u32(&encrypted[index_offset..tail]) & !(1 << 31);
        let ssrc = BigEndian::read_u32(&encrypted[4..8]);

        let mut out = encrypted[..index_offset].to_vec();
        let counter = generate_counter(
            (index & 0xFFFF) as u16,
            index >> 16,
            ssrc,
            &self.srtcp_session_salt,
        );
        let mut stream = Aes128Ctr::new(
            GenericArray::from_slice(&self.srtcp_session_key),
            GenericArray::from_slice(&counter),
        );
        stream.apply_keystream(&mut out[8..]);

        Ok(out)
    }
}

/// SRTCP index extracted without decrypting, for replay checks.
pub(crate) fn rtcp_index(encrypted: &[u8]) -> Result<u32> {
    if encrypted.len() < 8 + SRTCP_INDEX_SIZE + AUTH_TAG_LEN {
        return Err(Error::ErrSrtpTooShort);
    }
    let tail_offset = encrypted.len() - (AUTH_TAG_LEN + SRTCP_INDEX_SIZE);
    Ok(BigEndian::read_u32(&encrypted[tail_offset..tail_offset + SRTCP_INDEX_SIZE]) & !(1 << 31))
}
