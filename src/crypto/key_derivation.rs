use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub(crate) const LABEL_SRTP_ENCRYPTION: u8 = 0x00;
pub(crate) const LABEL_SRTP_AUTHENTICATION_TAG: u8 = 0x01;
pub(crate) const LABEL_SRTP_SALT: u8 = 0x02;
pub(crate) const LABEL_SRTCP_ENCRYPTION: u8 = 0x03;
pub(crate) const LABEL_SRTCP_AUTHENTICATION_TAG: u8 = 0x04;
pub(crate) const LABEL_SRTCP_SALT: u8 = 0x05;

/// AES-CM key derivation (RFC 3711, section 4.3.1), with a key derivation
/// rate of zero.
pub(crate) fn aes_cm_key_derivation(
    label: u8,
    master_key: &[u8],
    master_salt: &[u8],
    out_len: usize,
) -> Result<Vec<u8>> {
    let n_master_key = master_key.len();
    if n_master_key != 16 {
        return Err(Error::ErrSrtpMasterLength(16, n_master_key));
    }

    // prf_in = master_salt XOR (label || 0...), right-padded to block size
    let mut prf_in = [0u8; 16];
    prf_in[..master_salt.len()].copy_from_slice(master_salt);
    prf_in[7] ^= label;

    let block = Aes128::new(GenericArray::from_slice(master_key));

    let n_blocks = (out_len + n_master_key - 1) / n_master_key;
    let mut out = vec![0u8; n_blocks * n_master_key];

    for (i, chunk) in out.chunks_mut(n_master_key).enumerate() {
        BigEndian::write_u16(&mut prf_in[n_master_key - 2..], i as u16);
        chunk.copy_from_slice(&prf_in);
        block.encrypt_block(GenericArray::from_mut_slice(chunk));
    }

    out.truncate(out_len);
    Ok(out)
}

/// Generates the AES-CM counter block for one packet
/// (RFC 3711, section 4.1.1).
pub(crate) fn generate_counter(
    sequence_number: u16,
    rollover_counter: u32,
    ssrc: u32,
    session_salt: &[u8],
) -> [u8; 16] {
    let mut counter = [0u8; 16];

    BigEndian::write_u32(&mut counter[4..8], ssrc);
    BigEndian::write_u32(&mut counter[8..12], rollover_counter);
    BigEndian::write_u32(&mut counter[12..16], (sequence_number as u32) << 16);

    for (c, s) in counter.iter_mut().zip(session_salt.iter()) {
        *c ^= s;
    }

    counter
}

#[cfg(test)]
mod key_derivation_test {
    use super::*;

    // Test vectors from RFC 3711, appendix B.3.
    const MASTER_KEY: [u8; 16] = [
        0xE1, 0xF9, 0x7A, 0x0D, 0x3E, 0x01, 0x8B, 0xE0, 0xD6, 0x4F, 0xA3, 0x2C, 0x06, 0xDE, 0x41,
        0x39,
    ];
    const MASTER_SALT: [u8; 14] = [
        0x0E, 0xC6, 0x75, 0xAD, 0x49, 0x8A, 0xFE, 0xEB, 0xB6, 0x96, 0x0B, 0x3A, 0xAB, 0xE6,
    ];

    #[test]
    fn test_session_key() {
        let key =
            aes_cm_key_derivation(LABEL_SRTP_ENCRYPTION, &MASTER_KEY, &MASTER_SALT, 16).unwrap();
        assert_eq!(
            key,
            vec![
                0xC6, 0x1E, 0x7A, 0x93, 0x74, 0x4F, 0x39, 0xEE, 0x10, 0x73, 0x4A, 0xFE, 0x3F,
                0xF7, 0xA0, 0x87,
            ]
        );
    }

    #[test]
    fn test_session_salt() {
        let salt = aes_cm_key_derivation(LABEL_SRTP_SALT, &MASTER_KEY, &MASTER_SALT, 14).unwrap();
        assert_eq!(
            salt,
            vec![
                0x30, 0xCB, 0xBC, 0x08, 0x86, 0x3D, 0x8C, 0x85, 0xD4, 0x9D, 0xB3, 0x4A, 0x9A,
                0xE1,
            ]
        );
    }

    #[test]
    fn test_session_auth_key() {
        let auth = aes_cm_key_derivation(
            LABEL_SRTP_AUTHENTICATION_TAG,
            &MASTER_KEY,
            &MASTER_SALT,
            20,
        )
        .unwrap();
        assert_eq!(
            auth,
            vec![
                0xCE, 0xBE, 0x32, 0x1F, 0x6F, 0xF7, 0x71, 0x6B, 0x6F, 0xD4, 0xAB, 0x49, 0xAF,
                0x25, 0x6A, 0x15, 0x6D, 0x38, 0xBA, 0xA4,
            ]
        );
    }

    #[test]
    fn test_invalid_master_key_length() {
        assert!(aes_cm_key_derivation(LABEL_SRTP_ENCRYPTION, &[0u8; 8], &MASTER_SALT, 16).is_err());
    }
}
