mod cipher_aes_cm_hmac_sha1;
mod context;
mod key_derivation;
mod mikey;

pub use context::{
    Context, SRTCP_OVERHEAD, SRTP_MASTER_KEY_LEN, SRTP_MASTER_LEN, SRTP_MASTER_SALT_LEN,
    SRTP_OVERHEAD,
};
pub use mikey::MikeyMessage;

use rand::Rng;

/// Draws a random 30-byte SRTP master (key plus salt).
pub fn random_master() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..SRTP_MASTER_LEN).map(|_| rng.gen()).collect()
}
