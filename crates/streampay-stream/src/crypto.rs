//! STREAM key derivation and packet encryption.

use bytes::BytesMut;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, digest, hmac};
use tracing::error;

pub const NONCE_LENGTH: usize = 12;
pub const AUTH_TAG_LENGTH: usize = 16;
pub const SHARED_SECRET_LENGTH: usize = 32;

static ENCRYPTION_KEY_STRING: &[u8] = b"ilp_stream_encryption";
static FULFILLMENT_GENERATION_STRING: &[u8] = b"ilp_stream_fulfillment";

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let output = hmac::sign(&key, message);
    let mut to_return = [0u8; 32];
    to_return.copy_from_slice(output.as_ref());
    to_return
}

pub fn hash_sha256(preimage: &[u8]) -> [u8; 32] {
    let output = digest::digest(&digest::SHA256, preimage);
    let mut to_return = [0u8; 32];
    to_return.copy_from_slice(output.as_ref());
    to_return
}

pub fn generate_fulfillment(shared_secret: &[u8], data: &[u8]) -> [u8; 32] {
    let key = hmac_sha256(shared_secret, FULFILLMENT_GENERATION_STRING);
    hmac_sha256(&key[..], data)
}

pub fn generate_condition(shared_secret: &[u8], data: &[u8]) -> [u8; 32] {
    hash_sha256(&generate_fulfillment(shared_secret, data))
}

pub fn random_condition() -> [u8; 32] {
    let mut condition = [0u8; 32];
    SystemRandom::new()
        .fill(&mut condition)
        .expect("the system RNG is unavailable");
    condition
}

/// Encrypts with a random nonce. Output layout is `nonce ‖ auth tag ‖ ciphertext`.
pub fn encrypt(shared_secret: &[u8], plaintext: BytesMut) -> BytesMut {
    let mut nonce = [0u8; NONCE_LENGTH];
    SystemRandom::new()
        .fill(&mut nonce)
        .expect("the system RNG is unavailable");
    encrypt_with_nonce(shared_secret, plaintext, nonce)
}

pub(crate) fn encrypt_with_nonce(
    shared_secret: &[u8],
    mut plaintext: BytesMut,
    nonce: [u8; NONCE_LENGTH],
) -> BytesMut {
    let key = derive_aead_key(shared_secret);

    key.seal_in_place_append_tag(
        aead::Nonce::assume_unique_for_key(nonce),
        aead::Aad::empty(),
        &mut plaintext,
    )
    .expect("AES-GCM sealing cannot fail for in-memory buffers");

    // The tag travels before the ciphertext on the wire
    let auth_tag_position = plaintext.len() - AUTH_TAG_LENGTH;
    let mut tag_then_data = plaintext.split_off(auth_tag_position);
    tag_then_data.unsplit(plaintext);

    let mut output = BytesMut::from(&nonce[..]);
    output.unsplit(tag_then_data);
    output
}

pub fn decrypt(shared_secret: &[u8], mut ciphertext: BytesMut) -> Result<BytesMut, ()> {
    if ciphertext.len() < NONCE_LENGTH + AUTH_TAG_LENGTH {
        return Err(());
    }
    let key = derive_aead_key(shared_secret);

    let mut nonce = [0u8; NONCE_LENGTH];
    nonce.copy_from_slice(&ciphertext.split_to(NONCE_LENGTH));
    let auth_tag = ciphertext.split_to(AUTH_TAG_LENGTH);

    // ring wants the tag back at the end
    ciphertext.unsplit(auth_tag);

    let length = key
        .open_in_place(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|err| {
            error!("Error decrypting STREAM data: {:?}", err);
        })?
        .len();
    ciphertext.truncate(length);
    Ok(ciphertext)
}

fn derive_aead_key(shared_secret: &[u8]) -> aead::LessSafeKey {
    let key = hmac_sha256(shared_secret, ENCRYPTION_KEY_STRING);
    let key = aead::UnboundKey::new(&aead::AES_256_GCM, &key)
        .expect("HMAC-SHA256 output is a valid AES-256 key");
    aead::LessSafeKey::new(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    static SHARED_SECRET: &[u8] = &[
        126, 219, 117, 93, 118, 248, 249, 211, 20, 211, 65, 110, 237, 80, 253, 179, 81, 146, 229,
        67, 231, 49, 92, 127, 254, 230, 144, 102, 103, 166, 150, 36,
    ];

    #[test]
    fn fulfillment_matches_reference_vector() {
        let data: &[u8] = &[
            119, 248, 213, 234, 63, 200, 224, 140, 212, 222, 105, 159, 246, 203, 66, 155, 151,
            172, 68, 24, 76, 232, 90, 10, 237, 146, 189, 73, 248, 196, 177, 108, 115, 223,
        ];
        let expected: &[u8] = &[
            24, 6, 56, 73, 229, 236, 88, 227, 82, 112, 152, 49, 152, 73, 182, 183, 198, 7, 233,
            124, 119, 65, 13, 68, 54, 108, 120, 193, 59, 226, 107, 39,
        ];
        assert_eq!(&generate_fulfillment(SHARED_SECRET, data)[..], expected);
        assert_eq!(
            generate_condition(SHARED_SECRET, data),
            hash_sha256(expected)
        );
    }

    #[test]
    fn encrypts_and_decrypts_losslessly() {
        let plaintext: &[u8] = &[99, 0, 12, 255, 77, 31];
        let ciphertext = encrypt(SHARED_SECRET, BytesMut::from(plaintext));
        assert_ne!(&ciphertext[..], plaintext);
        let decrypted = decrypt(SHARED_SECRET, ciphertext).unwrap();
        assert_eq!(&decrypted[..], plaintext);
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let mut ciphertext = encrypt(SHARED_SECRET, BytesMut::from(&b"money"[..]));
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 1;
        assert!(decrypt(SHARED_SECRET, ciphertext).is_err());
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        assert!(decrypt(SHARED_SECRET, BytesMut::from(&[1u8; 8][..])).is_err());
    }
}
