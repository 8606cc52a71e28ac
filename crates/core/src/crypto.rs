use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use onionmesh_common::{limits::SYMMETRIC_KEY_LEN, OnionMeshError, Result};
use rand::RngCore;

const NONCE_LEN: usize = 12;

/// A layer's symmetric key, as established during circuit construction.
pub type LayerKey = [u8; SYMMETRIC_KEY_LEN];

pub fn generate_key() -> LayerKey {
    let mut key = [0u8; SYMMETRIC_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Seal `plaintext` under `key`, authenticated and non-malleable. Each call
/// draws a fresh random nonce and prepends it to the ciphertext, so the
/// result is self-framing: `decrypt_sym` needs nothing but the key.
///
/// This plays the role spec.md's `encrypt_sym`/`decrypt_sym` pair describes
/// for the per-hop layer cipher — the teacher's `LayerCrypto` kept a
/// `NonceCounter` shared between the two ends of one circuit leg, which
/// doesn't fit a relay that only ever sees one packet per connection; a
/// self-framing nonce removes that shared state.
pub fn encrypt_sym(key: &LayerKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| OnionMeshError::crypto(format!("seal failed: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.append(&mut ciphertext);
    Ok(out)
}

/// Open a value produced by `encrypt_sym`. Returns `Err` on authentication
/// failure, which at every call site in this crate means the bytes were
/// corrupted or tampered with — each node's own key is always the correct
/// key for its own outer layer (established during that leg's `create`),
/// so a legitimate peel never fails. Whether the peeled plaintext is this
/// node's own meaningful content or ciphertext addressed to a further hop
/// is a separate, structural question answered by `node_relay_table`
/// (see `switchboard::Switchboard::handle_forward`), not by this
/// function's success or failure.
pub fn decrypt_sym(key: &LayerKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_LEN {
        return Err(OnionMeshError::crypto("ciphertext shorter than nonce"));
    }
    let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), body)
        .map_err(|e| OnionMeshError::crypto(format!("open failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_under_the_same_key() {
        let key = generate_key();
        let plaintext = b"extend 10.0.0.2:9001";
        let sealed = encrypt_sym(&key, plaintext).unwrap();
        let opened = decrypt_sym(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_key_fails_to_authenticate() {
        let key_a = generate_key();
        let key_b = generate_key();
        let sealed = encrypt_sym(&key_a, b"payload").unwrap();
        assert!(decrypt_sym(&key_b, &sealed).is_err());
    }

    #[test]
    fn each_call_draws_a_fresh_nonce() {
        let key = generate_key();
        let a = encrypt_sym(&key, b"same message").unwrap();
        let b = encrypt_sym(&key, b"same message").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = generate_key();
        assert!(decrypt_sym(&key, &[0u8; 4]).is_err());
    }
}
