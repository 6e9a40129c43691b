//! XChaCha20-Poly1305 wrapper for the transport's framed datagram mode.
//!
//! 24-byte nonces let the transport use `random salt || counter` directly
//! without a per-session nonce schedule.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

use crate::{Error, Result};

/// XChaCha20 nonce length (16-byte salt + 8-byte counter on the wire).
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// AEAD key, zeroized on drop.
#[derive(Clone)]
pub struct AeadKey(pub [u8; 32]);

impl AeadKey {
    /// Derive the session key from a pre-shared key: the PSK bytes copied
    /// into a zero-padded 32-byte key, truncating longer inputs. This is the
    /// "Noise-lite" bring-up derivation; a real handshake would replace it.
    pub fn from_psk(psk: &[u8]) -> Self {
        let mut key = [0u8; 32];
        let n = psk.len().min(32);
        key[..n].copy_from_slice(&psk[..n]);
        Self(key)
    }
}

impl Drop for AeadKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl core::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// Precomputed cipher instance bound to one session key.
pub struct AeadCipher {
    cipher: XChaCha20Poly1305,
}

impl AeadCipher {
    pub fn new(key: &AeadKey) -> Self {
        let key = Key::from_slice(&key.0);
        Self {
            cipher: XChaCha20Poly1305::new(key),
        }
    }

    /// Encrypt `plaintext` under `nonce`, authenticating `aad`.
    pub fn seal(&self, nonce: &[u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XNonce::from_slice(nonce);
        self.cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| Error::Aead)
    }

    /// Decrypt and verify. Any tampering with ciphertext, nonce or AAD fails.
    pub fn open(&self, nonce: &[u8; NONCE_LEN], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XNonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| Error::Aead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip() {
        let key = AeadKey::from_psk(b"psk123");
        let cipher = AeadCipher::new(&key);
        let nonce = [7u8; NONCE_LEN];
        let ct = cipher.seal(&nonce, b"hdr", b"ping").unwrap();
        assert_eq!(ct.len(), 4 + TAG_LEN);
        assert_eq!(cipher.open(&nonce, b"hdr", &ct).unwrap(), b"ping");
    }

    #[test]
    fn wrong_key_fails() {
        let ct = AeadCipher::new(&AeadKey::from_psk(b"psk123"))
            .seal(&[1u8; NONCE_LEN], b"", b"hello")
            .unwrap();
        let wrong = AeadCipher::new(&AeadKey::from_psk(b"wrong"));
        assert!(matches!(
            wrong.open(&[1u8; NONCE_LEN], b"", &ct),
            Err(Error::Aead)
        ));
    }

    #[test]
    fn wrong_aad_fails() {
        let key = AeadKey::from_psk(b"k");
        let cipher = AeadCipher::new(&key);
        let ct = cipher.seal(&[2u8; NONCE_LEN], b"A", b"m").unwrap();
        assert!(cipher.open(&[2u8; NONCE_LEN], b"B", &ct).is_err());
    }

    #[test]
    fn psk_is_zero_padded_and_truncated() {
        let short = AeadKey::from_psk(b"abc");
        assert_eq!(&short.0[..3], b"abc");
        assert!(short.0[3..].iter().all(|&b| b == 0));

        let long = AeadKey::from_psk(&[0x41u8; 48]);
        assert_eq!(long.0, [0x41u8; 32]);
    }

    proptest! {
        #[test]
        fn roundtrip_random_input(aad in proptest::collection::vec(any::<u8>(), 0..64),
                                  msg in proptest::collection::vec(any::<u8>(), 0..1142)) {
            let key = AeadKey::from_psk(b"property");
            let cipher = AeadCipher::new(&key);
            let nonce = [3u8; NONCE_LEN];
            let ct = cipher.seal(&nonce, &aad, &msg).unwrap();
            let pt = cipher.open(&nonce, &aad, &ct).unwrap();
            prop_assert_eq!(pt, msg);
        }
    }
}
