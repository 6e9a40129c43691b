//! Per-direction AEAD session state and the on-wire frame layout.
//!
//! ```text
//! [ 'N' 'Z' 0x01 0x00 ]                  // 4-byte associated header
//! [ 16-byte salt ][ 8-byte BE counter ]  // 24-byte XChaCha20 nonce
//! [ ciphertext || 16-byte tag ]
//! ```
//!
//! The associated header is fed as AD, so a frame re-tagged under a different
//! magic or version fails authentication, not just parsing.

use box_crypto::{AeadCipher, AeadKey, ReplayError, ReplayWindow, NONCE_LEN, TAG_LEN};
use rand::RngCore;

use crate::{Reject, Result, TransportError, MAX_DATAGRAM};

/// Associated header: magic, version, reserved.
pub const FRAME_TAG: [u8; 4] = [b'N', b'Z', 0x01, 0x00];

const SALT_LEN: usize = 16;
const COUNTER_LEN: usize = 8;

/// Bytes the AEAD framing adds around a plaintext.
pub const FRAME_OVERHEAD: usize = FRAME_TAG.len() + SALT_LEN + COUNTER_LEN + TAG_LEN;

/// Encryptor state: local salt plus a monotonic counter.
pub struct TxSession {
    crypto: Option<TxCrypto>,
}

struct TxCrypto {
    cipher: AeadCipher,
    salt: [u8; SALT_LEN],
    counter: u64,
}

impl TxSession {
    pub fn clear() -> Self {
        Self { crypto: None }
    }

    pub fn aead(key: &AeadKey) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            crypto: Some(TxCrypto {
                cipher: AeadCipher::new(key),
                salt,
                counter: 0,
            }),
        }
    }

    /// Frame one plaintext into a datagram. Bumps the counter first; a
    /// counter that would wrap refuses the send.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(crypto) = &mut self.crypto else {
            if plaintext.len() > MAX_DATAGRAM {
                return Err(TransportError::Oversize(plaintext.len()));
            }
            return Ok(plaintext.to_vec());
        };

        let total = plaintext.len() + FRAME_OVERHEAD;
        if total > MAX_DATAGRAM {
            return Err(TransportError::Oversize(total));
        }
        crypto.counter = crypto
            .counter
            .checked_add(1)
            .ok_or(TransportError::CounterExhausted)?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce[..SALT_LEN].copy_from_slice(&crypto.salt);
        nonce[SALT_LEN..].copy_from_slice(&crypto.counter.to_be_bytes());

        let ciphertext = crypto
            .cipher
            .seal(&nonce, &FRAME_TAG, plaintext)
            .map_err(|_| TransportError::Rejected(Reject::AeadFailure))?;

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&FRAME_TAG);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    #[cfg(debug_assertions)]
    pub fn force_counter(&mut self, counter: u64) {
        if let Some(crypto) = &mut self.crypto {
            crypto.counter = counter;
        }
    }
}

/// Decryptor state: pinned peer salt plus the replay window.
pub struct RxSession {
    crypto: Option<RxCrypto>,
}

struct RxCrypto {
    cipher: AeadCipher,
    /// Learned on the first successful decrypt, fixed for the session life.
    pinned_salt: Option<[u8; SALT_LEN]>,
    window: ReplayWindow,
}

impl RxSession {
    pub fn clear() -> Self {
        Self { crypto: None }
    }

    pub fn aead(key: &AeadKey) -> Self {
        Self {
            crypto: Some(RxCrypto {
                cipher: AeadCipher::new(key),
                pinned_salt: None,
                window: ReplayWindow::new(),
            }),
        }
    }

    /// Authenticate one datagram and return its plaintext.
    pub fn open(&mut self, datagram: &[u8]) -> core::result::Result<Vec<u8>, Reject> {
        let Some(crypto) = &mut self.crypto else {
            return Ok(datagram.to_vec());
        };

        if datagram.len() < FRAME_OVERHEAD || datagram[..4] != FRAME_TAG {
            return Err(Reject::BadHeader);
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&datagram[4..4 + SALT_LEN]);
        if let Some(pinned) = crypto.pinned_salt {
            if pinned != salt {
                return Err(Reject::SaltMismatch);
            }
        }
        let mut counter_bytes = [0u8; COUNTER_LEN];
        counter_bytes.copy_from_slice(&datagram[4 + SALT_LEN..4 + SALT_LEN + COUNTER_LEN]);
        let counter = u64::from_be_bytes(counter_bytes);

        let mut nonce = [0u8; NONCE_LEN];
        nonce[..SALT_LEN].copy_from_slice(&salt);
        nonce[SALT_LEN..].copy_from_slice(&counter_bytes);

        let plaintext = crypto
            .cipher
            .open(&nonce, &FRAME_TAG, &datagram[4 + NONCE_LEN..])
            .map_err(|_| Reject::AeadFailure)?;

        // Tag verified: the counter is authentic, so the window may advance.
        crypto.window.accept(counter).map_err(|e| match e {
            ReplayError::Replay => Reject::Replay,
            ReplayError::TooOld => Reject::TooOld,
        })?;
        crypto.pinned_salt.get_or_insert(salt);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(psk: &[u8]) -> (TxSession, RxSession) {
        let key = AeadKey::from_psk(psk);
        (TxSession::aead(&key), RxSession::aead(&key))
    }

    #[test]
    fn seal_open_roundtrip() {
        let (mut tx, mut rx) = pair(b"psk123");
        let datagram = tx.seal(b"ping").unwrap();
        assert_eq!(&datagram[..4], &FRAME_TAG);
        assert_eq!(rx.open(&datagram).unwrap(), b"ping");
    }

    #[test]
    fn replayed_datagram_rejected() {
        let (mut tx, mut rx) = pair(b"psk123");
        let datagram = tx.seal(b"once").unwrap();
        assert!(rx.open(&datagram).is_ok());
        assert_eq!(rx.open(&datagram), Err(Reject::Replay));
    }

    #[test]
    fn wrong_key_rejected() {
        let (mut tx, _) = pair(b"psk123");
        let (_, mut rx) = pair(b"wrong");
        let datagram = tx.seal(b"hello").unwrap();
        assert_eq!(rx.open(&datagram), Err(Reject::AeadFailure));
    }

    #[test]
    fn bad_header_rejected() {
        let (mut tx, mut rx) = pair(b"psk123");
        let mut datagram = tx.seal(b"x").unwrap();
        datagram[0] = b'Q';
        assert_eq!(rx.open(&datagram), Err(Reject::BadHeader));
        assert_eq!(rx.open(b"NZ"), Err(Reject::BadHeader));
    }

    #[test]
    fn salt_pinned_after_first_decrypt() {
        let key = AeadKey::from_psk(b"psk123");
        let mut first = TxSession::aead(&key);
        let mut second = TxSession::aead(&key); // fresh random salt
        let mut rx = RxSession::aead(&key);

        assert!(rx.open(&first.seal(b"a").unwrap()).is_ok());
        assert_eq!(
            rx.open(&second.seal(b"b").unwrap()),
            Err(Reject::SaltMismatch)
        );
        // The original sender is still accepted.
        assert!(rx.open(&first.seal(b"c").unwrap()).is_ok());
    }

    #[test]
    fn failed_decrypt_does_not_pin_salt() {
        let key = AeadKey::from_psk(b"psk123");
        let mut intruder = TxSession::aead(&AeadKey::from_psk(b"wrong"));
        let mut honest = TxSession::aead(&key);
        let mut rx = RxSession::aead(&key);

        assert_eq!(rx.open(&intruder.seal(b"evil").unwrap()), Err(Reject::AeadFailure));
        // The honest peer can still establish the session.
        assert!(rx.open(&honest.seal(b"hi").unwrap()).is_ok());
    }

    #[test]
    fn counter_exhaustion_refuses_send() {
        let (mut tx, _) = pair(b"psk123");
        tx.force_counter(u64::MAX - 1);
        assert!(tx.seal(b"last one").is_ok());
        assert!(matches!(
            tx.seal(b"wrap"),
            Err(TransportError::CounterExhausted)
        ));
    }

    #[test]
    fn oversize_plaintext_refused() {
        let (mut tx, _) = pair(b"psk123");
        let big = vec![0u8; MAX_DATAGRAM - FRAME_OVERHEAD + 1];
        assert!(matches!(tx.seal(&big), Err(TransportError::Oversize(_))));
        let fits = vec![0u8; MAX_DATAGRAM - FRAME_OVERHEAD];
        assert!(tx.seal(&fits).is_ok());
    }

    #[test]
    fn clear_mode_passthrough() {
        let mut tx = TxSession::clear();
        let mut rx = RxSession::clear();
        let datagram = tx.seal(b"plain").unwrap();
        assert_eq!(datagram, b"plain");
        assert_eq!(rx.open(&datagram).unwrap(), b"plain");
    }

    #[test]
    fn tampered_counter_fails_auth() {
        let (mut tx, mut rx) = pair(b"psk123");
        let mut datagram = tx.seal(b"m").unwrap();
        let counter_at = 4 + SALT_LEN + COUNTER_LEN - 1;
        datagram[counter_at] ^= 0x01;
        // The nonce participates in decryption, so the tag no longer verifies.
        assert_eq!(rx.open(&datagram), Err(Reject::AeadFailure));
    }
}
