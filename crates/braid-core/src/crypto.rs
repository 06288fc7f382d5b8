//! Session key agreement and payload encryption.
//!
//! Each confidential VC runs an X25519 agreement over public keys carried
//! in the `Setup` exchange, mixes in a fresh nonce from each side, and
//! derives one ChaCha20-Poly1305 key per direction. AEAD nonces are
//! per-direction message counters; a MAC failure is fatal for the VC.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, ErrorKind, Result};
use crate::version::Version;

/// Length of the X25519 public key carried in `Setup`.
pub const DH_PUBLIC_KEY_LEN: usize = 32;

/// Length of the per-connection setup nonce.
pub const SETUP_NONCE_LEN: usize = 16;

/// Ciphertext expansion per sealed payload.
pub const SEAL_OVERHEAD: usize = 16;

/// Encrypts outbound payloads for one direction of a VC.
pub trait Sealer: Send {
    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>>;
}

/// Decrypts inbound payloads for one direction of a VC.
pub trait Opener: Send {
    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through pair for `SecurityLevel::None`.
pub fn null_pair() -> (Box<dyn Sealer>, Box<dyn Opener>) {
    (Box::new(NullCrypter), Box::new(NullCrypter))
}

struct NullCrypter;

impl Sealer for NullCrypter {
    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }
}

impl Opener for NullCrypter {
    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

struct BoxSealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

struct BoxOpener {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

fn counter_nonce(counter: u64) -> Nonce {
    let mut raw = [0u8; 12];
    raw[..8].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(raw)
}

impl Sealer for BoxSealer {
    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.counter);
        self.counter += 1;
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::new(ErrorKind::DecryptionFailure, "encryption failed"))
    }
}

impl Opener for BoxOpener {
    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.counter);
        self.counter += 1;
        self.cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| Error::new(ErrorKind::DecryptionFailure, "decryption error"))
    }
}

/// Build the cipher pair from the two derived direction keys.
pub fn session_pair(tx_key: [u8; 32], rx_key: [u8; 32]) -> (Box<dyn Sealer>, Box<dyn Opener>) {
    (
        Box::new(BoxSealer {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&tx_key)),
            counter: 0,
        }),
        Box::new(BoxOpener {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&rx_key)),
            counter: 0,
        }),
    )
}

/// One side's ephemeral key agreement state.
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
    nonce: [u8; SETUP_NONCE_LEN],
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        let mut nonce = [0u8; SETUP_NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        KeyExchange {
            secret,
            public,
            nonce,
        }
    }

    pub fn public_key(&self) -> [u8; DH_PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn nonce(&self) -> [u8; SETUP_NONCE_LEN] {
        self.nonce
    }

    /// Derive the per-direction session keys.
    ///
    /// Both sides call this with the same `(dialer_nonce, acceptor_nonce)`
    /// pair; `dialed` selects which derived key is transmit and which is
    /// receive.
    pub fn derive(
        self,
        peer_public: &[u8],
        dialer_nonce: &[u8],
        acceptor_nonce: &[u8],
        version: Version,
        dialed: bool,
    ) -> Result<([u8; 32], [u8; 32])> {
        let peer: [u8; DH_PUBLIC_KEY_LEN] = peer_public.try_into().map_err(|_| {
            Error::new(
                ErrorKind::HandshakeFailure,
                format!("peer public key has {} bytes, want 32", peer_public.len()),
            )
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));

        let mut ikm = Vec::with_capacity(32 + dialer_nonce.len() + acceptor_nonce.len());
        ikm.extend_from_slice(shared.as_bytes());
        ikm.extend_from_slice(dialer_nonce);
        ikm.extend_from_slice(acceptor_nonce);

        let d2a = blake3::derive_key(
            &format!("braid v{} session key dialer-to-acceptor", version),
            &ikm,
        );
        let a2d = blake3::derive_key(
            &format!("braid v{} session key acceptor-to-dialer", version),
            &ikm,
        );
        Ok(if dialed { (d2a, a2d) } else { (a2d, d2a) })
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        KeyExchange::new()
    }
}

/// Hash binding a handshake to its transcript: both `Setup` bodies in
/// dialer-then-acceptor order, length-framed so boundaries are unambiguous.
pub fn channel_binding(dialer_setup_body: &[u8], acceptor_setup_body: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(dialer_setup_body.len() as u64).to_le_bytes());
    hasher.update(dialer_setup_body);
    hasher.update(&(acceptor_setup_body.len() as u64).to_le_bytes());
    hasher.update(acceptor_setup_body);
    *hasher.finalize().as_bytes()
}
