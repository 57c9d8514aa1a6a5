//! kw-crypto: key derivation and container crypto for keyward
//!
//! Key schedule:
//! ```text
//! password ─┐
//! key file ─┼─ SHA-256 each ─ concat ─ SHA-256 ─ composite key
//! challenge ┘                                        │
//!                                      AES-KDF / Argon2 (KDF seed)
//!                                                    │
//!                                             transformed key
//!                                                    │
//!     ├── cipher key = SHA-256(master seed ‖ transformed)
//!     └── block HMAC base = HKDF-SHA256(master seed ‖ transformed, "keyward-block-hmac")
//! ```
//!
//! Payload pipeline: compress → 1 MiB HMAC blocks → stream-start marker → pad → encrypt

pub mod blocks;
pub mod challenge;
pub mod cipher;
pub mod compress;
pub mod kdf;
pub mod key;
pub mod keyfile;

pub use blocks::{read_blocks, write_blocks, BlockReader};
pub use challenge::ChallengeResponse;
pub use cipher::CipherId;
pub use compress::Compression;
pub use kdf::{Argon2Variant, KdfParams};
pub use key::{derive, derive_cancellable, CompositeKey, ContainerKeys, TransformedKey};

/// Size of every derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the stream-start marker and master seed
pub const SEED_SIZE: usize = 32;

/// Fill a fresh random buffer of `N` bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}
