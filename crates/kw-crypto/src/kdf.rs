//! Key stretching: AES-KDF and Argon2 over the composite key

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use kw_core::config::KdfConfig;
use kw_core::{KwError, KwResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::{uuid, Uuid};
use zeroize::Zeroize;

use crate::key::TransformedKey;
use crate::{random_bytes, KEY_SIZE, SEED_SIZE};

pub const AES_KDF_UUID: Uuid = uuid!("c9d9f39a-628a-4460-bf74-0d08c18a4fea");
pub const ARGON2D_UUID: Uuid = uuid!("ef636ddf-8c29-444b-91f7-a9a403e30a0c");
pub const ARGON2ID_UUID: Uuid = uuid!("9e298b19-56db-4773-b23d-fc3ec6f0a1e6");

/// AES-KDF checks for cancellation after this many rounds.
pub const CANCEL_CHECK_ROUNDS: u64 = 10_000;

const ARGON2_MIN_SALT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Variant {
    D,
    Id,
}

/// Parameters of the key stretching function, as stored in the container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdfParams {
    Aes {
        rounds: u64,
        seed: [u8; SEED_SIZE],
    },
    Argon2 {
        variant: Argon2Variant,
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
        version: u32,
        salt: Vec<u8>,
    },
}

impl KdfParams {
    /// Fresh parameters with a random seed, from the `[kdf]` config section.
    pub fn from_config(config: &KdfConfig) -> KwResult<Self> {
        let params = match config.algorithm.to_ascii_lowercase().as_str() {
            "aes" | "aes-kdf" => KdfParams::Aes {
                rounds: config.aes_rounds,
                seed: random_bytes(),
            },
            "argon2id" => KdfParams::Argon2 {
                variant: Argon2Variant::Id,
                memory_kib: config.argon2_mem_cost_kib,
                iterations: config.argon2_time_cost,
                parallelism: config.argon2_parallelism,
                version: 0x13,
                salt: random_bytes::<SEED_SIZE>().to_vec(),
            },
            "argon2d" => KdfParams::Argon2 {
                variant: Argon2Variant::D,
                memory_kib: config.argon2_mem_cost_kib,
                iterations: config.argon2_time_cost,
                parallelism: config.argon2_parallelism,
                version: 0x13,
                salt: random_bytes::<SEED_SIZE>().to_vec(),
            },
            other => {
                return Err(KwError::Config(format!(
                    "unknown kdf algorithm {other:?} (expected argon2id, argon2d or aes)"
                )))
            }
        };
        params.validate()?;
        Ok(params)
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            KdfParams::Aes { .. } => AES_KDF_UUID,
            KdfParams::Argon2 {
                variant: Argon2Variant::D,
                ..
            } => ARGON2D_UUID,
            KdfParams::Argon2 {
                variant: Argon2Variant::Id,
                ..
            } => ARGON2ID_UUID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KdfParams::Aes { .. } => "aes-kdf",
            KdfParams::Argon2 {
                variant: Argon2Variant::D,
                ..
            } => "argon2d",
            KdfParams::Argon2 {
                variant: Argon2Variant::Id,
                ..
            } => "argon2id",
        }
    }

    /// Replace the seed/salt with fresh random bytes.
    pub fn randomize_seed(&mut self) {
        match self {
            KdfParams::Aes { seed, .. } => *seed = random_bytes(),
            KdfParams::Argon2 { salt, .. } => *salt = random_bytes::<SEED_SIZE>().to_vec(),
        }
    }

    pub fn validate(&self) -> KwResult<()> {
        match self {
            KdfParams::Aes { rounds, .. } => {
                if *rounds == 0 {
                    return Err(KwError::KeyDerivation("AES-KDF rounds must be > 0".into()));
                }
            }
            KdfParams::Argon2 {
                memory_kib,
                iterations,
                parallelism,
                version,
                salt,
                ..
            } => {
                if *parallelism == 0 {
                    return Err(KwError::KeyDerivation(
                        "Argon2 parallelism must be > 0".into(),
                    ));
                }
                if *iterations == 0 {
                    return Err(KwError::KeyDerivation(
                        "Argon2 iterations must be > 0".into(),
                    ));
                }
                if u64::from(*memory_kib) < 8 * u64::from(*parallelism) {
                    return Err(KwError::KeyDerivation(format!(
                        "Argon2 memory {memory_kib} KiB is below 8 KiB per lane"
                    )));
                }
                if salt.len() < ARGON2_MIN_SALT {
                    return Err(KwError::KeyDerivation(format!(
                        "Argon2 salt too short: {} bytes",
                        salt.len()
                    )));
                }
                if *version != 0x10 && *version != 0x13 {
                    return Err(KwError::UnsupportedFormat(format!(
                        "Argon2 version {version:#x}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stretch a composite key. `cancel` is polled by the AES-KDF loop.
    pub fn transform(
        &self,
        composite: &[u8; KEY_SIZE],
        cancel: Option<&CancellationToken>,
    ) -> KwResult<TransformedKey> {
        self.validate()?;
        let bytes = match self {
            KdfParams::Aes { rounds, seed } => aes_kdf(composite, seed, *rounds, cancel)?,
            KdfParams::Argon2 {
                variant,
                memory_kib,
                iterations,
                parallelism,
                version,
                salt,
            } => {
                let params = Params::new(*memory_kib, *iterations, *parallelism, Some(KEY_SIZE))
                    .map_err(|e| KwError::KeyDerivation(format!("invalid Argon2 params: {e}")))?;
                let algorithm = match variant {
                    Argon2Variant::D => Algorithm::Argon2d,
                    Argon2Variant::Id => Algorithm::Argon2id,
                };
                let version = if *version == 0x10 {
                    Version::V0x10
                } else {
                    Version::V0x13
                };
                let mut out = [0u8; KEY_SIZE];
                Argon2::new(algorithm, version, params)
                    .hash_password_into(composite, salt, &mut out)
                    .map_err(|e| KwError::KeyDerivation(format!("Argon2 failed: {e}")))?;
                out
            }
        };
        Ok(TransformedKey::from_bytes(bytes))
    }

    pub fn to_json(&self) -> KwResult<Vec<u8>> {
        let record = match self {
            KdfParams::Aes { rounds, seed } => KdfRecord {
                uuid: AES_KDF_UUID,
                rounds: Some(*rounds),
                seed: Some(B64.encode(seed)),
                ..KdfRecord::empty(AES_KDF_UUID)
            },
            KdfParams::Argon2 {
                memory_kib,
                iterations,
                parallelism,
                version,
                salt,
                ..
            } => KdfRecord {
                memory_kib: Some(*memory_kib),
                iterations: Some(*iterations),
                parallelism: Some(*parallelism),
                version: Some(*version),
                salt: Some(B64.encode(salt)),
                ..KdfRecord::empty(self.uuid())
            },
        };
        Ok(serde_json::to_vec(&record)?)
    }

    pub fn from_json(bytes: &[u8]) -> KwResult<Self> {
        let record: KdfRecord = serde_json::from_slice(bytes)
            .map_err(|e| KwError::Format(format!("kdf parameters: {e}")))?;
        let missing = |field: &str| KwError::Format(format!("kdf parameter {field} missing"));
        let decode = |field: &str, value: Option<String>| -> KwResult<Vec<u8>> {
            let value = value.ok_or_else(|| missing(field))?;
            B64.decode(value)
                .map_err(|e| KwError::Format(format!("kdf parameter {field}: {e}")))
        };

        let params = if record.uuid == AES_KDF_UUID {
            let seed: [u8; SEED_SIZE] = decode("seed", record.seed)?
                .try_into()
                .map_err(|_| KwError::Format("AES-KDF seed must be 32 bytes".into()))?;
            KdfParams::Aes {
                rounds: record.rounds.ok_or_else(|| missing("rounds"))?,
                seed,
            }
        } else if record.uuid == ARGON2D_UUID || record.uuid == ARGON2ID_UUID {
            KdfParams::Argon2 {
                variant: if record.uuid == ARGON2D_UUID {
                    Argon2Variant::D
                } else {
                    Argon2Variant::Id
                },
                memory_kib: record.memory_kib.ok_or_else(|| missing("memory_kib"))?,
                iterations: record.iterations.ok_or_else(|| missing("iterations"))?,
                parallelism: record.parallelism.ok_or_else(|| missing("parallelism"))?,
                version: record.version.unwrap_or(0x13),
                salt: decode("salt", record.salt)?,
            }
        } else {
            return Err(KwError::UnsupportedFormat(format!("kdf {}", record.uuid)));
        };
        Ok(params)
    }
}

/// Header field 6 encoding.
#[derive(Serialize, Deserialize)]
struct KdfRecord {
    uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rounds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memory_kib: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallelism: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
}

impl KdfRecord {
    fn empty(uuid: Uuid) -> Self {
        Self {
            uuid,
            rounds: None,
            seed: None,
            memory_kib: None,
            iterations: None,
            parallelism: None,
            version: None,
            salt: None,
        }
    }
}

/// AES-256-ECB encrypt both halves of `key` `rounds` times under `seed`, then SHA-256.
///
/// Shared by the current format's AES-KDF and the legacy reader's transform.
pub fn aes_kdf(
    key: &[u8; KEY_SIZE],
    seed: &[u8; SEED_SIZE],
    rounds: u64,
    cancel: Option<&CancellationToken>,
) -> KwResult<[u8; KEY_SIZE]> {
    let cipher = Aes256::new(GenericArray::from_slice(seed));
    let mut blocks = [
        Block::clone_from_slice(&key[..16]),
        Block::clone_from_slice(&key[16..]),
    ];

    let mut done = 0u64;
    while done < rounds {
        let step = (rounds - done).min(CANCEL_CHECK_ROUNDS);
        for _ in 0..step {
            cipher.encrypt_blocks(&mut blocks);
        }
        done += step;
        if cancel.is_some_and(|t| t.is_cancelled()) {
            for block in blocks.iter_mut() {
                block.as_mut_slice().zeroize();
            }
            return Err(KwError::Cancelled);
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(blocks[0]);
    hasher.update(blocks[1]);
    for block in blocks.iter_mut() {
        block.as_mut_slice().zeroize();
    }
    Ok(hasher.finalize().into())
}
