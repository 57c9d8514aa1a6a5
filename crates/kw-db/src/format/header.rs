//! Current-generation container header
//!
//! ```text
//! sig1 u32 LE | sig2 u32 LE | version u32 LE (major << 16 | minor)
//! repeat: [id u8][len u32 LE][data]   until id 0
//! ```

use kw_core::{KwError, KwResult};
use kw_crypto::{random_bytes, CipherId, Compression, KdfParams, SEED_SIZE};
use uuid::Uuid;

use super::{SIG1, SIG2_CURRENT};

/// Major 1, minor 0
pub const FORMAT_VERSION: u32 = 0x0001_0000;

const FIELD_END: u8 = 0;
const FIELD_CIPHER: u8 = 2;
const FIELD_COMPRESSION: u8 = 3;
const FIELD_MASTER_SEED: u8 = 4;
const FIELD_IV: u8 = 5;
const FIELD_KDF: u8 = 6;
const FIELD_STREAM_START: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u32,
    pub cipher: CipherId,
    pub compression: Compression,
    pub master_seed: [u8; SEED_SIZE],
    pub iv: Vec<u8>,
    pub kdf: KdfParams,
    pub stream_start: [u8; SEED_SIZE],
    /// Fields this version does not know, re-emitted verbatim
    pub unknown: Vec<(u8, Vec<u8>)>,
}

impl ContainerHeader {
    pub fn new(cipher: CipherId, compression: Compression, kdf: KdfParams) -> Self {
        let mut header = Self {
            version: FORMAT_VERSION,
            cipher,
            compression,
            master_seed: [0; SEED_SIZE],
            iv: Vec::new(),
            kdf,
            stream_start: [0; SEED_SIZE],
            unknown: Vec::new(),
        };
        header.refresh_seeds();
        header
    }

    /// Fresh master seed, IV and stream-start bytes. The KDF seed is kept so
    /// the transformed key stays valid.
    pub fn refresh_seeds(&mut self) {
        self.master_seed = random_bytes::<SEED_SIZE>();
        self.stream_start = random_bytes::<SEED_SIZE>();
        let iv = random_bytes::<16>();
        self.iv = iv[..self.cipher.iv_len()].to_vec();
    }

    pub fn to_bytes(&self) -> KwResult<Vec<u8>> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&SIG1.to_le_bytes());
        out.extend_from_slice(&SIG2_CURRENT.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());

        put_field(&mut out, FIELD_CIPHER, self.cipher.uuid().as_bytes());
        put_field(&mut out, FIELD_COMPRESSION, &self.compression.as_u32().to_le_bytes());
        put_field(&mut out, FIELD_MASTER_SEED, &self.master_seed);
        put_field(&mut out, FIELD_IV, &self.iv);
        put_field(&mut out, FIELD_KDF, &self.kdf.to_json()?);
        put_field(&mut out, FIELD_STREAM_START, &self.stream_start);
        for (id, data) in &self.unknown {
            put_field(&mut out, *id, data);
        }
        put_field(&mut out, FIELD_END, &[]);
        Ok(out)
    }

    /// Parse the header at the start of `data`; returns it with its length in bytes.
    pub fn parse(data: &[u8]) -> KwResult<(Self, usize)> {
        let mut cursor = Cursor { data, pos: 0 };
        let sig1 = cursor.u32()?;
        let sig2 = cursor.u32()?;
        if sig1 != SIG1 || sig2 != SIG2_CURRENT {
            return Err(KwError::UnsupportedFormat(format!(
                "unknown signature {sig1:#010x} {sig2:#010x}"
            )));
        }
        let version = cursor.u32()?;
        if version >> 16 != FORMAT_VERSION >> 16 {
            return Err(KwError::UnsupportedFormat(format!(
                "container version {}.{}",
                version >> 16,
                version & 0xffff
            )));
        }

        let mut cipher = None;
        let mut compression = None;
        let mut master_seed = None;
        let mut iv = None;
        let mut kdf = None;
        let mut stream_start = None;
        let mut unknown = Vec::new();

        loop {
            let id = cursor.u8()?;
            let len = cursor.u32()? as usize;
            let value = cursor.take(len)?;
            match id {
                FIELD_END => break,
                FIELD_CIPHER => {
                    let id = Uuid::from_slice(value)
                        .map_err(|_| KwError::Format("cipher id is not 16 bytes".into()))?;
                    cipher = Some(CipherId::from_uuid(id)?);
                }
                FIELD_COMPRESSION => {
                    let raw: [u8; 4] = value
                        .try_into()
                        .map_err(|_| KwError::Format("compression flag is not 4 bytes".into()))?;
                    compression = Some(Compression::from_u32(u32::from_le_bytes(raw))?);
                }
                FIELD_MASTER_SEED => master_seed = Some(fixed::<SEED_SIZE>(value, "master seed")?),
                FIELD_IV => iv = Some(value.to_vec()),
                FIELD_KDF => kdf = Some(KdfParams::from_json(value)?),
                FIELD_STREAM_START => {
                    stream_start = Some(fixed::<SEED_SIZE>(value, "stream start bytes")?)
                }
                other => unknown.push((other, value.to_vec())),
            }
        }

        let missing = |name: &str| KwError::Format(format!("header field {name} missing"));
        let cipher = cipher.ok_or_else(|| missing("cipher"))?;
        let iv = iv.ok_or_else(|| missing("encryption iv"))?;
        if iv.len() != cipher.iv_len() {
            return Err(KwError::Format(format!(
                "{} needs a {}-byte IV, header has {}",
                cipher.name(),
                cipher.iv_len(),
                iv.len()
            )));
        }
        let header = Self {
            version,
            cipher,
            compression: compression.ok_or_else(|| missing("compression"))?,
            master_seed: master_seed.ok_or_else(|| missing("master seed"))?,
            iv,
            kdf: kdf.ok_or_else(|| missing("kdf parameters"))?,
            stream_start: stream_start.ok_or_else(|| missing("stream start bytes"))?,
            unknown,
        };
        Ok((header, cursor.pos))
    }
}

fn put_field(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    out.push(id);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

fn fixed<const N: usize>(value: &[u8], name: &str) -> KwResult<[u8; N]> {
    value
        .try_into()
        .map_err(|_| KwError::Format(format!("{name} must be {N} bytes, got {}", value.len())))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> KwResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| KwError::Format("header truncated".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> KwResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> KwResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
