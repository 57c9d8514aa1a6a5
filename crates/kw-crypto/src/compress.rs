use kw_core::{KwError, KwResult};

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    pub fn from_u32(value: u32) -> KwResult<Self> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Zstd),
            other => Err(KwError::UnsupportedFormat(format!("compression {other}"))),
        }
    }

    pub fn from_name(name: &str) -> KwResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "zstd" => Ok(Compression::Zstd),
            other => Err(KwError::Config(format!(
                "unknown compression {other:?} (expected zstd or none)"
            ))),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
        }
    }

    pub fn compress(self, data: &[u8]) -> KwResult<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => Ok(zstd::encode_all(data, ZSTD_LEVEL)?),
        }
    }

    pub fn decompress(self, data: &[u8]) -> KwResult<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd => zstd::decode_all(data)
                .map_err(|e| KwError::Format(format!("zstd decompression failed: {e}"))),
        }
    }
}
