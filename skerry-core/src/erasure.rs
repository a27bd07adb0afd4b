//! Streaming Reed-Solomon erasure coding
//!
//! Encodes `k` equal-length data streams into `m` parity streams, and
//! reconstructs missing data streams from any `k` of the `k+m` total.
//! The codec works in fixed-size rounds over GF(2^8), so memory use is
//! one chunk per shard regardless of shard length. Callers are
//! responsible for padding the input to equal shard lengths.

use crate::error::{Error, Result};
use crate::STREAM_CHUNK;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Erasure coding configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (m)
    pub parity_shards: usize,
}

impl ErasureConfig {
    /// Create a new erasure config
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::Configuration("data_shards must be > 0".to_string()));
        }
        if parity_shards == 0 {
            return Err(Error::Configuration(
                "parity_shards must be > 0".to_string(),
            ));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Maximum number of lost shards that can be tolerated
    pub fn max_losses(&self) -> usize {
        self.parity_shards
    }
}

/// Streaming Reed-Solomon encoder/reconstructor with fixed `(k, m)`.
pub struct ErasureCoder {
    config: ErasureConfig,
    rs: ReedSolomon,
}

impl ErasureCoder {
    pub fn new(config: ErasureConfig) -> Result<Self> {
        let rs = ReedSolomon::new(config.data_shards, config.parity_shards)?;
        Ok(Self { config, rs })
    }

    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Encode `k` equal-length data streams, writing `m` parity streams
    /// of the same length.
    pub fn encode<R: Read, W: Write>(&self, data: &mut [R], parity: &mut [W]) -> Result<()> {
        if data.len() != self.config.data_shards {
            return Err(Error::Codec(format!(
                "expected {} data streams, got {}",
                self.config.data_shards,
                data.len()
            )));
        }
        if parity.len() != self.config.parity_shards {
            return Err(Error::Codec(format!(
                "expected {} parity streams, got {}",
                self.config.parity_shards,
                parity.len()
            )));
        }

        loop {
            let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.config.total_shards());
            let mut round_len: Option<usize> = None;
            for reader in data.iter_mut() {
                let mut buf = vec![0u8; STREAM_CHUNK];
                let n = read_full(reader, &mut buf)?;
                buf.truncate(n);
                match round_len {
                    Some(len) if len != n => {
                        return Err(Error::Codec(
                            "data streams have unequal lengths".to_string(),
                        ));
                    }
                    None => round_len = Some(n),
                    _ => {}
                }
                shards.push(buf);
            }
            let n = round_len.unwrap_or(0);
            if n == 0 {
                return Ok(());
            }
            for _ in 0..self.config.parity_shards {
                shards.push(vec![0u8; n]);
            }

            self.rs.encode(&mut shards)?;

            for (writer, shard) in parity
                .iter_mut()
                .zip(shards.iter().skip(self.config.data_shards))
            {
                writer.write_all(shard)?;
            }
        }
    }

    /// Rebuild missing data streams from the present shards.
    ///
    /// `shards` holds all `k+m` slots in coding order with `None` for
    /// shards that could not be retrieved. `fills` must be the same
    /// length, with a writer exactly in each missing *data* slot;
    /// missing parity slots are never rebuilt.
    pub fn reconstruct<R: Read, W: Write>(
        &self,
        shards: &mut [Option<R>],
        fills: &mut [Option<W>],
    ) -> Result<()> {
        let total = self.config.total_shards();
        if shards.len() != total || fills.len() != total {
            return Err(Error::Codec(format!(
                "expected {} shard slots, got {} with {} fill slots",
                total,
                shards.len(),
                fills.len()
            )));
        }
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.config.data_shards {
            return Err(Error::InsufficientShards {
                available,
                required: self.config.data_shards,
            });
        }
        for (i, (shard, fill)) in shards.iter().zip(fills.iter()).enumerate() {
            let needs_fill = shard.is_none() && i < self.config.data_shards;
            if needs_fill != fill.is_some() {
                return Err(Error::Codec(format!(
                    "fill slot {i} does not line up with missing data shards"
                )));
            }
        }

        loop {
            let mut bufs: Vec<Option<Vec<u8>>> = Vec::with_capacity(total);
            let mut round_len: Option<usize> = None;
            for slot in shards.iter_mut() {
                match slot {
                    Some(reader) => {
                        let mut buf = vec![0u8; STREAM_CHUNK];
                        let n = read_full(reader, &mut buf)?;
                        buf.truncate(n);
                        match round_len {
                            Some(len) if len != n => {
                                return Err(Error::Codec(
                                    "shard streams have unequal lengths".to_string(),
                                ));
                            }
                            None => round_len = Some(n),
                            _ => {}
                        }
                        bufs.push(Some(buf));
                    }
                    None => bufs.push(None),
                }
            }
            let n = round_len.unwrap_or(0);
            if n == 0 {
                return Ok(());
            }

            self.rs.reconstruct_data(&mut bufs)?;

            for (buf, fill) in bufs.iter().zip(fills.iter_mut()) {
                if let Some(writer) = fill.as_mut() {
                    let recovered = buf
                        .as_ref()
                        .ok_or_else(|| Error::Codec("reconstruction left a hole".to_string()))?;
                    writer.write_all(recovered)?;
                }
            }
        }
    }
}

/// Read until `buf` is full or the stream ends, returning the byte count.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
