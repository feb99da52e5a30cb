//! APS fragmentation and reassembly.
//!
//! The first block carries the total block count in its block number; every
//! subsequent block carries its own index.

use crate::aps::{ApsFragmentation, FragmentKind};
use crate::error::WireError;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Payload bytes per block
pub const DEFAULT_BLOCK_SIZE: usize = 64;
/// Largest APS payload sent without fragmentation
pub const MAX_UNFRAGMENTED_PAYLOAD: usize = 82;
/// The block count travels in a single byte
pub const MAX_BLOCKS: usize = 255;
/// Partial transfers are dropped after this long without a new block
pub const REASSEMBLY_TIMEOUT_MS: u64 = 10_000;

/// Splits APS payloads into blocks
#[derive(Debug, Clone)]
pub struct Fragmenter {
    block_size: usize,
}

impl Fragmenter {
    /// Create a fragmenter with the default block size
    pub fn new() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Create a fragmenter with a custom block size
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    /// Largest payload that fits in [`MAX_BLOCKS`] blocks
    pub fn max_payload(&self) -> usize {
        MAX_BLOCKS * self.block_size
    }

    /// Split `payload` into `(fragmentation header, block)` pairs
    pub fn split(&self, payload: Bytes) -> Result<Vec<(ApsFragmentation, Bytes)>, WireError> {
        if payload.is_empty() {
            return Ok(vec![]);
        }

        let total = payload.len().div_ceil(self.block_size);
        if total > MAX_BLOCKS {
            return Err(WireError::Size(payload.len()));
        }
        let mut blocks = Vec::with_capacity(total);
        let mut offset = 0;

        for index in 0..total {
            let end = std::cmp::min(offset + self.block_size, payload.len());
            let fragmentation = if index == 0 {
                ApsFragmentation {
                    kind: FragmentKind::First,
                    block_number: total as u8,
                    ack_bitfield: None,
                }
            } else {
                ApsFragmentation {
                    kind: FragmentKind::Subsequent,
                    block_number: index as u8,
                    ack_bitfield: None,
                }
            };
            blocks.push((fragmentation, payload.slice(offset..end)));
            offset = end;
        }

        Ok(blocks)
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}

struct Transfer {
    total: Option<u8>,
    blocks: BTreeMap<u8, Bytes>,
    last_update_ms: u64,
}

/// Collects blocks into complete APS payloads, keyed by sender and APS counter
pub struct Reassembler {
    transfers: HashMap<(u16, u8), Transfer>,
    timeout_ms: u64,
}

impl Reassembler {
    /// Create a reassembler with the default timeout
    pub fn new() -> Self {
        Self {
            transfers: HashMap::new(),
            timeout_ms: REASSEMBLY_TIMEOUT_MS,
        }
    }

    /// Add a block; returns the full payload once every block has arrived
    pub fn add_block(
        &mut self,
        source16: u16,
        counter: u8,
        fragmentation: &ApsFragmentation,
        data: Bytes,
        now_ms: u64,
    ) -> Option<Bytes> {
        self.expire(now_ms);

        if fragmentation.kind == FragmentKind::First && fragmentation.block_number == 0 {
            debug!(
                "Ignoring APS transfer from 0x{:04x} counter {} with no blocks",
                source16, counter
            );
            self.transfers.remove(&(source16, counter));
            return None;
        }

        let transfer = self
            .transfers
            .entry((source16, counter))
            .or_insert_with(|| Transfer {
                total: None,
                blocks: BTreeMap::new(),
                last_update_ms: now_ms,
            });
        transfer.last_update_ms = now_ms;

        match fragmentation.kind {
            FragmentKind::First => {
                transfer.total = Some(fragmentation.block_number);
                transfer.blocks.insert(0, data);
            }
            FragmentKind::Subsequent => {
                transfer.blocks.insert(fragmentation.block_number, data);
            }
        }

        let total = transfer.total?;
        if transfer.blocks.len() < total as usize {
            return None;
        }

        let mut result = BytesMut::new();
        for index in 0..total {
            result.extend_from_slice(transfer.blocks.get(&index)?);
        }
        self.transfers.remove(&(source16, counter));
        Some(result.freeze())
    }

    /// Drop transfers that have been idle past the timeout
    pub fn expire(&mut self, now_ms: u64) {
        let timeout_ms = self.timeout_ms;
        self.transfers.retain(|(source16, counter), transfer| {
            let alive = now_ms.saturating_sub(transfer.last_update_ms) < timeout_ms;
            if !alive {
                debug!(
                    "Dropping incomplete APS transfer from 0x{:04x} counter {}",
                    source16, counter
                );
            }
            alive
        });
    }

    /// Number of transfers in progress
    pub fn pending(&self) -> usize {
        self.transfers.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
