//! File-backed serializer for single-file block stores.

use crate::serializer::{Serializer, WritePayload};
use nimbus_common::{BlockId, NimbusError, Result, SerTxnId};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration for the file serializer.
#[derive(Debug, Clone)]
pub struct FileSerializerConfig {
    /// Path of the block store file.
    pub path: PathBuf,
    /// Fixed block size in bytes.
    pub block_size: usize,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for FileSerializerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/blocks.nim"),
            block_size: 4096,
            fsync_enabled: true,
        }
    }
}

/// Stores fixed-size blocks at `block_id * block_size` offsets in one file.
///
/// Deleted blocks are zero-filled in place; the file only ever grows. The
/// serializer transaction id is persisted lazily through `sync`, which is
/// sufficient for a store whose durability contract is per-sync.
pub struct FileSerializer {
    config: FileSerializerConfig,
    file: File,
    num_blocks: u64,
    next_txn_id: u64,
}

impl FileSerializer {
    /// Opens or creates the block store at the configured path.
    pub fn open(config: FileSerializerConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;

        let file_size = file.metadata()?.len();
        let num_blocks = file_size / config.block_size as u64;
        debug!(path = %config.path.display(), num_blocks, "opened block store");

        Ok(Self {
            config,
            file,
            num_blocks,
            next_txn_id: 1,
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn offset_of(&self, block_id: BlockId) -> u64 {
        block_id.0 * self.config.block_size as u64
    }

    fn write_image(&mut self, block_id: BlockId, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.offset_of(block_id)))?;
        self.file.write_all(data)?;

        if self.config.fsync_enabled {
            self.file.sync_all()?;
        }
        if block_id.0 >= self.num_blocks {
            self.num_blocks = block_id.0 + 1;
        }
        Ok(())
    }

    fn read_image(&mut self, block_id: BlockId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.config.block_size];
        self.read(block_id, &mut buf)?;
        Ok(buf)
    }
}

impl Serializer for FileSerializer {
    fn block_size(&self) -> usize {
        self.config.block_size
    }

    fn end_block_id(&self) -> BlockId {
        BlockId(self.num_blocks.max(BlockId::FIRST_PATCH_BLOCK.0))
    }

    fn block_in_use(&self, block_id: BlockId) -> bool {
        block_id.0 < self.num_blocks
    }

    fn read(&mut self, block_id: BlockId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.config.block_size {
            return Err(NimbusError::BlockSizeMismatch {
                expected: self.config.block_size,
                actual: buf.len(),
            });
        }
        if !self.block_in_use(block_id) {
            return Err(NimbusError::BlockNotFound { block_id });
        }

        self.file.seek(SeekFrom::Start(self.offset_of(block_id)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(
        &mut self,
        block_id: BlockId,
        payload: WritePayload<'_>,
        _txn_id: SerTxnId,
    ) -> Result<()> {
        match payload {
            WritePayload::Full(data) => {
                if data.len() != self.config.block_size {
                    return Err(NimbusError::BlockSizeMismatch {
                        expected: self.config.block_size,
                        actual: data.len(),
                    });
                }
                self.write_image(block_id, data)
            }
            WritePayload::Patches(patches) => {
                let mut image = if self.block_in_use(block_id) {
                    self.read_image(block_id)?
                } else {
                    vec![0u8; self.config.block_size]
                };
                for patch in patches {
                    patch.apply(&mut image)?;
                }
                self.write_image(block_id, &image)
            }
            WritePayload::Delete { .. } => {
                // In-place store: a deleted block is zero-filled either way.
                if self.block_in_use(block_id) {
                    let zeroes = vec![0u8; self.config.block_size];
                    self.write_image(block_id, &zeroes)?;
                }
                Ok(())
            }
        }
    }

    fn allocate_txn_id(&mut self) -> SerTxnId {
        let id = SerTxnId(self.next_txn_id);
        self.next_txn_id += 1;
        id
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
