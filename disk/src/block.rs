// Copyright 2024 The flatfat Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use flatfat_ds::{DataStorage, Error, Result};

/// Byte-aligned I/O against the data region of a virtual disk, given a
/// block index. Does no caching; the host file is extended lazily by
/// writes, and unused blocks are never zero-filled.
pub struct BlockStorage {
    base_offset: u64,
    block_size: u32,
}

impl BlockStorage {
    pub fn new(base_offset: u64, block_size: u32) -> Self {
        Self {
            base_offset,
            block_size,
        }
    }

    fn offset(&self, block: u32) -> u64 {
        self.base_offset + block as u64 * self.block_size as u64
    }

    /// Writes `data` across `blocks` in order, `block_size` bytes at a
    /// time (less for the final block). The caller guarantees `data` has
    /// enough bytes to fill every block but possibly the last.
    pub fn write(&self, ds: &impl DataStorage, blocks: &[u32], mut data: &[u8]) -> Result<()> {
        for &block in blocks {
            let len = (self.block_size as usize).min(data.len());
            ds.write(self.offset(block), &data[..len])?;
            data = &data[len..];
        }
        Ok(())
    }

    /// Writes up to `block_size - offset` bytes of `data` into `block`
    /// starting at `offset`.
    pub fn append_to_block(&self, ds: &impl DataStorage, block: u32, offset: i64, data: &[u8]) -> Result<usize> {
        if offset < 0 || offset >= self.block_size as i64 {
            return Err(Error::InvalidBlockOperation {
                offset,
                block_size: self.block_size as i64,
            });
        }
        let tail = self.block_size as usize - offset as usize;
        let len = tail.min(data.len());
        ds.write(self.offset(block) + offset as u64, &data[..len])?;
        Ok(len)
    }

    /// Reads exactly `block_size` bytes starting at `block`.
    pub fn read_block(&self, ds: &impl DataStorage, block: u32) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.block_size as usize];
        ds.read(self.offset(block), &mut buffer)?;
        Ok(buffer)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}
