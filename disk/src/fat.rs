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
use zerocopy::{little_endian::I32, IntoBytes};

/// Sentinel FAT value marking the end of a chain.
pub const EOC: i32 = -1;
/// Sentinel FAT value marking a free block.
pub const FREE: i32 = 0;

/// Maintains FAT chains on disk and an in-memory free-block bitmap.
///
/// Allocation and free are the only operations permitted to change the
/// bitmap; any write that changes a FAT entry's free-ness goes through
/// one of them.
pub struct FatManager {
    fat_offset: u64,
    fat_entries: u32,
    free: Vec<bool>,
    free_count: usize,
}

impl FatManager {
    /// A fresh disk: the FAT region is zero-filled on disk, so every
    /// block starts free.
    pub fn new_fresh(fat_offset: u64, fat_entries: u32) -> Self {
        Self {
            fat_offset,
            fat_entries,
            free: vec![true; fat_entries as usize],
            free_count: fat_entries as usize,
        }
    }

    /// Reconstructs the free bitmap by scanning every FAT entry on an
    /// already-formatted disk. Correct iff the on-disk invariants held at
    /// the time of the last close.
    pub fn load(ds: &impl DataStorage, fat_offset: u64, fat_entries: u32) -> Result<Self> {
        let mut free = Vec::with_capacity(fat_entries as usize);
        let mut free_count = 0;
        for i in 0..fat_entries {
            let is_free = Self::read_entry(ds, fat_offset, i)? == FREE;
            if is_free {
                free_count += 1;
            }
            free.push(is_free);
        }
        Ok(Self {
            fat_offset,
            fat_entries,
            free,
            free_count,
        })
    }

    fn read_entry(ds: &impl DataStorage, fat_offset: u64, block: u32) -> Result<i32> {
        let mut value = I32::new(0);
        ds.read(fat_offset + block as u64 * 4, value.as_mut_bytes())?;
        Ok(value.get())
    }

    fn write_entry(&self, ds: &impl DataStorage, block: u32, value: i32) -> Result<()> {
        ds.write(
            self.fat_offset + block as u64 * 4,
            I32::new(value).as_bytes(),
        )
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Claims `n` distinct free blocks in ascending index order. Fails
    /// without touching the bitmap if fewer than `n` blocks are free.
    /// The returned order is the order the caller should chain them in.
    pub fn allocate_blocks(&mut self, n: usize) -> Result<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if self.free_count < n {
            return Err(Error::InsufficientSpace {
                needed: n,
                available: self.free_count,
            });
        }
        let mut blocks = Vec::with_capacity(n);
        for (index, free) in self.free.iter_mut().enumerate() {
            if blocks.len() == n {
                break;
            }
            if *free {
                *free = false;
                blocks.push(index as u32);
            }
        }
        self.free_count -= n;
        Ok(blocks)
    }

    /// Links `blocks` into a chain: each entry points at the next, the
    /// last is terminated with `EOC`.
    pub fn update_fat_chain(&self, ds: &impl DataStorage, blocks: &[u32]) -> Result<()> {
        for window in blocks.windows(2) {
            self.write_entry(ds, window[0], window[1] as i32)?;
        }
        if let Some(&last) = blocks.last() {
            self.write_entry(ds, last, EOC)?;
        }
        Ok(())
    }

    /// Overwrites a single FAT slot, used when splicing a new tail onto
    /// an existing chain.
    pub fn update_fat_entry(&self, ds: &impl DataStorage, block: u32, next: i32) -> Result<()> {
        self.write_entry(ds, block, next)
    }

    pub fn next_block(&self, ds: &impl DataStorage, block: u32) -> Result<i32> {
        Self::read_entry(ds, self.fat_offset, block)
    }

    /// Walks the chain from `start_block`, freeing every block it visits.
    /// A no-op if `start_block` is `EOC` (the empty-file sentinel).
    pub fn free_chain(&mut self, ds: &impl DataStorage, start_block: i32) -> Result<()> {
        let mut current = start_block;
        while current >= 0 && (current as u32) < self.fat_entries {
            let index = current as u32;
            let next = self.next_block(ds, index)?;
            self.write_entry(ds, index, FREE)?;
            if !self.free[index as usize] {
                self.free[index as usize] = true;
                self.free_count += 1;
            }
            current = next;
        }
        Ok(())
    }

    pub fn flush(&self, ds: &impl DataStorage) -> Result<()> {
        ds.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flatfat_ds_std::FileStorage;
    use tempfile::NamedTempFile;

    fn storage(fat_entries: u32) -> (NamedTempFile, FileStorage) {
        let file = NamedTempFile::new().unwrap();
        let ds = FileStorage::create(file.path()).unwrap();
        ds.set_len(fat_entries as u64 * 4).unwrap();
        (file, ds)
    }

    #[test]
    fn allocates_in_ascending_order() {
        let (_file, ds) = storage(8);
        let mut fat = FatManager::new_fresh(0, 8);
        let blocks = fat.allocate_blocks(3).unwrap();
        assert_eq!(blocks, vec![0, 1, 2]);
        fat.update_fat_chain(&ds, &blocks).unwrap();
        assert_eq!(fat.next_block(&ds, 0).unwrap(), 1);
        assert_eq!(fat.next_block(&ds, 1).unwrap(), 2);
        assert_eq!(fat.next_block(&ds, 2).unwrap(), EOC);
    }

    #[test]
    fn fails_without_mutating_bitmap_when_short_on_space() {
        let (_file, _ds) = storage(2);
        let mut fat = FatManager::new_fresh(0, 2);
        assert!(matches!(
            fat.allocate_blocks(3),
            Err(Error::InsufficientSpace {
                needed: 3,
                available: 2
            })
        ));
        assert_eq!(fat.free_count(), 2);
    }

    #[test]
    fn free_chain_returns_blocks_to_the_bitmap() {
        let (_file, ds) = storage(8);
        let mut fat = FatManager::new_fresh(0, 8);
        let blocks = fat.allocate_blocks(3).unwrap();
        fat.update_fat_chain(&ds, &blocks).unwrap();
        fat.free_chain(&ds, blocks[0] as i32).unwrap();
        assert_eq!(fat.free_count(), 8);
        for &block in &blocks {
            assert_eq!(fat.next_block(&ds, block).unwrap(), FREE);
        }
    }

    #[test]
    fn load_reconstructs_bitmap_from_disk() {
        let (_file, ds) = storage(4);
        let mut fat = FatManager::new_fresh(0, 4);
        let blocks = fat.allocate_blocks(2).unwrap();
        fat.update_fat_chain(&ds, &blocks).unwrap();

        let loaded = FatManager::load(&ds, 0, 4).unwrap();
        assert_eq!(loaded.free_count(), 2);
    }
}
