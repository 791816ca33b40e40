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

pub mod block;
pub mod directory;
pub mod fat;
pub mod format;

use std::{path::Path, sync::RwLock};

pub use flatfat_ds::{DataStorage, Error, Result};
pub use flatfat_ds_std::FileStorage;

use block::BlockStorage;
use directory::{DirectoryManager, NAME_SIZE};
use fat::FatManager;
use format::{Geometry, HEADER_SIZE};
use log::{debug, warn};

struct DiskState {
    fat: FatManager,
    dir: DirectoryManager,
}

/// A self-contained, single-file FAT-style virtual disk.
///
/// Composes [`format::Geometry`], [`block::BlockStorage`],
/// [`fat::FatManager`] and [`directory::DirectoryManager`] behind a
/// single readers-writer lock: `read_file` takes the read lock, every
/// mutating call takes the write lock once and runs its logic (including
/// the delete-then-create of an overwrite) without releasing it.
pub struct Disk<DS: DataStorage + Send + Sync> {
    ds: DS,
    geometry: Geometry,
    block: BlockStorage,
    state: RwLock<DiskState>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidFileName(name.to_owned()));
    }
    if name.as_bytes().len() > NAME_SIZE {
        return Err(Error::InvalidFileName(name.to_owned()));
    }
    Ok(())
}

impl<DS: DataStorage + Send + Sync> Disk<DS> {
    fn from_parts(ds: DS, geometry: Geometry, fat: FatManager, dir: DirectoryManager) -> Self {
        let block = BlockStorage::new(geometry.data_offset(), geometry.block_size);
        Self {
            ds,
            geometry,
            block,
            state: RwLock::new(DiskState { fat, dir }),
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Names of the currently live files, in no particular order.
    pub fn list(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        state.dir.names()
    }

    /// Creates a zero-byte file. Overwrites any existing file of the
    /// same name, same as `create_file_with_data`.
    pub fn create_file(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut state = self.state.write().unwrap();
        if state.dir.get_entry(name).is_some() {
            self.delete_locked(&mut state, name)?;
        }
        let slot = state.dir.find_free_entry().ok_or(Error::DirectoryFull)?;
        state.dir.update_entry(&self.ds, slot, name, -1, 0)?;
        Ok(())
    }

    /// Creates a file with initial contents `data`. If `name` already
    /// names a live file, it is deleted first; if the allocation for the
    /// new contents then fails, the old file is gone and the new one was
    /// never created.
    pub fn create_file_with_data(&self, name: &str, data: &[u8]) -> Result<()> {
        validate_name(name)?;
        let mut state = self.state.write().unwrap();
        if state.dir.get_entry(name).is_some() {
            self.delete_locked(&mut state, name)?;
        }

        let block_size = self.block.block_size() as usize;
        let blocks_needed = data.len().div_ceil(block_size.max(1));
        let start_block = if blocks_needed == 0 {
            -1
        } else {
            let blocks = state.fat.allocate_blocks(blocks_needed)?;
            self.block.write(&self.ds, &blocks, data)?;
            state.fat.update_fat_chain(&self.ds, &blocks)?;
            blocks[0] as i32
        };

        let slot = state.dir.find_free_entry().ok_or(Error::DirectoryFull)?;
        state
            .dir
            .update_entry(&self.ds, slot, name, start_block, data.len() as i32)?;
        Ok(())
    }

    /// Extends an existing file by `data.len()` bytes. See spec §4.5.1:
    /// an allocation failure after the tail of the last block has
    /// already been (over)written leaves that garbage in place and does
    /// not update the logical size.
    pub fn append_file(&self, name: &str, data: &[u8]) -> Result<()> {
        validate_name(name)?;
        let mut state = self.state.write().unwrap();
        let Some(entry) = state.dir.get_entry(name).cloned() else {
            return Err(Error::FileNotFound(name.to_owned()));
        };
        if data.is_empty() {
            return Ok(());
        }

        let s0 = entry.file_size;
        let mut start_block = entry.start_block;
        if start_block == -1 {
            let blocks = state.fat.allocate_blocks(1)?;
            state.fat.update_fat_chain(&self.ds, &blocks)?;
            start_block = blocks[0] as i32;
            let slot = state.dir.get_entry_index(name).unwrap();
            state
                .dir
                .update_entry(&self.ds, slot, name, start_block, s0)?;
        }

        let last_block = self.last_block_of_chain(&state, start_block)?;
        let block_size = self.block.block_size() as usize;
        let offset = s0 as usize % block_size;
        // When s0 is a nonzero multiple of block_size the last block is
        // already full; there is no tail to fill and appending must start
        // a fresh block instead of overwriting it at offset 0.
        let tail = if offset == 0 && s0 > 0 { 0 } else { block_size - offset };

        let mut written = 0usize;
        if tail > 0 {
            written = self
                .block
                .append_to_block(&self.ds, last_block, offset as i64, data)?;
        }

        let remaining = &data[written..];
        if !remaining.is_empty() {
            let blocks_needed = remaining.len().div_ceil(block_size);
            let new_blocks = state.fat.allocate_blocks(blocks_needed)?;
            state
                .fat
                .update_fat_entry(&self.ds, last_block, new_blocks[0] as i32)?;
            state.fat.update_fat_chain(&self.ds, &new_blocks)?;
            self.block.write(&self.ds, &new_blocks, remaining)?;
        }

        state
            .dir
            .update_file_size(&self.ds, name, s0 + data.len() as i32)?;
        Ok(())
    }

    /// Reads the entire contents of a file into a freshly allocated
    /// buffer of exactly `fileSize` bytes.
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let state = self.state.read().unwrap();
        let Some(entry) = state.dir.get_entry(name) else {
            return Err(Error::FileNotFound(name.to_owned()));
        };
        let size = entry.file_size as usize;
        let mut buffer = vec![0u8; size];
        if size == 0 {
            return Ok(buffer);
        }

        let block_size = self.block.block_size() as usize;
        let mut block = entry.start_block as u32;
        let mut copied = 0usize;
        loop {
            let chunk = self.block.read_block(&self.ds, block)?;
            let take = block_size.min(size - copied);
            buffer[copied..copied + take].copy_from_slice(&chunk[..take]);
            copied += take;
            if copied >= size {
                break;
            }
            block = state.fat.next_block(&self.ds, block)? as u32;
        }
        Ok(buffer)
    }

    pub fn delete_file(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        self.delete_locked(&mut state, name)
    }

    /// Flushes the FAT region, then the directory region, then forces
    /// the host file to durable storage, in that order.
    pub fn close(self) -> Result<()> {
        let state = self.state.into_inner().unwrap();
        state.fat.flush(&self.ds)?;
        state.dir.flush(&self.ds)?;
        self.ds.flush()?;
        Ok(())
    }

    fn delete_locked(&self, state: &mut DiskState, name: &str) -> Result<()> {
        let Some(entry) = state.dir.get_entry(name) else {
            return Err(Error::FileNotFound(name.to_owned()));
        };
        let start_block = entry.start_block;
        state.fat.free_chain(&self.ds, start_block)?;
        state.dir.mark_entry_deleted(&self.ds, name)?;
        Ok(())
    }

    fn last_block_of_chain(&self, state: &DiskState, start: i32) -> Result<u32> {
        let mut current = start as u32;
        loop {
            let next = state.fat.next_block(&self.ds, current)?;
            if next == fat::EOC {
                return Ok(current);
            }
            current = next as u32;
        }
    }
}

impl Disk<FileStorage> {
    /// Creates a fresh disk at `path` with the spec's default geometry
    /// (4 KiB blocks, 1 GiB capacity, 65536 directory slots), replacing
    /// any existing file there.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_geometry(path, Geometry::default())
    }

    /// Creates a fresh disk with an explicit geometry.
    pub fn create_with_geometry(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        debug!(
            "formatting disk at {:?} with {} byte blocks, {} blocks, {} directory slots",
            path.as_ref(),
            geometry.block_size,
            geometry.fat_entries,
            geometry.max_files
        );
        let ds = FileStorage::create(path)?;
        ds.set_len(geometry.data_offset() + geometry.capacity_bytes())?;
        ds.write(0, &geometry.serialize())?;
        Ok(Self::from_parts(
            ds,
            geometry,
            FatManager::new_fresh(geometry.fat_offset(), geometry.fat_entries),
            DirectoryManager::new_fresh(geometry.directory_offset(), geometry.max_files),
        ))
    }

    /// Creates a fresh disk sized by total capacity rather than block
    /// count, mirroring spec §4.5's `create(path, blockSize,
    /// maxDiskSize, maxFiles)` overload.
    pub fn create_with_capacity(
        path: impl AsRef<Path>,
        block_size: u32,
        max_disk_size: u64,
        max_files: u32,
    ) -> Result<Self> {
        let fat_entries = max_disk_size.div_ceil(block_size.max(1) as u64) as u32;
        let geometry = Geometry::new(block_size, fat_entries, max_files)?;
        Self::create_with_geometry(path, geometry)
    }

    /// Opens an existing disk, parsing its header and rebuilding the
    /// in-memory FAT bitmap and directory index from the on-disk state.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let ds = FileStorage::open(path_ref).map_err(|err| match err {
            Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
                warn!("disk file not found at {path_ref:?}");
                Error::FileNotFound(path_ref.display().to_string())
            }
            other => other,
        })?;

        let mut header = [0u8; HEADER_SIZE];
        ds.read(0, &mut header)?;
        let geometry = Geometry::parse(&header)?;

        let fat = FatManager::load(&ds, geometry.fat_offset(), geometry.fat_entries)?;
        let dir = DirectoryManager::load(&ds, geometry.directory_offset(), geometry.max_files)?;
        Ok(Self::from_parts(ds, geometry, fat, dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn scratch_disk(geometry: Geometry) -> (NamedTempFile, Disk<FileStorage>) {
        let _ = env_logger::try_init();
        let file = NamedTempFile::new().unwrap();
        let disk = Disk::create_with_geometry(file.path(), geometry).unwrap();
        (file, disk)
    }

    #[test]
    fn create_and_read_small_file() {
        let (_file, disk) = scratch_disk(Geometry::new(4096, 16384, 1024).unwrap());
        disk.create_file_with_data("test.txt", b"Test content").unwrap();
        assert_eq!(disk.read_file("test.txt").unwrap(), b"Test content");
    }

    #[test]
    fn overwrite_replaces_contents() {
        let (_file, disk) = scratch_disk(Geometry::default());
        disk.create_file_with_data("f.txt", b"Old").unwrap();
        disk.create_file_with_data("f.txt", b"New content").unwrap();
        assert_eq!(disk.read_file("f.txt").unwrap(), b"New content");
    }

    #[test]
    fn append_across_many_blocks() {
        let (_file, disk) = scratch_disk(Geometry::new(4096, 1024, 64).unwrap());
        disk.create_file_with_data("a.txt", b"Initial ").unwrap();
        let tail = vec![7u8; 12288];
        disk.append_file("a.txt", &tail).unwrap();
        let read_back = disk.read_file("a.txt").unwrap();
        assert_eq!(read_back.len(), 8 + 12288);
        assert_eq!(&read_back[..8], b"Initial ");
        assert_eq!(&read_back[8..], &tail[..]);
    }

    #[test]
    fn empty_file_then_append() {
        let (_file, disk) = scratch_disk(Geometry::default());
        disk.create_file("e.txt").unwrap();
        assert_eq!(disk.read_file("e.txt").unwrap(), b"");
        disk.append_file("e.txt", b"hi").unwrap();
        assert_eq!(disk.read_file("e.txt").unwrap(), b"hi");
    }

    #[test]
    fn directory_full_once_every_slot_taken() {
        let (_file, disk) = scratch_disk(Geometry::new(512, 64, 4).unwrap());
        for i in 0..4 {
            disk.create_file(&format!("f{i}")).unwrap();
        }
        assert!(matches!(
            disk.create_file("extra"),
            Err(Error::DirectoryFull)
        ));
    }

    #[test]
    fn insufficient_space_when_payload_exceeds_capacity() {
        let (_file, disk) = scratch_disk(Geometry::new(512, 4, 16).unwrap());
        let huge = vec![0u8; 512 * 4 + 1];
        assert!(matches!(
            disk.create_file_with_data("huge", &huge),
            Err(Error::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn unicode_name_round_trips() {
        let (_file, disk) = scratch_disk(Geometry::default());
        disk.create_file_with_data("测试文件.txt", b"Unicode content")
            .unwrap();
        assert_eq!(
            disk.read_file("测试文件.txt").unwrap(),
            b"Unicode content"
        );
    }

    #[test]
    fn filename_length_boundary() {
        let (_file, disk) = scratch_disk(Geometry::default());
        let exactly_24 = "a".repeat(24);
        disk.create_file(&exactly_24).unwrap();

        let twenty_five = "a".repeat(25);
        assert!(matches!(
            disk.create_file(&twenty_five),
            Err(Error::InvalidFileName(_))
        ));
        assert!(matches!(disk.create_file(""), Err(Error::InvalidFileName(_))));
    }

    #[test]
    fn delete_then_read_misses() {
        let (_file, disk) = scratch_disk(Geometry::default());
        disk.create_file_with_data("n.txt", b"bytes").unwrap();
        disk.delete_file("n.txt").unwrap();
        assert!(matches!(
            disk.read_file("n.txt"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn delete_missing_file_fails() {
        let (_file, disk) = scratch_disk(Geometry::default());
        assert!(matches!(
            disk.delete_file("nope.txt"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn persists_across_reload() {
        let file = NamedTempFile::new().unwrap();
        let geometry = Geometry::new(512, 256, 32).unwrap();
        {
            let disk = Disk::create_with_geometry(file.path(), geometry).unwrap();
            disk.create_file_with_data("one.txt", b"first").unwrap();
            disk.create_file_with_data("two.txt", b"second").unwrap();
            disk.close().unwrap();
        }

        let reloaded = Disk::load_from_file(file.path()).unwrap();
        assert_eq!(reloaded.read_file("one.txt").unwrap(), b"first");
        assert_eq!(reloaded.read_file("two.txt").unwrap(), b"second");
    }

    #[test]
    fn load_missing_file_reports_file_not_found() {
        assert!(matches!(
            Disk::<FileStorage>::load_from_file("/nonexistent/path/for/flatfat"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn list_reflects_live_files_only() {
        let (_file, disk) = scratch_disk(Geometry::default());
        disk.create_file("a").unwrap();
        disk.create_file("b").unwrap();
        disk.delete_file("a").unwrap();
        let mut names = disk.list();
        names.sort();
        assert_eq!(names, vec!["b".to_string()]);
    }
}
