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

use std::collections::HashMap;

use flatfat_ds::{DataStorage, Result};
use zerocopy::{little_endian::I32, FromBytes, Immutable, IntoBytes, KnownLayout};

pub const NAME_SIZE: usize = 24;
pub const ENTRY_SIZE: usize = 32;

const UNUSED: u8 = 0x00;
const TOMBSTONE: u8 = 0xE5;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawEntry {
    name: [u8; NAME_SIZE],
    start_block: I32,
    file_size: I32,
}

/// A live directory entry, as kept in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub start_block: i32,
    pub file_size: i32,
}

/// Persists 32-byte directory entries and maintains an in-memory
/// name-to-slot index. Deletion tombstones rather than compacts.
pub struct DirectoryManager {
    dir_offset: u64,
    max_files: u32,
    entries: Vec<Option<DirEntry>>,
    name_to_slot: HashMap<String, u32>,
}

fn encode_name(name: &str) -> [u8; NAME_SIZE] {
    let mut buffer = [0u8; NAME_SIZE];
    let bytes = name.as_bytes();
    buffer[..bytes.len()].copy_from_slice(bytes);
    buffer
}

fn decode_name(raw: &[u8; NAME_SIZE]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl DirectoryManager {
    pub fn new_fresh(dir_offset: u64, max_files: u32) -> Self {
        Self {
            dir_offset,
            max_files,
            entries: vec![None; max_files as usize],
            name_to_slot: HashMap::new(),
        }
    }

    pub fn load(ds: &impl DataStorage, dir_offset: u64, max_files: u32) -> Result<Self> {
        let mut entries = Vec::with_capacity(max_files as usize);
        let mut name_to_slot = HashMap::new();
        for slot in 0..max_files {
            let raw = Self::read_raw(ds, dir_offset, slot)?;
            match raw.name[0] {
                UNUSED | TOMBSTONE => entries.push(None),
                _ => {
                    let name = decode_name(&raw.name);
                    name_to_slot.insert(name.clone(), slot);
                    entries.push(Some(DirEntry {
                        name,
                        start_block: raw.start_block.get(),
                        file_size: raw.file_size.get(),
                    }));
                }
            }
        }
        Ok(Self {
            dir_offset,
            max_files,
            entries,
            name_to_slot,
        })
    }

    fn slot_offset(&self, slot: u32) -> u64 {
        self.dir_offset + slot as u64 * ENTRY_SIZE as u64
    }

    fn read_raw(ds: &impl DataStorage, dir_offset: u64, slot: u32) -> Result<RawEntry> {
        let mut raw = RawEntry {
            name: [0; NAME_SIZE],
            start_block: I32::new(0),
            file_size: I32::new(0),
        };
        ds.read(
            dir_offset + slot as u64 * ENTRY_SIZE as u64,
            raw.as_mut_bytes(),
        )?;
        Ok(raw)
    }

    /// Lowest-index slot whose in-memory state is unused. O(max_files).
    pub fn find_free_entry(&self) -> Option<u32> {
        self.entries
            .iter()
            .position(Option::is_none)
            .map(|i| i as u32)
    }

    pub fn update_entry(
        &mut self,
        ds: &impl DataStorage,
        slot: u32,
        name: &str,
        start_block: i32,
        file_size: i32,
    ) -> Result<()> {
        let raw = RawEntry {
            name: encode_name(name),
            start_block: I32::new(start_block),
            file_size: I32::new(file_size),
        };
        ds.write(self.slot_offset(slot), raw.as_bytes())?;

        if let Some(previous) = self.entries[slot as usize].take() {
            self.name_to_slot.remove(&previous.name);
        }
        self.entries[slot as usize] = Some(DirEntry {
            name: name.to_owned(),
            start_block,
            file_size,
        });
        self.name_to_slot.insert(name.to_owned(), slot);
        Ok(())
    }

    pub fn get_entry(&self, name: &str) -> Option<&DirEntry> {
        let slot = *self.name_to_slot.get(name)?;
        self.entries[slot as usize].as_ref()
    }

    pub fn get_entry_index(&self, name: &str) -> Option<u32> {
        self.name_to_slot.get(name).copied()
    }

    /// Writes the tombstone byte, leaving the rest of the slot's bytes
    /// undisturbed on disk.
    pub fn mark_entry_deleted(&mut self, ds: &impl DataStorage, name: &str) -> Result<()> {
        let Some(slot) = self.name_to_slot.remove(name) else {
            return Ok(());
        };
        ds.write(self.slot_offset(slot), &[TOMBSTONE])?;
        self.entries[slot as usize] = None;
        Ok(())
    }

    /// Overwrites only the 4-byte size field of the slot.
    pub fn update_file_size(&mut self, ds: &impl DataStorage, name: &str, new_size: i32) -> Result<()> {
        let Some(&slot) = self.name_to_slot.get(name) else {
            return Ok(());
        };
        let size_offset = self.slot_offset(slot) + NAME_SIZE as u64 + 4;
        ds.write(size_offset, I32::new(new_size).as_bytes())?;
        if let Some(entry) = self.entries[slot as usize].as_mut() {
            entry.file_size = new_size;
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.name_to_slot.keys().cloned().collect()
    }

    pub fn max_files(&self) -> u32 {
        self.max_files
    }

    pub fn flush(&self, ds: &impl DataStorage) -> Result<()> {
        ds.flush()
    }
}
