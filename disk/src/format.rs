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

use flatfat_ds::{Error, Result};
use log::error;
use zerocopy::{little_endian::I32, FromBytes, Immutable, IntoBytes, KnownLayout};

pub const HEADER_SIZE: usize = 16;
pub const DIR_ENTRY_SIZE: usize = 32;
pub const FAT_ENTRY_SIZE: usize = 4;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_FAT_ENTRIES: u32 = 262_144; // 1 GiB / 4 KiB
pub const DEFAULT_MAX_FILES: u32 = 65_536;

/// On-disk superblock, packed and little-endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawHeader {
    block_size: I32,
    fat_entries: I32,
    max_files: I32,
    reserved: I32,
}

/// The geometry of a virtual disk: block size, FAT slot count (== data
/// block count) and directory slot count. Determines every other derived
/// offset in the host file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub fat_entries: u32,
    pub max_files: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            fat_entries: DEFAULT_FAT_ENTRIES,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl Geometry {
    pub fn new(block_size: u32, fat_entries: u32, max_files: u32) -> Result<Self> {
        let geometry = Self {
            block_size,
            fat_entries,
            max_files,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            error!("block size shall not be 0");
            return Err(Error::InvalidGeometry("block size must be nonzero"));
        }
        let directory_offset = (HEADER_SIZE as u64)
            .checked_add(self.fat_entries as u64 * FAT_ENTRY_SIZE as u64)
            .ok_or(Error::InvalidGeometry("fat region overflows"))?;
        directory_offset
            .checked_add(self.max_files as u64 * DIR_ENTRY_SIZE as u64)
            .ok_or(Error::InvalidGeometry("directory region overflows"))?;
        Ok(())
    }

    pub fn fat_offset(&self) -> u64 {
        HEADER_SIZE as u64
    }

    pub fn directory_offset(&self) -> u64 {
        self.fat_offset() + self.fat_entries as u64 * FAT_ENTRY_SIZE as u64
    }

    pub fn data_offset(&self) -> u64 {
        self.directory_offset() + self.max_files as u64 * DIR_ENTRY_SIZE as u64
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.fat_entries as u64 * self.block_size as u64
    }

    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let raw = RawHeader {
            block_size: I32::new(self.block_size as i32),
            fat_entries: I32::new(self.fat_entries as i32),
            max_files: I32::new(self.max_files as i32),
            reserved: I32::new(0),
        };
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(raw.as_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw = RawHeader::read_from_bytes(bytes)
            .map_err(|_| Error::InvalidGeometry("header is truncated"))?;
        let geometry = Self {
            block_size: raw.block_size.get() as u32,
            fat_entries: raw.fat_entries.get() as u32,
            max_files: raw.max_files.get() as u32,
        };
        geometry.validate()?;
        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let geometry = Geometry::new(512, 1024, 128).unwrap();
        let bytes = geometry.serialize();
        assert_eq!(Geometry::parse(&bytes).unwrap(), geometry);
    }

    #[test]
    fn default_matches_spec_defaults() {
        let geometry = Geometry::default();
        assert_eq!(geometry.block_size, 4096);
        assert_eq!(geometry.fat_entries, 262_144);
        assert_eq!(geometry.max_files, 65_536);
    }

    #[test]
    fn rejects_zero_block_size() {
        assert!(Geometry::new(0, 16, 16).is_err());
    }

    #[test]
    fn derives_offsets() {
        let geometry = Geometry::new(4096, 16384, 1024).unwrap();
        assert_eq!(geometry.fat_offset(), 16);
        assert_eq!(geometry.directory_offset(), 16 + 16384 * 4);
        assert_eq!(geometry.data_offset(), 16 + 16384 * 4 + 1024 * 32);
    }
}
