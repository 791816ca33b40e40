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

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("File not found: {0:?}")]
    FileNotFound(String),
    #[error("Directory full")]
    DirectoryFull,
    #[error("Insufficient space: need {needed} blocks, {available} free")]
    InsufficientSpace { needed: usize, available: usize },
    #[error("Invalid block operation: offset {offset} out of range for block size {block_size}")]
    InvalidBlockOperation { offset: i64, block_size: i64 },
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(&'static str),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
