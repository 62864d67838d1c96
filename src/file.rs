// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File-backed storage.
//!
//! [`FileStorage`] implements the [`Storage`] interface but doesn't interface with an actual
//! non-volatile device. Instead it uses a host-based file to persist the storage state.

use crate::format::MEDIA_SIZE;
use crate::{BufferOptions, BufferStorage, Nat, Storage, StorageResult};
use alloc::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Simulates a word-aligned storage using a host-based file.
///
/// It provides the same functions as [`BufferStorage`], but also saves stored data between
/// application restarts. Fault-arming state is not saved between restarts.
pub struct FileStorage {
    /// Content of the storage.
    storage: BufferStorage,

    /// File to persist contents of the storage.
    backing_file: File,
}

impl FileStorage {
    /// Opens or creates a file-backed storage of the compiled geometry.
    ///
    /// A fresh file is zero-filled, which the store reads as an unformatted media.
    ///
    /// # Panics
    ///
    /// Panics if the file exists with a different size: opening a previously saved file from a
    /// storage of a different geometry is not supported.
    pub fn new(path: &Path) -> StorageResult<FileStorage> {
        let contents = vec![0; MEDIA_SIZE].into_boxed_slice();
        let mut storage = BufferStorage::new(contents, BufferOptions::default());

        let mut backing_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_len = backing_file.metadata()?.len();

        if file_len == 0 {
            backing_file.set_len(MEDIA_SIZE as u64)?;
            backing_file.seek(SeekFrom::Start(0))?;
            backing_file.write_all(&vec![0; MEDIA_SIZE])?;
        } else if file_len == MEDIA_SIZE as u64 {
            let mut contents = vec![0; MEDIA_SIZE];
            backing_file.seek(SeekFrom::Start(0))?;
            backing_file.read_exact(&mut contents)?;
            storage.program_slice(0, &contents)?;
        } else {
            panic!("Invalid file size {}, should be {}", file_len, MEDIA_SIZE);
        }
        Ok(FileStorage {
            storage,
            backing_file,
        })
    }
}

impl Storage for FileStorage {
    fn len(&self) -> usize {
        self.storage.len()
    }

    fn read_slice(&self, address: Nat, length: Nat) -> StorageResult<Cow<[u8]>> {
        self.storage.read_slice(address, length)
    }

    fn program_slice(&mut self, address: Nat, value: &[u8]) -> StorageResult<()> {
        self.backing_file.seek(SeekFrom::Start(address as u64))?;
        self.backing_file.write_all(value)?;
        self.storage.program_slice(address, value)
    }
}
