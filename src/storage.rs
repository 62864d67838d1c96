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

use crate::Nat;
use alloc::borrow::Cow;

/// The smallest programmable unit of the storage, in bytes.
///
/// Addresses and lengths of all storage transfers must be multiples of this value.
pub const WORD_SIZE: Nat = 4;

/// Represents a possible storage error.
#[derive(Debug, PartialEq, Eq)]
pub enum StorageError {
    /// Arguments are not word-aligned.
    NotAligned,

    /// Arguments are out of bounds.
    OutOfBounds,

    /// Implementation-specific error.
    ///
    /// For programs this covers device-level failures like a busy peripheral, write protection,
    /// or a verify mismatch.
    CustomError,
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(feature = "std")]
impl From<std::io::Error> for StorageError {
    fn from(_: std::io::Error) -> StorageError {
        StorageError::CustomError
    }
}

/// Abstracts a word-aligned non-volatile storage.
///
/// The storage is a flat byte array. In contrast to flash, words may be reprogrammed to
/// arbitrary values without an erase cycle (EEPROM model).
pub trait Storage {
    /// The total size of the storage in bytes.
    fn len(&self) -> usize;

    /// Reads a byte slice from the storage.
    ///
    /// Both `address` and `length` must be word-aligned and designate a range within the
    /// storage. Reads are assumed to always succeed on a working device.
    fn read_slice(&self, address: Nat, length: Nat) -> StorageResult<Cow<[u8]>>;

    /// Programs a byte slice to the storage.
    ///
    /// Both `address` and `value.len()` must be word-aligned and designate a range within the
    /// storage. The program is synchronous to completion: when this function returns, the
    /// device state reflects the write.
    fn program_slice(&mut self, address: Nat, value: &[u8]) -> StorageResult<()>;
}

/// Returns whether a number is word-aligned.
#[cfg(feature = "std")]
pub(crate) fn is_word_aligned(x: Nat) -> bool {
    x % WORD_SIZE == 0
}
