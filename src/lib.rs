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

//! Key-value store for small word-aligned non-volatile memories
//!
//! # Specification
//!
//! The [store](Store) provides dictionary semantics (save, retrieve, rename, delete, prefix
//! search) for string-keyed byte values on top of a [storage](Storage) interface modeling a
//! block-addressable, word-aligned device of a few tens of KiB, such as an on-chip EEPROM.
//! The device's fixed-granularity programming model is hidden behind a paged, chained
//! representation.
//!
//! ## Definitions
//!
//! A _page_ is a contiguous run of [`PAGE_SIZE`] bytes at a computed address; it is the unit
//! of chain allocation. Page 0 is reserved as the invalid page and doubles as the chain
//! terminator. A _chain_ is one or more pages linked by an intrusive one-byte next pointer at
//! the head of each page; a one-page chain has no next byte and uses the full page as
//! payload. An _entry_ is a 4-byte record in a fixed table binding a key chain to a value
//! chain, plus metadata and a count of the padding bytes in the last value page. Keys are
//! stored with their trailing NUL.
//!
//! The media starts with a 16-byte header (format id and geometry), followed by the entry
//! table of [`PAGE_COUNT`] slots, followed by the page region. The exact encoding is
//! documented in the format module.
//!
//! ## Power loss
//!
//! Every mutable operation commits through single, self-contained device programs, with the
//! entry marked open before its chains are touched and committed active afterwards. When
//! power is lost mid-operation the affected entry is at worst lost, never aliased to another
//! entry's pages: initialization rebuilds the page occupancy bitmap from the chains of active
//! entries only. There is no multi-entry atomicity, no journaling, and no wear leveling.
//!
//! The store runs single-threaded and every call completes synchronously within
//! `O(PAGE_COUNT)` device transactions. Callers must not invoke it from two contexts
//! simultaneously.
//!
//! # Usage
//!
//! ```
//! use kvat::{BufferOptions, BufferStorage, Store, MEDIA_SIZE};
//!
//! let storage = BufferStorage::new(vec![0; MEDIA_SIZE].into_boxed_slice(), BufferOptions::default());
//! let mut store = Store::new(storage).unwrap();
//! store.save_string("greeting", "hello").unwrap();
//! assert_eq!(store.retrieve_string("greeting").unwrap(), "hello");
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
extern crate alloc;

mod bitmap;
#[cfg(feature = "std")]
mod buffer;
#[cfg(feature = "std")]
mod file;
mod format;
mod storage;
mod store;

#[cfg(feature = "std")]
pub use self::buffer::{BufferOptions, BufferStorage};
#[cfg(feature = "std")]
pub use self::file::FileStorage;
pub use self::format::{
    PageNumber, FORMAT_ID, MEDIA_SIZE, PAGE_COUNT, PAGE_SIZE, STRING_KEY_STDLEN,
};
pub use self::storage::{Storage, StorageError, StorageResult, WORD_SIZE};
pub use self::store::{Matches, Store, StoreError, StoreResult, SEARCH_START};

/// Internal representation of natural numbers.
///
/// Sizes and addresses are represented as `u32` to preserve semantics across different
/// targets: tests run with `usize = u64` while the actual target has `usize = u32`.
pub type Nat = u32;

/// Returns the internal representation of a Rust natural number.
///
/// # Panics
///
/// Panics if the conversion overflows.
fn usize_to_nat(x: usize) -> Nat {
    use core::convert::TryFrom;
    Nat::try_from(x).unwrap()
}
