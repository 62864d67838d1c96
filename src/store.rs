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

//! The store implementation.
//!
//! # Entry lifecycle
//!
//! A table slot is FREE (metadata zero), OPEN (an edit is in progress), or ACTIVE. A save
//! opens the slot first, writes the chains, then commits the final metadata; each step is a
//! single device program. If power is lost between the open and the commit, the slot stays
//! OPEN on media: initialization treats only ACTIVE entries as live, so the partial chains are
//! reclaimed implicitly and the slot reads as occupied table space until deleted.
//!
//! # Failure semantics
//!
//! Device program faults are not retried. A fault during the final entry commit of a save, or
//! a double failure while renaming, leaves the entry in a degraded state: the store
//! deinitializes itself and every following call fails with
//! [`InvalidAccess`](StoreError::InvalidAccess). Chain writes that fail mid-way return the
//! pages they allocated and keep the truncated reuse chain well-formed, but the data of reused
//! pages may already be overwritten.

use crate::bitmap::PageBitmap;
use crate::format::{
    entry_address, page_address, Entry, Header, PageNumber, ENTRY_SIZE, HEADER_SIZE, MEDIA_SIZE,
    PAGE_COUNT, PAGE_SIZE, STRING_KEY_STDLEN,
};
use crate::storage::{Storage, StorageError, WORD_SIZE};
use crate::{usize_to_nat, Nat};
use alloc::borrow::Cow;
use alloc::string::String;
use alloc::vec::Vec;
use arrayref::array_ref;

/// Represents a possible store error.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    /// Preconditions are violated.
    ///
    /// The store is not initialized, the storage is too small, or the operation is not valid
    /// in the current state.
    InvalidAccess,

    /// No entry matches the key.
    NotFound,

    /// Not enough space in storage.
    ///
    /// The entry table or the page allocator is exhausted, or the value would need more pages
    /// than exist.
    InsufficientSpace,

    /// The underlying device failed to initialize or program.
    StorageFault,

    /// A dynamic allocation failed.
    ///
    /// Kept for API fidelity; the global allocator aborts instead of failing, so this error is
    /// never produced.
    HeapError,

    /// An entry table read or write faulted.
    TableError,

    /// A chain read could not be satisfied.
    FetchFault,

    /// The occupancy bitmap could not be built or maintained.
    RecordFault,

    /// A fatal mid-operation failure left an entry in a degraded state.
    ///
    /// The store deinitializes itself.
    Unknown,

    /// The rename target key already names a live entry.
    KeyDuplicate,
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StorageError> for StoreError {
    fn from(_: StorageError) -> StoreError {
        StoreError::StorageFault
    }
}

/// First position for [`Store::search`].
pub const SEARCH_START: Nat = 1;

/// The result of writing a chain.
#[derive(Debug)]
struct ChainWrite {
    /// First page of the chain.
    start: PageNumber,

    /// Whether the chain spans multiple pages.
    multi: bool,

    /// Unused padding bytes in the last page.
    remains: u8,
}

/// Implements a key-value store on top of any word-aligned storage.
///
/// The store owns the in-RAM header copy and the page occupancy bitmap. It runs every
/// operation to completion before returning and must not be shared between contexts.
#[derive(Debug)]
pub struct Store<S: Storage> {
    storage: S,
    header: Header,
    bitmap: PageBitmap,
    ready: bool,
}

impl<S: Storage> Store<S> {
    /// Initializes a store, formatting the storage if needed.
    ///
    /// The storage is formatted when the header does not match the compiled geometry (first
    /// boot, or a format id bump). The occupancy bitmap is rebuilt from scratch by walking the
    /// chains of every active entry.
    ///
    /// # Errors
    ///
    /// - [`InvalidAccess`](StoreError::InvalidAccess) if the storage is smaller than the
    ///   compiled geometry needs.
    /// - [`StorageFault`](StoreError::StorageFault) if the device fails the header probe.
    /// - [`TableError`](StoreError::TableError) or [`StorageFault`](StoreError::StorageFault)
    ///   if formatting faults.
    /// - [`RecordFault`](StoreError::RecordFault) if the bitmap cannot be built.
    pub fn new(storage: S) -> StoreResult<Store<S>> {
        if storage.len() < MEDIA_SIZE {
            return Err(StoreError::InvalidAccess);
        }
        let mut store = Store {
            storage,
            header: Header::new(),
            bitmap: PageBitmap::new(),
            ready: false,
        };
        store.header = store.read_header()?;
        if !store.header.matches_format() {
            store.format_storage()?;
        }
        store.build_bitmap()?;
        store.ready = true;
        Ok(store)
    }

    /// Saves a value under a key, overwriting a previous value.
    ///
    /// On overwrite, the pages of the previous value chain are reused first to minimize churn;
    /// a surplus tail is freed, missing pages are allocated.
    ///
    /// # Errors
    ///
    /// - [`InsufficientSpace`](StoreError::InsufficientSpace) if the table or the page
    ///   allocator is exhausted, or a chain could not be written.
    /// - [`TableError`](StoreError::TableError) if an entry transfer faults. When the final
    ///   entry commit faults the store deinitializes, since the entry stays open on media.
    pub fn save(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        if !self.ready {
            return Err(StoreError::InvalidAccess);
        }
        let (index, overwrite) = match self.lookup(key.as_bytes(), false, 1)? {
            Some(index) => (index, true),
            None => (self.find_free_slot()?, false),
        };

        let mut entry = if overwrite {
            self.read_entry(index)?
        } else {
            Entry::default()
        };

        // Commit "an edit is in progress" to media before touching any chain.
        entry.set_open();
        self.write_entry(index, &entry)?;

        if !overwrite {
            // A chain write cleans up after itself on failure, whatever the cause.
            let key_chain = match self.write_chain(&string_record(key), None) {
                Ok(chain) => chain,
                Err(_) => return Err(StoreError::InsufficientSpace),
            };
            entry.key_page = key_chain.start;
            entry.set_key_multipage(key_chain.multi);
        }

        let reuse = if overwrite {
            Some((entry.value_page, entry.value_multipage()))
        } else {
            None
        };
        let value_chain = match self.write_chain(value, reuse) {
            Ok(chain) => chain,
            Err(_) => {
                if !overwrite {
                    // The slot was never committed, so the fresh key chain would leak.
                    let _ = self.mark_chain(entry.key_page, false, entry.key_multipage());
                }
                return Err(StoreError::InsufficientSpace);
            }
        };
        entry.value_page = value_chain.start;
        entry.remains = value_chain.remains;
        entry.commit(value_chain.multi);

        if self.write_entry(index, &entry).is_err() {
            // The entry is open on media and cannot be closed: unsafe to continue.
            self.deinit();
            return Err(StoreError::TableError);
        }
        Ok(())
    }

    /// Saves a string under a key, with its trailing NUL.
    pub fn save_string(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.save(key, &string_record(value))
    }

    /// Retrieves the value saved under a key into a new allocation.
    pub fn retrieve(&self, key: &str) -> StoreResult<Vec<u8>> {
        if !self.ready {
            return Err(StoreError::InvalidAccess);
        }
        let index = self
            .lookup(key.as_bytes(), false, 1)?
            .ok_or(StoreError::NotFound)?;
        let entry = self.read_entry(index)?;
        let (mut value, max_size) =
            self.fetch_chain_alloc(entry.value_page, entry.value_multipage())?;
        value.truncate((max_size - entry.remains as Nat) as usize);
        Ok(value)
    }

    /// Retrieves the value saved under a key into a caller buffer.
    ///
    /// A value longer than the buffer is silently truncated. The returned length is always the
    /// full value length, so truncation is detected by comparing it with the buffer length.
    pub fn retrieve_into(&self, key: &str, buf: &mut [u8]) -> StoreResult<usize> {
        if !self.ready {
            return Err(StoreError::InvalidAccess);
        }
        let index = self
            .lookup(key.as_bytes(), false, 1)?
            .ok_or(StoreError::NotFound)?;
        let entry = self.read_entry(index)?;
        let (_, max_size) =
            self.fetch_chain(entry.value_page, entry.value_multipage(), buf, true)?;
        Ok((max_size - entry.remains as Nat) as usize)
    }

    /// Retrieves the string saved under a key.
    ///
    /// The trailing NUL stored by [`save_string`](Store::save_string) is stripped.
    pub fn retrieve_string(&self, key: &str) -> StoreResult<String> {
        let mut value = self.retrieve(key)?;
        let length = value.iter().position(|&x| x == 0).unwrap_or(value.len());
        value.truncate(length);
        String::from_utf8(value).map_err(|_| StoreError::FetchFault)
    }

    /// Retrieves the string saved under a key into a caller buffer.
    ///
    /// The stored trailing NUL is copied along when the buffer is large enough, for consumers
    /// reading the buffer as a terminated string. The returned length counts the NUL.
    pub fn retrieve_string_into(&self, key: &str, buf: &mut [u8]) -> StoreResult<usize> {
        self.retrieve_into(key, buf)
    }

    /// Changes the key that labels a value.
    ///
    /// The new key is written in place of the old one, reusing the pages of the existing key
    /// chain. If the new key does not fit, the old key is restored and the binding is kept.
    ///
    /// # Errors
    ///
    /// - [`KeyDuplicate`](StoreError::KeyDuplicate) if the new key already names a different
    ///   live entry. Renaming a key to itself is a no-op.
    /// - [`InsufficientSpace`](StoreError::InsufficientSpace) if the new key did not fit and
    ///   the old key was restored.
    /// - [`Unknown`](StoreError::Unknown) if the restore failed too: the binding is lost and
    ///   the store deinitializes.
    pub fn rename(&mut self, old_key: &str, new_key: &str) -> StoreResult<()> {
        if !self.ready {
            return Err(StoreError::InvalidAccess);
        }
        let index = self
            .lookup(old_key.as_bytes(), false, 1)?
            .ok_or(StoreError::NotFound)?;
        if let Some(existing) = self.lookup(new_key.as_bytes(), false, 1)? {
            if existing != index {
                return Err(StoreError::KeyDuplicate);
            }
        }
        let mut entry = self.read_entry(index)?;
        let reuse = (entry.key_page, entry.key_multipage());

        match self.write_chain(&string_record(new_key), Some(reuse)) {
            Ok(chain) => {
                if chain.multi != entry.key_multipage() {
                    entry.key_page = chain.start;
                    entry.set_key_multipage(chain.multi);
                    self.write_entry(index, &entry)?;
                }
                Ok(())
            }
            Err(_) => {
                // Put the old key back into its (possibly truncated) chain. The failed write
                // returned every page it allocated, so the restore cannot run out of space.
                match self.write_chain(&string_record(old_key), Some(reuse)) {
                    Ok(_) => Err(StoreError::InsufficientSpace),
                    Err(_) => {
                        // The old key chain is gone: lose the binding rather than leave a
                        // half-written key reachable.
                        entry.clear_metadata();
                        let _ = self.write_entry(index, &entry);
                        self.deinit();
                        Err(StoreError::Unknown)
                    }
                }
            }
        }
    }

    /// Deletes the value saved under a key.
    ///
    /// # Errors
    ///
    /// - [`NotFound`](StoreError::NotFound) if no entry matches the key.
    /// - [`TableError`](StoreError::TableError) if an entry transfer or a chain walk faults.
    pub fn delete(&mut self, key: &str) -> StoreResult<()> {
        if !self.ready {
            return Err(StoreError::InvalidAccess);
        }
        let index = self
            .lookup(key.as_bytes(), false, 1)?
            .ok_or(StoreError::NotFound)?;
        let mut entry = self.read_entry(index)?;
        self.mark_chain(entry.key_page, false, entry.key_multipage())
            .map_err(|_| StoreError::TableError)?;
        self.mark_chain(entry.value_page, false, entry.value_multipage())
            .map_err(|_| StoreError::TableError)?;
        entry.clear_metadata();
        self.write_entry(index, &entry)
    }

    /// Returns the next key matching a prefix, resuming from `position`.
    ///
    /// Pass [`SEARCH_START`] on the first call. On a hit the key is fetched into `key_buf`
    /// (truncating if needed), `position` is advanced past the hit, and the full key length is
    /// returned. [`NotFound`](StoreError::NotFound) terminates the iteration.
    pub fn search(&self, prefix: &str, position: &mut Nat, key_buf: &mut [u8]) -> StoreResult<usize> {
        if !self.ready {
            return Err(StoreError::InvalidAccess);
        }
        let start = core::cmp::max(*position, SEARCH_START) as usize;
        let index = self
            .lookup(prefix.as_bytes(), true, start)?
            .ok_or(StoreError::NotFound)?;
        let entry = self.read_entry(index)?;
        let (fetched, _) = self.fetch_chain(entry.key_page, entry.key_multipage(), key_buf, true)?;
        let length = fetched.iter().position(|&x| x == 0).unwrap_or(fetched.len());
        *position = usize_to_nat(index) + 1;
        Ok(length)
    }

    /// Returns an iterator over the keys matching a prefix.
    pub fn matches<'a>(&'a self, prefix: &'a str) -> Matches<'a, S> {
        Matches {
            store: self,
            prefix,
            position: SEARCH_START,
        }
    }

    /// Returns the number of free pages.
    pub fn capacity(&self) -> usize {
        self.bitmap.free_count()
    }

    /// Returns whether the store accepts operations.
    ///
    /// A fatal mid-operation failure deinitializes the store; all subsequent operations fail
    /// with [`InvalidAccess`](StoreError::InvalidAccess).
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Provides read-only access to the storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Extracts the storage, consuming the store.
    pub fn extract_storage(self) -> S {
        self.storage
    }

    /// Marks the store as uninitialized after an unrecoverable error.
    fn deinit(&mut self) {
        self.ready = false;
    }

    /// Reads the header from media.
    fn read_header(&self) -> StoreResult<Header> {
        let bytes = self
            .storage
            .read_slice(0, usize_to_nat(HEADER_SIZE))
            .map_err(|_| StoreError::StorageFault)?;
        Ok(Header::decode(array_ref![bytes.as_ref(), 0, HEADER_SIZE]))
    }

    /// Formats the storage for the compiled geometry.
    ///
    /// All entries are programmed as free first; the header goes last, so the format id only
    /// lands once the table is valid.
    fn format_storage(&mut self) -> StoreResult<()> {
        if self.ready {
            return Err(StoreError::InvalidAccess);
        }
        let empty = Entry::default().encode();
        for index in 0..PAGE_COUNT {
            self.storage
                .program_slice(entry_address(index), &empty)
                .map_err(|_| StoreError::TableError)?;
        }
        self.header = Header::new();
        self.storage.program_slice(0, &self.header.encode())?;
        Ok(())
    }

    /// Rebuilds the occupancy bitmap by walking the chains of every active entry.
    fn build_bitmap(&mut self) -> StoreResult<()> {
        self.bitmap = PageBitmap::new();
        for index in 1..PAGE_COUNT {
            let entry = self
                .read_entry(index)
                .map_err(|_| StoreError::RecordFault)?;
            if entry.is_active() {
                self.mark_chain(entry.key_page, true, entry.key_multipage())?;
                self.mark_chain(entry.value_page, true, entry.value_multipage())?;
            }
        }
        Ok(())
    }

    /// Reads an entry record from its table slot.
    ///
    /// Entries are never cached: readers always hit the device so that post-crash state is
    /// observable.
    fn read_entry(&self, index: usize) -> StoreResult<Entry> {
        let bytes = self
            .storage
            .read_slice(entry_address(index), usize_to_nat(ENTRY_SIZE))
            .map_err(|_| StoreError::TableError)?;
        Ok(Entry::decode(array_ref![bytes.as_ref(), 0, ENTRY_SIZE]))
    }

    /// Programs an entry record at its table slot.
    fn write_entry(&mut self, index: usize, entry: &Entry) -> StoreResult<()> {
        self.storage
            .program_slice(entry_address(index), &entry.encode())
            .map_err(|_| StoreError::TableError)
    }

    /// Reads a full page from media.
    fn read_page(&self, page: PageNumber) -> StoreResult<[u8; PAGE_SIZE]> {
        let address = page_address(self.header.page_begin_address, page);
        let bytes = self
            .storage
            .read_slice(address, usize_to_nat(PAGE_SIZE))
            .map_err(|_| StoreError::FetchFault)?;
        Ok(*array_ref![bytes.as_ref(), 0, PAGE_SIZE])
    }

    /// Programs a full page to media.
    fn program_page(&mut self, page: PageNumber, data: &[u8; PAGE_SIZE]) -> StoreResult<()> {
        let address = page_address(self.header.page_begin_address, page);
        self.storage
            .program_slice(address, data)
            .map_err(|_| StoreError::StorageFault)
    }

    /// Reads the next-page byte of a page.
    ///
    /// Only meaningful for multi-page chains; pages carry no metadata to validate on their
    /// own.
    fn next_page_number(&self, page: PageNumber) -> StoreResult<PageNumber> {
        let address = page_address(self.header.page_begin_address, page);
        let bytes = self
            .storage
            .read_slice(address, WORD_SIZE)
            .map_err(|_| StoreError::FetchFault)?;
        Ok(bytes[0])
    }

    /// Walks a chain on media and flips the status of every page it encounters.
    ///
    /// The walk is bounded by the page count in case a corrupted next pointer forms a cycle.
    fn mark_chain(&mut self, start: PageNumber, used: bool, multi: bool) -> StoreResult<()> {
        let mut page = start;
        let mut walked = 0;
        while page != 0 && walked < PAGE_COUNT {
            self.bitmap.mark(page, used);
            page = if multi {
                self.next_page_number(page)
                    .map_err(|_| StoreError::RecordFault)?
            } else {
                0
            };
            walked += 1;
        }
        Ok(())
    }

    /// Reads an entire chain into `buf`, allocating when it does not fit.
    ///
    /// With `force`, a record longer than `buf` is truncated into it instead. Returns the
    /// fetched bytes and the maximum record size (the effective length is the maximum size
    /// minus the entry's remains). The destination gets a trailing NUL for string consumers
    /// whenever it holds the full record.
    fn fetch_chain<'a>(
        &self,
        start: PageNumber,
        multi: bool,
        buf: &'a mut [u8],
        force: bool,
    ) -> StoreResult<(Cow<'a, [u8]>, Nat)> {
        if start == 0 {
            return Err(StoreError::FetchFault);
        }

        // Count the pages of the chain, bounded in case of a corrupted cycle.
        let mut page_count = 1;
        if multi {
            let mut page = start;
            while page_count < PAGE_COUNT {
                page = self.next_page_number(page)?;
                if page == 0 {
                    break;
                }
                page_count += 1;
            }
        }

        let next_size = multi as usize;
        let page_data_size = PAGE_SIZE - next_size;
        // One extra byte for the safety NUL.
        let record_size = page_data_size * page_count + 1;

        let use_buf = buf.len() >= record_size || force;
        let dest_len = if use_buf {
            core::cmp::min(buf.len(), record_size)
        } else {
            record_size
        };
        let mut record = if use_buf {
            Vec::new()
        } else {
            vec![0; record_size]
        };
        {
            let dest: &mut [u8] = if use_buf {
                &mut buf[..dest_len]
            } else {
                &mut record
            };
            let mut page = start;
            let mut offset = 0;
            for _ in 0..page_count {
                let data = self.read_page(page)?;
                let payload = &data[next_size..];
                let n = core::cmp::min(payload.len(), dest.len() - offset);
                dest[offset..offset + n].copy_from_slice(&payload[..n]);
                offset += n;
                if offset == dest.len() {
                    // Truncated copy: the last page was copied partially.
                    break;
                }
                page = data[0];
            }
            if dest.len() == record_size {
                dest[record_size - 1] = 0;
            }
        }

        let max_size = usize_to_nat(page_data_size * page_count);
        let data = if use_buf {
            Cow::Borrowed(&buf[..dest_len])
        } else {
            Cow::Owned(record)
        };
        Ok((data, max_size))
    }

    /// Reads an entire chain into a new allocation.
    fn fetch_chain_alloc(&self, start: PageNumber, multi: bool) -> StoreResult<(Vec<u8>, Nat)> {
        let mut empty: [u8; 0] = [];
        let (data, max_size) = self.fetch_chain(start, multi, &mut empty, false)?;
        Ok((data.into_owned(), max_size))
    }

    /// Programs a buffer as a page chain, reusing an existing chain when given.
    ///
    /// Pages of the reuse chain are consumed before the allocator is asked; a surplus tail is
    /// freed afterwards. On failure every freshly allocated page is returned to the allocator
    /// and, for a multi-page reuse chain, the last reused page is re-terminated so the
    /// truncated old chain stays well-formed. The data of reused pages is overwritten either
    /// way.
    fn write_chain(
        &mut self,
        data: &[u8],
        reuse: Option<(PageNumber, bool)>,
    ) -> StoreResult<ChainWrite> {
        let size = data.len();
        if size == 0 {
            return Err(StoreError::InsufficientSpace);
        }
        let multi = size > PAGE_SIZE;
        let next_size = multi as usize;
        let page_data_size = PAGE_SIZE - next_size;
        let pages_needed = if multi {
            (size + page_data_size - 1) / page_data_size
        } else {
            1
        };
        if pages_needed > PAGE_COUNT {
            return Err(StoreError::InsufficientSpace);
        }

        let (reuse_start, reuse_multi) = reuse.unwrap_or((0, false));
        // Page the reuse chain will hand out next (0 once dry).
        let mut reuse_cursor = reuse_start;
        let mut next_page = reuse_start;
        let mut next_from_reuse = reuse_start != 0;
        if reuse_start == 0 {
            next_page = self.bitmap.allocate().unwrap_or(0);
        }

        let mut start = 0;
        let mut last_reused = 0;
        let mut fresh: Vec<PageNumber> = Vec::new();
        let mut written = 0;
        let mut fault = None;

        for index in 0..pages_needed {
            // Peek the next reuse page before the current one is overwritten.
            if reuse_cursor != 0 {
                reuse_cursor = if reuse_multi {
                    match self.next_page_number(reuse_cursor) {
                        Ok(page) => page,
                        Err(error) => {
                            fault = Some(error);
                            break;
                        }
                    }
                } else {
                    0
                };
            }

            let this_page = next_page;
            if this_page == 0 {
                // No more pages were available.
                break;
            }
            if next_from_reuse {
                last_reused = this_page;
            } else {
                fresh.push(this_page);
            }
            if index == 0 {
                start = this_page;
            }

            // Line up the page for the next iteration; its number is part of this page.
            if index + 1 < pages_needed {
                if reuse_cursor != 0 {
                    next_page = reuse_cursor;
                    next_from_reuse = true;
                } else {
                    next_page = self.bitmap.allocate().unwrap_or(0);
                    next_from_reuse = false;
                }
            } else {
                next_page = 0;
                next_from_reuse = false;
            }

            let mut page = [0; PAGE_SIZE];
            if multi {
                page[0] = next_page;
            }
            let payload_start = page_data_size * index;
            let n = core::cmp::min(page_data_size, size - payload_start);
            page[next_size..next_size + n].copy_from_slice(&data[payload_start..payload_start + n]);

            if self.program_page(this_page, &page).is_err() {
                fault = Some(StoreError::StorageFault);
                break;
            }
            written += 1;
        }

        if written < pages_needed {
            // Return every page allocated during this call, including one lined up but never
            // written.
            if next_page != 0 && !next_from_reuse {
                self.bitmap.mark(next_page, false);
            }
            for &page in &fresh {
                self.bitmap.mark(page, false);
            }
            if reuse_multi && last_reused != 0 {
                // The last reused page may point into the pages just returned: re-terminate
                // the truncated old chain.
                if let Ok(mut page) = self.read_page(last_reused) {
                    page[0] = 0;
                    let _ = self.program_page(last_reused, &page);
                }
            }
            return Err(fault.unwrap_or(StoreError::InsufficientSpace));
        }

        // Free what is left of the reuse chain.
        if reuse_cursor != 0 {
            self.mark_chain(reuse_cursor, false, reuse_multi)?;
        }

        let overflow = size % page_data_size;
        let remains = if overflow == 0 {
            0
        } else {
            (page_data_size - overflow) as u8
        };
        Ok(ChainWrite {
            start,
            multi,
            remains,
        })
    }

    /// Returns the first table slot matching a key, scanning from `start`.
    ///
    /// With `prefix`, the key only needs to be a prefix of the entry key. Keys are fetched
    /// through a small stack buffer; longer keys spill to a transient allocation.
    fn lookup(&self, key: &[u8], prefix: bool, start: usize) -> StoreResult<Option<usize>> {
        let start = core::cmp::max(start, 1);
        for index in start..PAGE_COUNT {
            let entry = self.read_entry(index)?;
            if !entry.is_active() {
                continue;
            }
            let mut key_buf = [0; STRING_KEY_STDLEN];
            let (fetched, _) =
                self.fetch_chain(entry.key_page, entry.key_multipage(), &mut key_buf, false)?;
            let fetched_len = fetched.iter().position(|&x| x == 0).unwrap_or(fetched.len());
            let matched = if prefix {
                key.len() <= fetched_len && fetched[..key.len()] == *key
            } else {
                key.len() == fetched_len && fetched[..key.len()] == *key
            };
            if matched {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Returns the first table slot that may hold a new entry.
    fn find_free_slot(&self) -> StoreResult<usize> {
        for index in 1..PAGE_COUNT {
            if self.read_entry(index)?.is_free() {
                return Ok(index);
            }
        }
        Err(StoreError::InsufficientSpace)
    }

    /// Fetches the key of an entry into a new allocation.
    fn entry_key(&self, index: usize) -> StoreResult<String> {
        let entry = self.read_entry(index)?;
        let (mut key, _) = self.fetch_chain_alloc(entry.key_page, entry.key_multipage())?;
        let length = key.iter().position(|&x| x == 0).unwrap_or(key.len());
        key.truncate(length);
        String::from_utf8(key).map_err(|_| StoreError::FetchFault)
    }
}

/// Iterates over the keys matching a prefix.
///
/// Yields each matching key exactly once, in table order. A scan error ends the iteration
/// after being yielded.
pub struct Matches<'a, S: Storage> {
    store: &'a Store<S>,
    prefix: &'a str,
    position: Nat,
}

impl<'a, S: Storage> Iterator for Matches<'a, S> {
    type Item = StoreResult<String>;

    fn next(&mut self) -> Option<StoreResult<String>> {
        if !self.store.ready {
            return None;
        }
        match self
            .store
            .lookup(self.prefix.as_bytes(), true, self.position as usize)
        {
            Ok(Some(index)) => {
                self.position = usize_to_nat(index) + 1;
                Some(self.store.entry_key(index))
            }
            Ok(None) => None,
            Err(error) => {
                self.position = usize_to_nat(PAGE_COUNT);
                Some(Err(error))
            }
        }
    }
}

/// Returns the media record of a string: its bytes plus the trailing NUL.
fn string_record(value: &str) -> Vec<u8> {
    let mut record = Vec::with_capacity(value.len() + 1);
    record.extend_from_slice(value.as_bytes());
    record.push(0);
    record
}
