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

//! Defines the on-media format of the store.
//!
//! The media is laid out as follows (all integers little-endian):
//!
//! ```text
//! Media := Header EntryTable PageRegion
//! Header :=          // 16 bytes at address 0
//!     format_id:2
//!     padding:2      // written as zero
//!     page_size:4
//!     page_count:1
//!     padding:3      // written as zero
//!     page_begin_address:4
//! EntryTable := Entry*PAGE_COUNT    // entry i at 16 + 4*i, entry 0 reserved
//! Entry :=           // 4 bytes
//!     metadata:1
//!     key_page:1
//!     value_page:1
//!     remains:1
//! PageRegion :=      // page p at page_begin_address + PAGE_SIZE*p, p != 0
//!     Page*
//! Page := next_page:1 payload:(PAGE_SIZE-1)   // multi-page chains
//!       | payload:PAGE_SIZE                   // single-page chains
//! ```
//!
//! Metadata bits, LSB first: ACTIVE, OPEN, KEY_MULTIPAGE, VALUE_MULTIPAGE, then 2 bits of key
//! format (only the string format is defined) and 2 reserved bits.

use crate::{usize_to_nat, Nat};
use byteorder::{ByteOrder, LittleEndian};

/// Identifies the media format.
///
/// A header whose format id differs is reformatted from scratch.
pub const FORMAT_ID: u16 = 0x4b56;

/// The size of a page in bytes.
///
/// Must be a multiple of the word size and at most 256.
pub const PAGE_SIZE: usize = 12;

/// The number of pages (and entry table slots).
///
/// At most 255 since page numbers are single bytes. Page 0 is reserved as the invalid page.
pub const PAGE_COUNT: usize = 128;

/// Expected maximum length of a string key (baseline, not enforced).
///
/// Lookup fetches keys through a stack buffer of this size; longer keys spill to a transient
/// heap allocation.
pub const STRING_KEY_STDLEN: usize = 16;

/// The size of the header in bytes.
pub const HEADER_SIZE: usize = 16;

/// The size of an entry record in bytes.
pub const ENTRY_SIZE: usize = 4;

/// The address of the entry table.
pub const TABLE_ADDRESS: usize = HEADER_SIZE;

/// The minimal storage size in bytes for the compiled geometry.
pub const MEDIA_SIZE: usize = HEADER_SIZE + ENTRY_SIZE * PAGE_COUNT + PAGE_SIZE * PAGE_COUNT;

const _: () = assert!(PAGE_SIZE % 4 == 0 && PAGE_SIZE <= 256);
const _: () = assert!(PAGE_COUNT <= 255);

/// Identifies a page in the page region.
///
/// Page numbers are stored in single bytes on media. Page 0 is the invalid page and doubles as
/// the chain terminator.
pub type PageNumber = u8;

// Metadata bits.
const ACTIVE: u8 = 0x01;
const OPEN: u8 = 0x02;
const KEY_MULTIPAGE: u8 = 0x04;
const VALUE_MULTIPAGE: u8 = 0x08;
const KEY_FORMAT: u8 = 0x30;
const KEY_FORMAT_STRING: u8 = 0x00;

/// The in-RAM copy of the media header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Magic/version marker.
    pub format_id: u16,

    /// Authoritative page size after format.
    pub page_size: Nat,

    /// Authoritative page count after format.
    pub page_count: u8,

    /// Absolute address of page 0.
    pub page_begin_address: Nat,
}

impl Header {
    /// Returns the header the compiled geometry would format.
    pub fn new() -> Header {
        Header {
            format_id: FORMAT_ID,
            page_size: usize_to_nat(PAGE_SIZE),
            page_count: PAGE_COUNT as u8,
            page_begin_address: natural_page0_address(),
        }
    }

    /// Decodes a header from its media representation.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Header {
        Header {
            format_id: LittleEndian::read_u16(&bytes[0..2]),
            page_size: LittleEndian::read_u32(&bytes[4..8]),
            page_count: bytes[8],
            page_begin_address: LittleEndian::read_u32(&bytes[12..16]),
        }
    }

    /// Encodes a header to its media representation.
    ///
    /// Padding bytes are written as zero.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];
        LittleEndian::write_u16(&mut bytes[0..2], self.format_id);
        LittleEndian::write_u32(&mut bytes[4..8], self.page_size);
        bytes[8] = self.page_count;
        LittleEndian::write_u32(&mut bytes[12..16], self.page_begin_address);
        bytes
    }

    /// Returns whether the header matches the compiled geometry.
    ///
    /// The page size and count are probed together with the format id: the engine's scratch
    /// buffers are sized for the compiled geometry only.
    pub fn matches_format(&self) -> bool {
        *self == Header::new()
    }
}

/// A 4-byte entry record binding a key chain to a value chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    metadata: u8,

    /// First page of the key chain.
    pub key_page: PageNumber,

    /// First page of the value chain.
    pub value_page: PageNumber,

    /// Unused padding bytes in the last value page.
    pub remains: u8,
}

impl Entry {
    /// Decodes an entry from its media representation.
    pub fn decode(bytes: &[u8; ENTRY_SIZE]) -> Entry {
        Entry {
            metadata: bytes[0],
            key_page: bytes[1],
            value_page: bytes[2],
            remains: bytes[3],
        }
    }

    /// Encodes an entry to its media representation.
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        [self.metadata, self.key_page, self.value_page, self.remains]
    }

    /// Whether the entry points to valid chains.
    pub fn is_active(&self) -> bool {
        self.metadata & ACTIVE != 0
    }

    /// Whether the entry is mid-write.
    pub fn is_open(&self) -> bool {
        self.metadata & OPEN != 0
    }

    /// Whether the slot may hold a new entry.
    pub fn is_free(&self) -> bool {
        self.metadata & (ACTIVE | OPEN) == 0
    }

    /// Whether the key chain spans multiple pages.
    pub fn key_multipage(&self) -> bool {
        self.metadata & KEY_MULTIPAGE != 0
    }

    /// Whether the value chain spans multiple pages.
    pub fn value_multipage(&self) -> bool {
        self.metadata & VALUE_MULTIPAGE != 0
    }

    /// Marks the entry as mid-write, preserving the rest of the metadata.
    pub fn set_open(&mut self) {
        self.metadata |= OPEN;
    }

    /// Records the key chain form.
    pub fn set_key_multipage(&mut self, multi: bool) {
        if multi {
            self.metadata |= KEY_MULTIPAGE;
        } else {
            self.metadata &= !KEY_MULTIPAGE;
        }
    }

    /// Composes the final metadata of a successful save.
    ///
    /// Only the key chain form survives from the previous metadata. The entry becomes active,
    /// not open, with the string key format.
    pub fn commit(&mut self, value_multi: bool) {
        let mut metadata = self.metadata & KEY_MULTIPAGE;
        metadata |= ACTIVE | (KEY_FORMAT_STRING & KEY_FORMAT);
        if value_multi {
            metadata |= VALUE_MULTIPAGE;
        }
        self.metadata = metadata;
    }

    /// Resets the metadata to the default (free) value.
    ///
    /// The chain pointers are left in place, matching the single-field update of a delete.
    pub fn clear_metadata(&mut self) {
        self.metadata = 0;
    }
}

/// Returns the address of an entry slot.
pub fn entry_address(index: usize) -> Nat {
    usize_to_nat(TABLE_ADDRESS + ENTRY_SIZE * index)
}

/// Returns the address of a page.
///
/// The invalid page 0 has no address.
pub fn page_address(page_begin_address: Nat, page: PageNumber) -> Nat {
    debug_assert!(page != 0);
    page_begin_address + usize_to_nat(PAGE_SIZE) * page as Nat
}

/// Returns the address page 0 would have for the compiled geometry.
///
/// Only meaningful while formatting. Once formatted, the authoritative address is read from
/// the header.
pub fn natural_page0_address() -> Nat {
    usize_to_nat(TABLE_ADDRESS + ENTRY_SIZE * PAGE_COUNT)
}
