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

//! Storage for testing.
//!
//! [`BufferStorage`] implements the [`Storage`] interface but doesn't interface with an actual
//! non-volatile device. Instead it uses a buffer in memory to represent the storage state.

use crate::storage::{is_word_aligned, Storage, StorageError, StorageResult};
use crate::{usize_to_nat, Nat};
use alloc::borrow::Cow;
use alloc::boxed::Box;
use core::ops::Range;

/// Simulates a word-aligned storage using a buffer in memory.
///
/// This storage checks the alignment contract and can be armed to fail a program, which
/// permits to drive the store's fault paths in tests.
#[derive(Clone, Debug)]
pub struct BufferStorage {
    /// Content of the storage.
    storage: Box<[u8]>,

    /// Options of the storage.
    options: BufferOptions,

    /// Number of programs issued so far.
    program_count: usize,

    /// Armed fault state.
    fault: Fault,
}

/// Options of a buffer storage.
#[derive(Clone, Debug)]
pub struct BufferOptions {
    /// Size of a word in bytes.
    pub word_size: usize,
}

impl Default for BufferOptions {
    fn default() -> BufferOptions {
        BufferOptions {
            word_size: crate::storage::WORD_SIZE as usize,
        }
    }
}

/// Controls when a program fails.
#[derive(Clone, Debug)]
enum Fault {
    /// Programs have normal behavior.
    Ready,

    /// If the delay is positive, programs decrement it. If the delay is zero, the next
    /// program fails; a transient fault then returns to normal behavior, a persistent one
    /// keeps failing.
    Armed { delay: usize, persistent: bool },

    /// Every program fails.
    Dead,
}

impl BufferStorage {
    /// Creates a buffer storage.
    ///
    /// # Panics
    ///
    /// The following preconditions must hold:
    /// - `options.word_size` must be a power of two.
    /// - `storage.len()` must be word-aligned.
    pub fn new(storage: Box<[u8]>, options: BufferOptions) -> BufferStorage {
        assert!(options.word_size.is_power_of_two());
        assert!(storage.len() % options.word_size == 0);
        BufferStorage {
            storage,
            options,
            program_count: 0,
            fault: Fault::Ready,
        }
    }

    /// Arms a program fault after a given delay.
    ///
    /// The next `delay` programs succeed; the one after fails once with
    /// [`CustomError`](StorageError::CustomError), then programs behave normally again.
    ///
    /// # Panics
    ///
    /// Panics if a fault is already armed.
    pub fn arm_fault(&mut self, delay: usize) {
        match self.fault {
            Fault::Ready => {
                self.fault = Fault::Armed {
                    delay,
                    persistent: false,
                }
            }
            _ => panic!("a fault is already armed"),
        }
    }

    /// Arms a persistent program fault after a given delay.
    ///
    /// The next `delay` programs succeed; every program after that fails, simulating a device
    /// that died (latched write protection, failed peripheral).
    ///
    /// # Panics
    ///
    /// Panics if a fault is already armed.
    pub fn arm_persistent_fault(&mut self, delay: usize) {
        match self.fault {
            Fault::Ready => {
                self.fault = Fault::Armed {
                    delay,
                    persistent: true,
                }
            }
            _ => panic!("a fault is already armed"),
        }
    }

    /// Disarms a fault, returning the remaining delay of one that did not trigger.
    pub fn disarm_fault(&mut self) -> usize {
        match core::mem::replace(&mut self.fault, Fault::Ready) {
            Fault::Armed { delay, .. } => delay,
            Fault::Dead => 0,
            Fault::Ready => panic!("no fault is armed"),
        }
    }

    /// Returns the number of programs issued so far.
    pub fn program_count(&self) -> usize {
        self.program_count
    }

    /// Returns the range of a valid word-aligned slice.
    fn range(&self, address: Nat, length: Nat) -> StorageResult<Range<usize>> {
        if !is_word_aligned(address) || !is_word_aligned(length) {
            return Err(StorageError::NotAligned);
        }
        let start = address as usize;
        let end = start + length as usize;
        if end > self.storage.len() {
            return Err(StorageError::OutOfBounds);
        }
        Ok(start..end)
    }

    /// Fails the program if a fault is armed and its delay expired.
    fn tick(&mut self) -> StorageResult<()> {
        match self.fault {
            Fault::Ready => Ok(()),
            Fault::Armed {
                delay: 0,
                persistent,
            } => {
                self.fault = if persistent {
                    Fault::Dead
                } else {
                    Fault::Ready
                };
                Err(StorageError::CustomError)
            }
            Fault::Armed { ref mut delay, .. } => {
                *delay -= 1;
                Ok(())
            }
            Fault::Dead => Err(StorageError::CustomError),
        }
    }
}

impl Storage for BufferStorage {
    fn len(&self) -> usize {
        self.storage.len()
    }

    fn read_slice(&self, address: Nat, length: Nat) -> StorageResult<Cow<[u8]>> {
        Ok(Cow::Borrowed(&self.storage[self.range(address, length)?]))
    }

    fn program_slice(&mut self, address: Nat, value: &[u8]) -> StorageResult<()> {
        let range = self.range(address, usize_to_nat(value.len()))?;
        self.tick()?;
        self.program_count += 1;
        self.storage[range].copy_from_slice(value);
        Ok(())
    }
}

impl core::fmt::Display for BufferStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        for (i, chunk) in self.storage.chunks(4 * self.options.word_size).enumerate() {
            write!(f, "{:#06x}:", i * 4 * self.options.word_size)?;
            for word in chunk.chunks(self.options.word_size) {
                write!(f, " ")?;
                for byte in word {
                    write!(f, "{:02x}", byte)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
