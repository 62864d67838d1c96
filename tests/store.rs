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

use kvat::{
    BufferOptions, BufferStorage, Storage, Store, StoreError, MEDIA_SIZE, PAGE_SIZE, SEARCH_START,
};
use std::collections::BTreeMap;

fn new_storage() -> BufferStorage {
    BufferStorage::new(vec![0; MEDIA_SIZE].into_boxed_slice(), BufferOptions::default())
}

fn new_store() -> Store<BufferStorage> {
    Store::new(new_storage()).unwrap()
}

/// Simulates a restart: the storage survives, the RAM state is rebuilt.
fn power_cycle(store: Store<BufferStorage>) -> Store<BufferStorage> {
    Store::new(store.extract_storage()).unwrap()
}

/// Returns the number of pages a record of that many bytes occupies.
fn chain_pages(record_len: usize) -> usize {
    if record_len <= PAGE_SIZE {
        1
    } else {
        (record_len + PAGE_SIZE - 2) / (PAGE_SIZE - 1)
    }
}

/// Reads the raw 4-byte entry record of a table slot.
fn raw_entry(store: &Store<BufferStorage>, slot: u32) -> [u8; 4] {
    let bytes = store.storage().read_slice(16 + 4 * slot, 4).unwrap();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

#[test]
fn formats_fresh_storage() {
    let store = new_store();
    // Header: format id, page size, page count, page begin address, little-endian.
    let header = store.storage().read_slice(0, 16).unwrap();
    assert_eq!(&header[0..2], &[0x56, 0x4b]);
    assert_eq!(&header[2..4], &[0, 0]);
    assert_eq!(&header[4..8], &[12, 0, 0, 0]);
    assert_eq!(header[8], 128);
    assert_eq!(&header[12..16], &[0x10, 0x02, 0, 0]);
    // All table slots are free; all pages but the reserved page 0 are free.
    for slot in 0..128 {
        assert_eq!(raw_entry(&store, slot), [0; 4]);
    }
    assert_eq!(store.capacity(), 127);
}

#[test]
fn single_page_round_trip() {
    let mut store = new_store();
    store.save_string("n", "ok").unwrap();
    // The raw value keeps the trailing NUL.
    assert_eq!(store.retrieve("n").unwrap(), b"ok\0");
    assert_eq!(store.retrieve_string("n").unwrap(), "ok");
}

#[test]
fn multi_page_round_trip_with_newline() {
    let mut store = new_store();
    let value = "First string saved. \nMake sure it's on multiple pages.";
    store.save_string("singKey", "placeholder").unwrap();
    store.save_string("singKey", value).unwrap();
    assert_eq!(store.retrieve_string("singKey").unwrap(), value);
    // 55 bytes with the NUL over 11-byte payloads: a 5-page value chain plus the key page.
    assert_eq!(chain_pages(value.len() + 1), 5);
    assert_eq!(store.capacity(), 127 - 6);
}

#[test]
fn keys_with_slashes() {
    let mut store = new_store();
    let value = "Contents of a header file";
    store.save_string("second/key/this.h", value).unwrap();
    assert_eq!(
        store.retrieve_string("second/key/this.c").unwrap_err(),
        StoreError::NotFound
    );
    assert_eq!(store.retrieve_string("second/key/this.h").unwrap(), value);
}

#[test]
fn overwrite_with_longer_value() {
    let mut store = new_store();
    store.save_string("k", "First.").unwrap();
    // Key chain on page 1, single-page value chain on page 2.
    assert_eq!(raw_entry(&store, 1), [0x01, 1, 2, 5]);

    let value = "First. This part is new. This is newer.";
    store.save_string("k", value).unwrap();
    assert_eq!(store.retrieve_string("k").unwrap(), value);
    // The value chain became multi-page but kept its start page; the key chain is untouched.
    let record_len = value.len() + 1;
    let remains = ((PAGE_SIZE - 1) - record_len % (PAGE_SIZE - 1)) % (PAGE_SIZE - 1);
    assert_eq!(raw_entry(&store, 1), [0x09, 1, 2, remains as u8]);
    assert_eq!(store.capacity(), 127 - 1 - chain_pages(record_len));
}

#[test]
fn delete_then_miss() {
    let mut store = new_store();
    store.save_string("x", "v").unwrap();
    store.delete("x").unwrap();
    assert_eq!(store.retrieve("x").unwrap_err(), StoreError::NotFound);
    assert_eq!(store.delete("x").unwrap_err(), StoreError::NotFound);
    assert_eq!(store.capacity(), 127);
}

#[test]
fn rename_moves_binding() {
    let mut store = new_store();
    store.save_string("a", "1").unwrap();
    store.rename("a", "b").unwrap();
    assert_eq!(store.retrieve_string("b").unwrap(), "1");
    assert_eq!(store.retrieve("a").unwrap_err(), StoreError::NotFound);
}

#[test]
fn rename_rejects_duplicate_target() {
    let mut store = new_store();
    store.save_string("a", "1").unwrap();
    store.save_string("b", "2").unwrap();
    assert_eq!(store.rename("a", "b").unwrap_err(), StoreError::KeyDuplicate);
    assert_eq!(store.retrieve_string("a").unwrap(), "1");
    assert_eq!(store.retrieve_string("b").unwrap(), "2");
    // Renaming a key to itself is a no-op.
    store.rename("a", "a").unwrap();
    assert_eq!(store.retrieve_string("a").unwrap(), "1");
}

#[test]
fn rename_across_chain_forms() {
    let mut store = new_store();
    let long_key = "configuration/network/hostname";
    store.save_string("h", "atlas").unwrap();
    store.rename("h", long_key).unwrap();
    assert_eq!(store.retrieve_string(long_key).unwrap(), "atlas");
    store.rename(long_key, "h2").unwrap();
    assert_eq!(store.retrieve_string("h2").unwrap(), "atlas");
    assert_eq!(store.capacity(), 127 - 2);
}

#[test]
fn value_lengths_round_trip() {
    let mut store = new_store();
    for len in 1..=40 {
        let value: Vec<u8> = (0..len as u8).collect();
        store.save("len", &value).unwrap();
        assert_eq!(store.retrieve("len").unwrap(), value, "len {}", len);
    }
    for len in (1..=40).rev() {
        let value: Vec<u8> = (0..len as u8).collect();
        store.save("len", &value).unwrap();
        assert_eq!(store.retrieve("len").unwrap(), value, "len {}", len);
    }
}

#[test]
fn save_delete_save_round_trip() {
    let mut store = new_store();
    let value: Vec<u8> = (0..50).collect();
    store.save("k", &value).unwrap();
    store.delete("k").unwrap();
    store.save("k", &value).unwrap();
    assert_eq!(store.retrieve("k").unwrap(), value);
}

#[test]
fn retrieve_into_reports_full_length() {
    let mut store = new_store();
    let value: Vec<u8> = (0..30).collect();
    store.save("k", &value).unwrap();

    // An exact-size buffer receives the whole value.
    let mut exact = [0xaa; 30];
    assert_eq!(store.retrieve_into("k", &mut exact).unwrap(), 30);
    assert_eq!(&exact[..], &value[..]);

    // A short buffer is filled and the full length still reported.
    let mut short = [0xaa; 10];
    assert_eq!(store.retrieve_into("k", &mut short).unwrap(), 30);
    assert_eq!(&short[..], &value[..10]);

    // A large buffer gets the value and the safety NUL.
    let mut large = [0xaa; 64];
    assert_eq!(store.retrieve_into("k", &mut large).unwrap(), 30);
    assert_eq!(&large[..30], &value[..]);
}

#[test]
fn retrieve_string_into_keeps_terminator() {
    let mut store = new_store();
    store.save_string("greeting", "hello").unwrap();
    let mut buf = [0xaa; 16];
    // The reported length counts the stored NUL.
    assert_eq!(store.retrieve_string_into("greeting", &mut buf).unwrap(), 6);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(buf[5], 0);
}

#[test]
fn search_iterates_matches_once() {
    let mut store = new_store();
    store.save_string("app/a", "1").unwrap();
    store.save_string("zzz", "2").unwrap();
    store.save_string("app/b", "3").unwrap();

    let mut position = SEARCH_START;
    let mut key_buf = [0; 32];
    let mut found = Vec::new();
    loop {
        match store.search("app/", &mut position, &mut key_buf) {
            Ok(length) => found.push(String::from_utf8(key_buf[..length].to_vec()).unwrap()),
            Err(StoreError::NotFound) => break,
            Err(error) => panic!("{:?}", error),
        }
    }
    assert_eq!(found, ["app/a", "app/b"]);

    let keys: Vec<String> = store.matches("app/").map(|key| key.unwrap()).collect();
    assert_eq!(keys, ["app/a", "app/b"]);
    assert_eq!(store.matches("nope").count(), 0);
    // The empty prefix matches everything.
    assert_eq!(store.matches("").count(), 3);
}

#[test]
fn search_truncates_long_keys() {
    let mut store = new_store();
    store.save_string("abcdefghijklmnopqrstuvwxyz", "v").unwrap();
    let mut position = SEARCH_START;
    let mut key_buf = [0; 8];
    // The key does not fit: the copy stops at the buffer and the copied length is returned.
    assert_eq!(store.search("abc", &mut position, &mut key_buf).unwrap(), 8);
    assert_eq!(&key_buf, b"abcdefgh");
    assert_eq!(
        store.search("abc", &mut position, &mut key_buf).unwrap_err(),
        StoreError::NotFound
    );
}

#[test]
fn overwrite_never_frees_other_entries_pages() {
    let mut store = new_store();
    let before: Vec<u8> = (0..60).collect();
    store.save("left", &before).unwrap();
    store.save("mid", &[7; 30]).unwrap();
    store.save("right", &before).unwrap();

    // Grow then shrink the middle entry.
    store.save("mid", &[8; 90]).unwrap();
    assert_eq!(store.retrieve("left").unwrap(), before);
    assert_eq!(store.retrieve("right").unwrap(), before);
    store.save("mid", &[9; 4]).unwrap();
    assert_eq!(store.retrieve("left").unwrap(), before);
    assert_eq!(store.retrieve("right").unwrap(), before);
    assert_eq!(store.retrieve("mid").unwrap(), [9; 4]);
}

#[test]
fn page_accounting_is_exact() {
    let mut store = new_store();
    let mut used = 0;
    for (key, value_len) in [("a", 5), ("bb", 30), ("ccc", 100), ("dddddddddddddd", 1)].iter() {
        store.save(key, &vec![1; *value_len]).unwrap();
        used += chain_pages(key.len() + 1) + chain_pages(*value_len);
        assert_eq!(store.capacity(), 127 - used);
    }
    store.delete("bb").unwrap();
    used -= chain_pages(3) + chain_pages(30);
    assert_eq!(store.capacity(), 127 - used);
}

#[test]
fn overwrite_reuses_value_chain_pages() {
    let mut store = new_store();
    store.save("k", &[1; 44]).unwrap();
    let after_first = store.capacity();
    // 44 bytes take 4 pages; 66 bytes take 6: only 2 fresh pages are consumed.
    store.save("k", &[2; 66]).unwrap();
    assert_eq!(store.capacity(), after_first - 2);
    // Shrinking back frees the surplus tail.
    store.save("k", &[3; 44]).unwrap();
    assert_eq!(store.capacity(), after_first);
}

#[test]
fn rebuilt_bitmap_matches_incremental_one() {
    let mut store = new_store();
    store.save("alpha", &[1; 25]).unwrap();
    store.save("beta", &[2; 70]).unwrap();
    store.save_string("gamma", "g").unwrap();
    store.delete("alpha").unwrap();
    store.save("beta", &[3; 20]).unwrap();

    let capacity = store.capacity();
    let store = power_cycle(store);
    assert_eq!(store.capacity(), capacity);
    assert_eq!(store.retrieve("beta").unwrap(), [3; 20]);
    assert_eq!(store.retrieve_string("gamma").unwrap(), "g");
    assert_eq!(store.retrieve("alpha").unwrap_err(), StoreError::NotFound);
}

#[test]
fn oversized_value_is_rejected() {
    let mut store = new_store();
    assert_eq!(
        store.save("big", &[0; 2000]).unwrap_err(),
        StoreError::InsufficientSpace
    );
    // An empty value cannot be written either.
    assert_eq!(
        store.save("empty", &[]).unwrap_err(),
        StoreError::InsufficientSpace
    );
}

#[test]
fn allocator_exhaustion_is_recoverable() {
    let mut store = new_store();
    store.save_string("keep", "safe").unwrap();
    // Fill the page region.
    let mut filled = 0;
    loop {
        match store.save(&format!("fill{}", filled), &[0x55; 40]) {
            Ok(()) => filled += 1,
            Err(StoreError::InsufficientSpace) => break,
            Err(error) => panic!("{:?}", error),
        }
    }
    assert!(filled > 0);
    assert_eq!(store.retrieve_string("keep").unwrap(), "safe");
    // Deleting an entry makes room again.
    store.delete("fill0").unwrap();
    store.save("again", &[0x66; 40]).unwrap();
    assert_eq!(store.retrieve("again").unwrap(), [0x66; 40]);
    assert_eq!(store.retrieve_string("keep").unwrap(), "safe");
}

#[test]
fn rename_without_space_restores_old_key() {
    let mut store = new_store();
    store.save_string("a", "payload").unwrap();
    // Exhaust the allocator so the longer key cannot be written.
    let mut filled = 0;
    loop {
        match store.save(&format!("fill{}", filled), &[0x55; 40]) {
            Ok(()) => filled += 1,
            Err(StoreError::InsufficientSpace) => break,
            Err(error) => panic!("{:?}", error),
        }
    }
    assert_eq!(
        store
            .rename("a", "a_very_long_key_spanning_multiple_pages")
            .unwrap_err(),
        StoreError::InsufficientSpace
    );
    // The old binding survived the failed rename.
    assert_eq!(store.retrieve_string("a").unwrap(), "payload");
    assert!(store.is_ready());
}

#[test]
fn faulted_key_chain_write_reports_insufficient_space() {
    let store = new_store();
    let mut storage = store.extract_storage();
    // A new-key save programs: open entry, key page, value page, final entry.
    storage.arm_fault(1);
    let mut store = Store::new(storage).unwrap();
    assert_eq!(
        store.save("k", &[1, 2, 3]).unwrap_err(),
        StoreError::InsufficientSpace
    );
    // The fault was transient: the store stays usable and no page leaked.
    assert!(store.is_ready());
    assert_eq!(store.capacity(), 127);
    store.save("k", &[1, 2, 3]).unwrap();
    assert_eq!(store.retrieve("k").unwrap(), [1, 2, 3]);
}

#[test]
fn faulted_value_chain_write_reports_insufficient_space() {
    let store = new_store();
    let mut storage = store.extract_storage();
    storage.arm_fault(2);
    let mut store = Store::new(storage).unwrap();
    assert_eq!(
        store.save("k", &[1, 2, 3]).unwrap_err(),
        StoreError::InsufficientSpace
    );
    // The key chain written before the fault was returned to the allocator.
    assert!(store.is_ready());
    assert_eq!(store.capacity(), 127);
    store.save("k", &[1, 2, 3]).unwrap();
    assert_eq!(store.retrieve("k").unwrap(), [1, 2, 3]);
}

#[test]
fn failed_final_commit_deinitializes() {
    let store = new_store();
    let mut storage = store.extract_storage();
    // A new-key save programs: open entry, key page, value page, final entry.
    storage.arm_fault(3);
    let mut store = Store::new(storage).unwrap();
    assert_eq!(store.save("k", &[1, 2, 3]).unwrap_err(), StoreError::TableError);
    assert!(!store.is_ready());
    assert_eq!(store.retrieve("k").unwrap_err(), StoreError::InvalidAccess);
    assert_eq!(store.save("k", &[1]).unwrap_err(), StoreError::InvalidAccess);
    assert_eq!(store.delete("k").unwrap_err(), StoreError::InvalidAccess);
}

#[test]
fn open_entry_is_ignored_after_restart() {
    let store = new_store();
    let mut storage = store.extract_storage();
    storage.arm_fault(3);
    let mut store = Store::new(storage).unwrap();
    assert_eq!(store.save("k", &[1, 2, 3]).unwrap_err(), StoreError::TableError);

    // After a restart the open entry is not live and its pages are reclaimed.
    let mut store = power_cycle(store);
    assert_eq!(store.capacity(), 127);
    assert_eq!(store.retrieve("k").unwrap_err(), StoreError::NotFound);
    store.save_string("other", "value").unwrap();
    assert_eq!(store.retrieve_string("other").unwrap(), "value");
}

#[test]
fn failed_delete_reports_table_error() {
    let mut store = new_store();
    store.save_string("x", "v").unwrap();
    let mut storage = store.extract_storage();
    storage.arm_fault(0);
    let mut store = Store::new(storage).unwrap();
    assert_eq!(store.delete("x").unwrap_err(), StoreError::TableError);
    assert!(store.is_ready());
}

#[test]
fn dead_device_during_rename_loses_binding() {
    let mut store = new_store();
    store.save_string("a", "1").unwrap();
    let mut storage = store.extract_storage();
    storage.arm_persistent_fault(0);
    let mut store = Store::new(storage).unwrap();
    // Neither the new key nor the old key can be written back.
    assert_eq!(store.rename("a", "b").unwrap_err(), StoreError::Unknown);
    assert!(!store.is_ready());
    assert_eq!(store.retrieve("a").unwrap_err(), StoreError::InvalidAccess);
}

#[test]
fn formatting_fault_fails_init() {
    let mut storage = new_storage();
    storage.arm_fault(10);
    assert_eq!(Store::new(storage).unwrap_err(), StoreError::TableError);
}

#[test]
fn undersized_storage_is_rejected() {
    let storage = BufferStorage::new(
        vec![0; MEDIA_SIZE - 4].into_boxed_slice(),
        BufferOptions::default(),
    );
    assert_eq!(Store::new(storage).unwrap_err(), StoreError::InvalidAccess);
}

#[test]
fn randomized_against_model() {
    use rand_core::{RngCore, SeedableRng};
    let mut rng = rand_pcg::Pcg32::seed_from_u64(0x6b766174);
    let mut store = new_store();
    let mut model: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
    let keys = ["alpha", "beta/0", "beta/1", "gamma", "a-much-longer-key-name"];

    for step in 0..1000 {
        let key = keys[rng.next_u32() as usize % keys.len()];
        match rng.next_u32() % 4 {
            0 | 1 => {
                let length = 1 + rng.next_u32() as usize % 40;
                let mut value = vec![0; length];
                rng.fill_bytes(&mut value);
                store.save(key, &value).unwrap();
                model.insert(key, value);
            }
            2 => match store.delete(key) {
                Ok(()) => assert!(model.remove(key).is_some()),
                Err(StoreError::NotFound) => assert!(!model.contains_key(key)),
                Err(error) => panic!("{:?}", error),
            },
            _ => match store.retrieve(key) {
                Ok(value) => assert_eq!(&value, model.get(key).unwrap()),
                Err(StoreError::NotFound) => assert!(!model.contains_key(key)),
                Err(error) => panic!("{:?}", error),
            },
        }
        if step % 97 == 0 {
            let capacity = store.capacity();
            store = power_cycle(store);
            assert_eq!(store.capacity(), capacity);
            for (key, value) in &model {
                assert_eq!(&store.retrieve(key).unwrap(), value);
            }
        }
    }
}
