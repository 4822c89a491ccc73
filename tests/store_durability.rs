//! End-to-end durability and recovery scenarios for the encrypted store.

use coffer::gui::Gui;
use coffer::master::MasterKey;
use coffer::store::{bits, Store};
use coffer::view::{View, FRAME_SIZE};
use tempfile::TempDir;

const SALT: &[u8] = b"durability-salt";
const VIEW_KEY: [u8; 32] = [0x5Au8; 32];

fn open_store(dir: &TempDir) -> Store<String, String> {
    let view = View::open(dir.path().join("state.bin"), &VIEW_KEY).unwrap();
    Store::open(SALT, view)
}

#[test]
fn create_insert_flush_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store: Store<String, u64> =
            Store::open(SALT, View::open(dir.path().join("s.bin"), &VIEW_KEY).unwrap());
        store.flush_with(|w| {
            w.add("alpha".to_string(), 42);
        });
        assert_eq!(store.error_bits(), 0);
    }

    let store: Store<String, u64> =
        Store::open(SALT, View::open(dir.path().join("s.bin"), &VIEW_KEY).unwrap());
    assert_eq!(store.error_bits(), 0);
    store.read(|r| assert_eq!(r.get(&"alpha".to_string()), Some(&42)));
}

#[test]
fn thousand_records_survive_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = open_store(&dir);
        store.flush_with(|w| {
            for i in 0..1000 {
                w.add(format!("key-{i:04}"), format!("{i:0>180}"));
            }
        });
        assert_eq!(store.error_bits(), 0);
    }

    let store = open_store(&dir);
    assert_eq!(store.error_bits(), 0);
    store.read(|r| {
        assert_eq!(r.len(), 1000);
        assert_eq!(r.iter().count(), 1000);
        for i in (0..1000).step_by(97) {
            assert_eq!(r.get(&format!("key-{i:04}")), Some(&format!("{i:0>180}")));
        }
    });
}

#[test]
fn corrupted_continuation_loses_one_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.bin");

    {
        let store = open_store(&dir);
        // One three-block record first, then two single-block ones; the
        // separate flushes pin the big record to blocks 1..=3
        store.flush_with(|w| {
            w.add("big".to_string(), "x".repeat(9000));
        });
        store.flush_with(|w| {
            w.add("small-a".to_string(), "a".to_string());
        });
        store.flush_with(|w| {
            w.add("small-b".to_string(), "b".to_string());
        });
        assert_eq!(store.error_bits(), 0);
    }

    // Flip one ciphertext byte in the record's second block
    let mut raw = std::fs::read(&path).unwrap();
    raw[2 * FRAME_SIZE + 100] ^= 0x01;
    std::fs::write(&path, &raw).unwrap();

    let store = open_store(&dir);
    assert_ne!(store.error_bits() & bits::DECRYPT, 0);
    store.read(|r| {
        assert_eq!(r.get(&"big".to_string()), None);
        assert_eq!(r.get(&"small-a".to_string()), Some(&"a".to_string()));
        assert_eq!(r.get(&"small-b".to_string()), Some(&"b".to_string()));
    });
}

#[test]
fn interrupted_update_batch_rolls_back_atomically() {
    let dir = TempDir::new().unwrap();

    {
        let store = open_store(&dir);
        store.flush_with(|w| {
            for i in 0..10 {
                w.add(format!("entry-{i}"), format!("original-{i}"));
            }
        });
        assert_eq!(store.error_bits(), 0);

        // Five updates reach the disk, the commit never does
        store.write(|w| {
            for i in 0..5 {
                *w.get_mut(&format!("entry-{i}")).unwrap() = format!("updated-{i}");
            }
        });

        // Simulated crash before the final flush
        std::mem::forget(store);
    }

    let store = open_store(&dir);
    assert_eq!(store.error_bits(), 0);
    store.read(|r| {
        assert_eq!(r.len(), 10);
        for i in 0..10 {
            // Either all five updates or none may survive; without a
            // terminator they must all be rolled back
            assert_eq!(r.get(&format!("entry-{i}")), Some(&format!("original-{i}")));
        }
    });
}

#[test]
fn wrong_view_key_reads_nothing() {
    let dir = TempDir::new().unwrap();

    {
        let store = open_store(&dir);
        store.flush_with(|w| {
            w.add("secret".to_string(), "value".to_string());
        });
    }

    let wrong_key = [0xA5u8; 32];
    let view = View::open(dir.path().join("state.bin"), &wrong_key).unwrap();
    let store: Store<String, String> = Store::open(SALT, view);

    assert_ne!(store.error_bits() & bits::DECRYPT, 0);
    store.read(|r| assert!(r.is_empty()));

    // Do not let this store commit over the real one
    std::mem::forget(store);
}

#[test]
fn master_key_feeds_view_and_store() {
    struct FailingGui;

    impl Gui for FailingGui {
        fn warn(&self, _msg: &str) -> bool {
            false
        }

        fn fatal(&self, msg: &str) -> ! {
            panic!("fatal: {msg}");
        }
    }

    let dir = TempDir::new().unwrap();
    let gui = FailingGui;

    let secret = [0x42u8; 128];
    let master = MasterKey::from_secret(&secret, &gui);

    let subkey = master.derive(b"storage:test").unwrap();
    let mut view_key = [0u8; 32];
    view_key.copy_from_slice(&subkey[..32]);

    {
        let view = View::open(dir.path().join("derived.bin"), &view_key).unwrap();
        let store: Store<String, u64> = Store::open(SALT, view);
        store.flush_with(|w| {
            w.add("n".to_string(), 9);
        });
    }

    // The same password-independent derivation unlocks the store again
    let master2 = MasterKey::from_secret(&secret, &gui);
    let subkey2 = master2.derive(b"storage:test").unwrap();
    assert_eq!(subkey, subkey2);

    let mut view_key2 = [0u8; 32];
    view_key2.copy_from_slice(&subkey2[..32]);
    let view = View::open(dir.path().join("derived.bin"), &view_key2).unwrap();
    let store: Store<String, u64> = Store::open(SALT, view);
    assert_eq!(store.error_bits(), 0);
    store.read(|r| assert_eq!(r.get(&"n".to_string()), Some(&9)));
}

#[test]
fn store_files_look_random() {
    let dir = TempDir::new().unwrap();

    {
        let store = open_store(&dir);
        store.flush_with(|w| {
            w.add("zeros".to_string(), "\0".repeat(4000));
        });
    }

    let raw = std::fs::read(dir.path().join("state.bin")).unwrap();
    assert_eq!(raw.len() % FRAME_SIZE, 0);

    // A plaintext of zeros must not show through; rough entropy check on
    // byte diversity per frame
    for frame in raw.chunks(FRAME_SIZE) {
        let mut seen = [false; 256];
        for &b in frame {
            seen[b as usize] = true;
        }
        let distinct = seen.iter().filter(|&&s| s).count();
        assert!(distinct > 128, "frame looks structured: {distinct} distinct bytes");
    }
}
