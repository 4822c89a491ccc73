//! Encrypted local-storage substrate for peer-to-peer applications.
//!
//! Two layers make up the core:
//!
//! - [`view`] — an encrypted block container: a flat file of 4096-byte
//!   AES-256-GCM frames, each bound to its position and container identity
//!   through computed associated data, indistinguishable from random data
//!   on disk.
//! - [`store`] — a crash-safe key/value store over a view. Commits are
//!   terminator blocks carrying a combined hash of every live record
//!   placement; recovery replays the newest valid commit and rolls
//!   anything unfinished back.
//!
//! Supporting primitives:
//!
//! - [`master`] — password → 128-byte secret (scrypt) and HMAC-SHA-512
//!   subkey derivation, with key-file persistence.
//! - [`pubkey`] — X25519 public keys, base-57/hex encodings, and the
//!   anonymous ephemeral-static cryptobox.
//! - [`codec`] — the compact tagged serialization the store uses for
//!   records, with forward/backward schema compatibility.
//! - [`queue`] — a lock-free MPSC list for cross-thread event delivery.
//! - [`freespace`] — the block allocator backing the store.
//! - [`endian`] — fixed big-endian integer layouts shared by everything
//!   that touches the disk.
//!
//! ## Example
//!
//! ```no_run
//! use coffer::{master::MasterKey, store::Store, view::View, gui::NoGui};
//!
//! let gui = NoGui;
//! let mut master = MasterKey::new("app.key");
//! master.init_from_password("correct horse battery staple", &gui);
//!
//! let subkey = master.derive(b"storage:main").unwrap();
//! let mut view_key = [0u8; 32];
//! view_key.copy_from_slice(&subkey[..32]);
//!
//! let view = View::open("state.bin", &view_key)?;
//! let store: Store<String, u64> = Store::open(b"state-hash-salt", view);
//!
//! store.flush_with(|w| {
//!     w.add("session.count".to_string(), 1);
//! });
//!
//! store.read(|r| {
//!     assert_eq!(r.get(&"session.count".to_string()), Some(&1));
//! });
//! # Ok::<(), coffer::CofferError>(())
//! ```

pub mod codec;
pub mod endian;
pub mod error;
pub mod freespace;
pub mod gui;
pub mod master;
pub mod pubkey;
pub mod queue;
pub mod store;
pub mod view;

pub use codec::{Context, Wire};
pub use error::{CofferError, Result};
pub use gui::Gui;
pub use master::MasterKey;
pub use pubkey::PublicKey;
pub use queue::EventQueue;
pub use store::Store;
pub use view::View;
