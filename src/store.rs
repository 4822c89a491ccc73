//! Durable keyed map over an encrypted view.
//!
//! Records are serialized key/value pairs laid out in runs of consecutive
//! blocks. Every block starts with a 32-byte header:
//!
//! ```text
//! offset 0  : be64 order      monotonic sequence number of the write
//! offset 8  : be64 size       0 = terminator, u64::MAX = continuation,
//!                             anything else = head with total payload size
//! offset 16 : 16 bytes        reserved, zero
//! offset 32 : 4032 bytes      payload
//! ```
//!
//! Commits are defined by terminator blocks. A terminator carries the
//! combined hash — an XOR accumulation of HMAC-SHA-512 over every live
//! record's `(order, position)` pair. The hash is order-insensitive and
//! self-cancelling, so it encodes exactly the set of block placements that
//! were live at commit time; adding and removing a placement are the same
//! operation.
//!
//! The commit sequence is: write dirty records, barrier, write the new
//! terminator, barrier, release the old terminator and the records'
//! previous locations. A crash at any point leaves the newest valid
//! terminator defining the committed state; reopening rolls the store back
//! to it. Recovery takes up to three passes over the file:
//!
//! 1. an optimistic pass accepting everything well-formed,
//! 2. a strict pass rejecting writes newer than the last commit (the
//!    normal crash-rollback path),
//! 3. a salvage pass that keeps whatever survived and marks the store
//!    degraded.
//!
//! One mutex serializes every public operation; the store owns its view
//! exclusively. Shared-reader upgrades are deliberately unsupported.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::hash::Hash;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha512;

use crate::codec::{self, Wire};
use crate::endian::Be64;
use crate::freespace::FreeSpace;
use crate::view::{View, BLOCK_SIZE};

/// Payload bytes per store block.
pub const DATA_SIZE: usize = BLOCK_SIZE - HEADER_SIZE;

const HEADER_SIZE: usize = 32;

/// "No block" marker for terminator bookkeeping.
const NO_BLOCK: u32 = u32::MAX;

/// Sticky error bits accumulated by recovery and writes.
pub mod bits {
    /// A block failed AEAD verification.
    pub const DECRYPT: u32 = 1;
    /// A block header carried an impossible order or size.
    pub const MALFORMED: u32 = 2;
    /// Blocks newer than the last commit were discarded and recovery
    /// still could not reach a consistent state.
    pub const UNCOMMITTED: u32 = 4;
    /// A multi-block record broke off mid-way.
    pub const TRUNCATED: u32 = 8;
    /// A record ran past the end of the file.
    pub const INCOMPLETE: u32 = 16;
    /// Recovery fell through to the salvage pass; the store is readable
    /// but degraded.
    pub const DEGRADED: u32 = 32;
    /// A record write failed.
    pub const WRITE_FAILED: u32 = 64;
    /// A terminator write failed; the commit did not happen.
    pub const COMMIT_FAILED: u32 = 128;
}

/// XOR-combined HMAC-SHA-512 over `(order, position)` pairs.
///
/// Mixing the same pair twice cancels it, so the accumulator always equals
/// the XOR over the current live set.
pub struct CombinedHash {
    state: [u8; 64],
    mac: Hmac<Sha512>,
}

impl CombinedHash {
    pub fn new(salt: &[u8]) -> Self {
        CombinedHash {
            state: [0u8; 64],
            mac: Hmac::new_from_slice(salt).expect("HMAC-SHA-512 accepts keys of any length"),
        }
    }

    /// Toggle one `(order, position)` pair in or out of the accumulator.
    pub fn add(&mut self, order: u64, pos: u64) {
        let mut data = [0u8; 16];
        data[..8].copy_from_slice(Be64::from(order).as_bytes());
        data[8..].copy_from_slice(Be64::from(pos).as_bytes());

        let digest = self.mac.clone().chain_update(data).finalize().into_bytes();
        for (state, byte) in self.state.iter_mut().zip(digest) {
            *state ^= byte;
        }
    }

    pub fn check(&self, other: &[u8; 64]) -> bool {
        self.state == *other
    }

    pub fn dump(&self) -> [u8; 64] {
        self.state
    }

    pub fn clear(&mut self) {
        self.state = [0u8; 64];
    }
}

/// Placement bookkeeping for one record.
#[derive(Debug, Clone, Copy, Default)]
struct Control {
    /// Sequence number of the record's blocks; 0 means dirty, awaiting
    /// a write.
    order: u64,
    /// Committed block range.
    load_block: u32,
    load_count: u32,
    /// Written but not yet committed block range.
    new_block: u32,
    new_count: u32,
}

struct Slot<V> {
    ctrl: Control,
    value: V,
}

/// Recovery pass.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Optimistic,
    Strict,
    Degraded,
}

struct Inner<K, V> {
    map: HashMap<K, Slot<V>>,
    view: View,
    error: u32,
    /// Block index of the current terminator.
    lastf: u32,
    /// Order of the last update.
    order: u64,
    /// Order of the last commit; a flush is pending while `order > flush`.
    flush: u64,
    hash: CombinedHash,
    free: FreeSpace,
}

fn block_header(block: &[u8; BLOCK_SIZE]) -> (u64, u64) {
    let order = Be64::read(&block[..8]).map(Be64::get).unwrap_or(0);
    let size = Be64::read(&block[8..16]).map(Be64::get).unwrap_or(0);
    (order, size)
}

fn build_block(order: u64, size: u64, data: &[u8]) -> [u8; BLOCK_SIZE] {
    debug_assert!(data.len() <= DATA_SIZE);

    let mut block = [0u8; BLOCK_SIZE];
    block[..8].copy_from_slice(Be64::from(order).as_bytes());
    block[8..16].copy_from_slice(Be64::from(size).as_bytes());
    block[HEADER_SIZE..HEADER_SIZE + data.len()].copy_from_slice(data);
    block
}

impl<K, V> Inner<K, V>
where
    K: Wire + Clone + Eq + Hash,
    V: Wire,
{
    /// Toggle the hash contribution of a clean slot and mark it dirty.
    fn mark_dirty(hash: &mut CombinedHash, slot: &mut Slot<V>) {
        if slot.ctrl.order != 0 {
            let pos = if slot.ctrl.new_count != 0 {
                slot.ctrl.new_block
            } else {
                slot.ctrl.load_block
            };
            hash.add(slot.ctrl.order, pos as u64);
            slot.ctrl.order = 0;
        }
    }

    /// Serialize one record and write its blocks into a fresh range.
    fn write_record(
        view: &mut View,
        free: &mut FreeSpace,
        hash: &mut CombinedHash,
        order: &mut u64,
        error: &mut u32,
        key: &K,
        slot: &mut Slot<V>,
    ) {
        let mut key_copy = key.clone();
        let value = &mut slot.value;
        let buf = codec::encode(|ctx| {
            key_copy.traverse(ctx);
            value.traverse(ctx);
        });

        let count = ((buf.len() + DATA_SIZE - 1) / DATA_SIZE) as u32;

        Self::mark_dirty(hash, slot);
        let ctrl = &mut slot.ctrl;
        *order += 1;
        ctrl.order = *order;

        if ctrl.new_count != count {
            free.add(ctrl.new_block, ctrl.new_count);
            match free.take(count) {
                Ok(block) => {
                    ctrl.new_block = block;
                    ctrl.new_count = count;
                }
                Err(_) => {
                    ctrl.new_block = 0;
                    ctrl.new_count = 0;
                    ctrl.order = 0;
                    *order -= 1;
                    *error |= bits::WRITE_FAILED;
                    return;
                }
            }
        }

        hash.add(ctrl.order, ctrl.new_block as u64);

        for i in 0..count {
            let start = i as usize * DATA_SIZE;
            let chunk = &buf[start..buf.len().min(start + DATA_SIZE)];
            let size = if i == 0 { buf.len() as u64 } else { u64::MAX };
            let block = build_block(ctrl.order, size, chunk);

            if !view.write_block(ctrl.new_block as u64 + i as u64, &block, 0) {
                free.add(ctrl.new_block, ctrl.new_count);
                hash.add(ctrl.order, ctrl.new_block as u64);
                ctrl.new_block = 0;
                ctrl.new_count = 0;
                ctrl.order = 0;
                *order -= 1;
                *error |= bits::WRITE_FAILED;
                return;
            }
        }
    }

    /// Write every dirty record.
    fn flush_dirty(&mut self) {
        let Inner {
            map,
            view,
            free,
            hash,
            order,
            error,
            ..
        } = self;

        for (key, slot) in map.iter_mut() {
            if slot.ctrl.order == 0 {
                Self::write_record(view, free, hash, order, error, key, slot);
            }
        }
    }

    /// Write a terminator for the current state and promote pending
    /// ranges. On success the store is committed up to `self.order`.
    fn write_terminator(&mut self) {
        let Ok(pos) = self.free.take(1) else {
            self.error |= bits::COMMIT_FAILED;
            return;
        };

        self.order += 1;
        let block = build_block(self.order, 0, &self.hash.dump());

        if !self.view.write_block(pos as u64, &block, 0) {
            self.order -= 1;
            self.error |= bits::COMMIT_FAILED;
            self.free.add(pos, 1);
            return;
        }

        self.view.flush();

        if self.lastf != NO_BLOCK {
            self.free.add(self.lastf, 1);
        }
        self.lastf = pos;
        self.flush = self.order;

        // The new locations are durable now; release the old ones
        let Inner { map, free, .. } = self;
        for slot in map.values_mut() {
            let ctrl = &mut slot.ctrl;
            if ctrl.new_count != 0 {
                free.add(ctrl.load_block, ctrl.load_count);
                ctrl.load_block = ctrl.new_block;
                ctrl.load_count = ctrl.new_count;
                ctrl.new_block = 0;
                ctrl.new_count = 0;
            }
        }

        tracing::debug!(order = self.order, terminator = pos, "store committed");
    }

    /// Commit: write dirty records, barrier, terminator, barrier.
    fn finalize(&mut self) {
        if self.order <= self.flush {
            return;
        }

        self.flush_dirty();
        self.view.flush();
        self.write_terminator();
    }

    /// One recovery pass over every on-disk block. Returns the hash
    /// recorded by the winning terminator and the provisional error bits
    /// of this pass.
    fn scan(&mut self, attempt: Attempt) -> ([u8; 64], u32) {
        let optimistic = attempt == Attempt::Optimistic;
        let limit = match attempt {
            Attempt::Strict => self.flush,
            _ => u64::MAX,
        };

        let count = self.view.count().min(NO_BLOCK as u64) as u32;
        let mut last_hash = [0u8; 64];
        let mut pending = 0u32;

        self.map.clear();
        self.free.clear();
        self.hash.clear();
        self.order = 0;
        self.lastf = NO_BLOCK;
        self.free.add(count, 0u32.wrapping_sub(count));

        let mut block = [0u8; BLOCK_SIZE];
        let mut i: u32 = 0;

        while i < count {
            if !self.view.read_block(i as u64, &mut block, 0) {
                self.error |= bits::DECRYPT;
                self.free.add(i, 1);
                i += 1;
                continue;
            }

            let (order, size) = block_header(&block);

            if order == 0 || order >= 1 << 63 {
                self.error |= bits::MALFORMED;
                self.free.add(i, 1);
                i += 1;
                continue;
            }

            if size >= 1 << 31 {
                // u64::MAX is a continuation with no surviving head;
                // anything else in this range is malformed
                if size != u64::MAX {
                    self.error |= bits::MALFORMED;
                }
                self.free.add(i, 1);
                i += 1;
                continue;
            }

            if !optimistic && order > self.order {
                self.order = order;
            }

            if order > limit {
                pending |= bits::UNCOMMITTED;
                self.free.add(i, 1);
                i += 1;
                continue;
            }

            if size == 0 {
                // Terminator: in the optimistic pass the newest one wins;
                // afterwards only the one matching the commit order counts
                if optimistic && order > self.order {
                    if self.lastf != NO_BLOCK {
                        self.free.add(self.lastf, 1);
                    }
                    last_hash.copy_from_slice(&block[HEADER_SIZE..HEADER_SIZE + 64]);
                    self.order = order;
                    self.lastf = i;
                } else if !optimistic && order == limit {
                    last_hash.copy_from_slice(&block[HEADER_SIZE..HEADER_SIZE + 64]);
                    self.lastf = i;
                } else {
                    self.free.add(i, 1);
                }
                i += 1;
                continue;
            }

            // Head of a record: collect the payload across its run
            let total = size as usize;
            let head = i;
            let take = total.min(DATA_SIZE);

            let mut buf = Vec::with_capacity(total);
            buf.extend_from_slice(&block[HEADER_SIZE..HEADER_SIZE + take]);
            let mut remaining = total - take;

            let mut next = i + 1;
            let mut broken = false;

            while remaining > 0 {
                if next >= count {
                    self.error |= bits::INCOMPLETE;
                    self.free.add(head, next - head);
                    broken = true;
                    break;
                }

                if !self.view.read_block(next as u64, &mut block, 0) {
                    self.error |= bits::DECRYPT | bits::TRUNCATED;
                    self.free.add(head, next + 1 - head);
                    next += 1;
                    broken = true;
                    break;
                }

                let (sibling_order, sibling_size) = block_header(&block);
                if sibling_order != order || sibling_size != u64::MAX {
                    self.error |= bits::TRUNCATED;
                    self.free.add(head, next + 1 - head);
                    next += 1;
                    broken = true;
                    break;
                }

                let take = remaining.min(DATA_SIZE);
                buf.extend_from_slice(&block[HEADER_SIZE..HEADER_SIZE + take]);
                remaining -= take;
                next += 1;
            }

            i = next;
            if broken {
                continue;
            }

            let span = next - head;

            let mut key = K::default();
            let mut value = V::default();
            codec::decode(&buf, |ctx| {
                key.traverse(ctx);
                value.traverse(ctx);
            });

            match self.map.entry(key) {
                MapEntry::Occupied(mut occupied) => {
                    let slot = occupied.get_mut();
                    if slot.ctrl.order < order {
                        // Newer version wins; release the loser
                        self.hash.add(slot.ctrl.order, slot.ctrl.load_block as u64);
                        self.free.add(slot.ctrl.load_block, slot.ctrl.load_count);
                        slot.ctrl = Control {
                            order,
                            load_block: head,
                            load_count: span,
                            ..Control::default()
                        };
                        slot.value = value;
                        self.hash.add(order, head as u64);
                    } else {
                        self.free.add(head, span);
                    }
                }
                MapEntry::Vacant(vacant) => {
                    vacant.insert(Slot {
                        ctrl: Control {
                            order,
                            load_block: head,
                            load_count: span,
                            ..Control::default()
                        },
                        value,
                    });
                    self.hash.add(order, head as u64);
                }
            }
        }

        (last_hash, pending)
    }

    /// Three-attempt recovery.
    fn reload(&mut self) {
        let mut attempt = Attempt::Optimistic;

        loop {
            let (last_hash, pending) = self.scan(attempt);

            match attempt {
                Attempt::Optimistic => {
                    self.flush = self.order;
                    if self.hash.check(&last_hash) {
                        break;
                    }
                    attempt = Attempt::Strict;
                }
                Attempt::Strict => {
                    if self.hash.check(&last_hash) {
                        // Uncommitted writes rolled back cleanly: the
                        // expected crash-recovery outcome. The discarded
                        // blocks are not an error.
                        self.flush = self.order;
                        break;
                    }
                    self.error |= pending;
                    attempt = Attempt::Degraded;
                }
                Attempt::Degraded => {
                    self.flush = 0;
                    self.error |= bits::DEGRADED;
                    break;
                }
            }
        }
    }
}

/// Crash-safe keyed map over an encrypted block file.
pub struct Store<K, V>
where
    K: Wire + Clone + Eq + Hash,
    V: Wire,
{
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> Store<K, V>
where
    K: Wire + Clone + Eq + Hash,
    V: Wire,
{
    /// Attach to a view and recover the committed state. `salt` keys the
    /// combined hash and must be stable for the lifetime of the file.
    ///
    /// A container with no valid terminator (typically a fresh file) gets
    /// an initial one written immediately; that is the only way an empty
    /// valid store comes into existence.
    pub fn open(salt: &[u8], view: View) -> Self {
        let mut inner = Inner {
            map: HashMap::new(),
            view,
            error: 0,
            lastf: NO_BLOCK,
            order: 0,
            flush: 0,
            hash: CombinedHash::new(salt),
            free: FreeSpace::new(),
        };

        inner.reload();

        // A fresh file gets its initial terminator immediately. A
        // non-empty file without one (wrong key, heavy damage) is left
        // alone: committing over it would destroy data a better key or a
        // later salvage could still reach.
        if inner.lastf == NO_BLOCK && inner.view.count() == 0 {
            inner.write_terminator();
        }

        if inner.error != 0 {
            tracing::warn!(
                bits = inner.error,
                records = inner.map.len(),
                "store recovered with errors"
            );
        }

        Store {
            inner: Mutex::new(inner),
        }
    }

    /// Sticky error bits accumulated so far.
    pub fn error_bits(&self) -> u32 {
        self.inner.lock().error
    }

    /// Run a read-only operation under the store lock.
    pub fn read<R>(&self, op: impl FnOnce(Reader<'_, K, V>) -> R) -> R {
        let inner = self.inner.lock();
        op(Reader { map: &inner.map })
    }

    /// Run a mutating operation under the store lock. Dirty records are
    /// written when the operation returns, but not committed.
    pub fn write<R>(&self, op: impl FnOnce(&mut Writer<'_, K, V>) -> R) -> R {
        self.run(false, op)
    }

    /// Like [`Store::write`], but also commits with a new terminator.
    pub fn flush_with<R>(&self, op: impl FnOnce(&mut Writer<'_, K, V>) -> R) -> R {
        self.run(true, op)
    }

    /// Commit any outstanding writes.
    pub fn flush(&self) {
        self.inner.lock().finalize();
    }

    fn run<R>(&self, commit: bool, op: impl FnOnce(&mut Writer<'_, K, V>) -> R) -> R {
        let mut inner = self.inner.lock();

        let mut writer = Writer {
            inner: &mut *inner,
            modified: false,
        };
        let result = op(&mut writer);
        let modified = writer.modified;

        if modified {
            inner.flush_dirty();
        }
        if commit {
            inner.finalize();
        }

        result
    }
}

impl<K, V> Drop for Store<K, V>
where
    K: Wire + Clone + Eq + Hash,
    V: Wire,
{
    fn drop(&mut self) {
        self.inner.get_mut().finalize();
    }
}

/// Read-only accessor handed out by [`Store::read`].
pub struct Reader<'a, K, V> {
    map: &'a HashMap<K, Slot<V>>,
}

impl<'a, K, V> Reader<'a, K, V>
where
    K: Eq + Hash,
{
    pub fn get(&self, key: &K) -> Option<&'a V> {
        self.map.get(key).map(|slot| &slot.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a K, &'a V)> + 'a {
        self.map.iter().map(|(key, slot)| (key, &slot.value))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Mutating accessor handed out by [`Store::write`] and
/// [`Store::flush_with`].
pub struct Writer<'w, K, V>
where
    K: Wire + Clone + Eq + Hash,
    V: Wire,
{
    inner: &'w mut Inner<K, V>,
    modified: bool,
}

impl<K, V> Writer<'_, K, V>
where
    K: Wire + Clone + Eq + Hash,
    V: Wire,
{
    /// Read without marking anything dirty.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.map.get(key).map(|slot| &slot.value)
    }

    /// Mutable access; the record is marked dirty and rewritten when the
    /// operation completes.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let inner = &mut *self.inner;
        let slot = inner.map.get_mut(key)?;
        Inner::<K, V>::mark_dirty(&mut inner.hash, slot);
        self.modified = true;
        Some(&mut slot.value)
    }

    /// Idempotent emplace: insert `value` if the key is absent, keep the
    /// stored value otherwise. Either way the record is marked dirty and
    /// a mutable reference is returned.
    pub fn add(&mut self, key: K, value: V) -> &mut V {
        let inner = &mut *self.inner;
        let slot = inner.map.entry(key).or_insert(Slot {
            ctrl: Control::default(),
            value,
        });
        Inner::<K, V>::mark_dirty(&mut inner.hash, slot);
        self.modified = true;
        &mut slot.value
    }
}
