//! Encrypted block container.
//!
//! A view is a flat file of fixed 4096-byte frames, each carrying 4064
//! bytes of plaintext under AES-256-GCM with a 16-byte random nonce:
//!
//! ```text
//! offset 0    : 16-byte nonce
//! offset 16   : 4064-byte ciphertext
//! offset 4080 : 16-byte auth tag
//! ```
//!
//! The additional authenticated data of every frame is computed, never
//! stored: `be64(ident) || be64(index)`. Binding the frame to its index
//! means a frame copied to another position fails verification, and the
//! caller-chosen identifier separates containers sharing one key. On disk
//! a view is indistinguishable from random data.
//!
//! A view is not internally synchronized; callers serialize access to one
//! file externally (the KV store does so with its own mutex).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aes::Aes256;
use aes_gcm::{AeadInPlace, AesGcm, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::endian::Be64;
use crate::error::Result;

/// Plaintext bytes per block.
pub const BLOCK_SIZE: usize = 4064;

/// On-disk bytes per frame.
pub const FRAME_SIZE: usize = 4096;

const NONCE_SIZE: usize = 16;

/// Automatic growth cap for a single byte-granular write.
const AUTO_GROW_LIMIT: u64 = 1024 * 1024 * 1024;

/// Hard cap on container size (1 PiB).
const SIZE_LIMIT: u64 = 1024u64 * 1024 * 1024 * 1024 * 1024;

/// AES-256-GCM with the non-default 16-byte nonce.
type FrameCipher = AesGcm<Aes256, U16>;

/// Encrypted block file.
pub struct View {
    file: File,
    path: PathBuf,
    cipher: FrameCipher,
    /// Current number of blocks; a failed write never changes it.
    count: u64,
}

impl View {
    /// Create or open an encrypted container.
    ///
    /// A file whose length is not a multiple of 4096 is treated as
    /// malformed by flooring the block count; the tail is discarded on
    /// close.
    pub fn open(path: impl AsRef<Path>, key: &[u8; 32]) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let count = file.metadata()?.len() / FRAME_SIZE as u64;
        tracing::debug!(path = %path.as_ref().display(), blocks = count, "view opened");

        Ok(View {
            file,
            path: path.as_ref().to_path_buf(),
            cipher: FrameCipher::new(GenericArray::from_slice(key)),
            count,
        })
    }

    /// Effective storage size in plaintext bytes (multiple of 4064).
    pub fn size(&self) -> u64 {
        self.count * BLOCK_SIZE as u64
    }

    /// Effective storage size in blocks.
    pub fn count(&self) -> u64 {
        self.count
    }

    fn aad(ident: u64, index: u64) -> [u8; 16] {
        let mut aad = [0u8; 16];
        aad[..8].copy_from_slice(Be64::from(ident).as_bytes());
        aad[8..].copy_from_slice(Be64::from(index).as_bytes());
        aad
    }

    /// Read and authenticate one block. `false` on out-of-range index,
    /// I/O failure, or failed verification.
    pub fn read_block(&mut self, index: u64, out: &mut [u8; BLOCK_SIZE], ident: u64) -> bool {
        if index >= self.count {
            return false;
        }

        let mut frame = [0u8; FRAME_SIZE];
        if self
            .file
            .seek(SeekFrom::Start(index * FRAME_SIZE as u64))
            .is_err()
            || self.file.read_exact(&mut frame).is_err()
        {
            return false;
        }

        let (nonce, rest) = frame.split_at(NONCE_SIZE);
        let (cipher_text, tag) = rest.split_at(BLOCK_SIZE);
        out.copy_from_slice(cipher_text);

        let ok = self
            .cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                &Self::aad(ident, index),
                out,
                GenericArray::from_slice(tag),
            )
            .is_ok();

        if !ok {
            out.zeroize();
        }

        ok
    }

    /// Encrypt and write one block with a fresh random nonce. Writing at
    /// `index == count` appends; anything past that is rejected.
    pub fn write_block(&mut self, index: u64, data: &[u8; BLOCK_SIZE], ident: u64) -> bool {
        if index > self.count {
            return false;
        }

        let mut frame = [0u8; FRAME_SIZE];
        OsRng.fill_bytes(&mut frame[..NONCE_SIZE]);
        frame[NONCE_SIZE..NONCE_SIZE + BLOCK_SIZE].copy_from_slice(data);

        let (nonce, rest) = frame.split_at_mut(NONCE_SIZE);
        let (cipher_text, tag_slot) = rest.split_at_mut(BLOCK_SIZE);

        let tag = match self.cipher.encrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            &Self::aad(ident, index),
            cipher_text,
        ) {
            Ok(tag) => tag,
            Err(_) => return false,
        };
        tag_slot.copy_from_slice(&tag);

        if self
            .file
            .seek(SeekFrom::Start(index * FRAME_SIZE as u64))
            .is_err()
            || self.file.write_all(&frame).is_err()
        {
            return false;
        }

        if index == self.count {
            self.count = index + 1;
        }

        true
    }

    /// Durable disk barrier.
    pub fn flush(&mut self) {
        let _ = self.file.sync_all();
    }

    /// Best-effort storage preallocation without changing the logical
    /// size; may do nothing. Sizes past 1 PiB are rejected.
    pub fn alloc(&mut self, future_size: u64) -> bool {
        let old = self.count * FRAME_SIZE as u64;
        let new = Self::real_size(future_size);

        if old >= new {
            return true;
        }

        future_size <= SIZE_LIMIT
    }

    /// Mark the container for deletion: the file is unlinked immediately
    /// and vanishes once the handle closes.
    pub fn set_delete(&mut self) -> bool {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;

            // Resolve through the open descriptor so a renamed file is
            // still the one removed
            let link = format!("/proc/self/fd/{}", self.file.as_raw_fd());
            match std::fs::read_link(link) {
                Ok(target) => std::fs::remove_file(target).is_ok(),
                Err(_) => std::fs::remove_file(&self.path).is_ok(),
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            std::fs::remove_file(&self.path).is_ok()
        }
    }

    /// File size in frames needed for `payload_size` plaintext bytes.
    fn real_size(payload_size: u64) -> u64 {
        let blocks =
            payload_size / BLOCK_SIZE as u64 + u64::from(payload_size % BLOCK_SIZE as u64 != 0);
        blocks * FRAME_SIZE as u64
    }

    /// Resize the container; returns the plaintext size actually reached.
    ///
    /// Shrinking truncates. Growing writes encrypted zero blocks one by
    /// one so that every frame of the container stays readable.
    pub fn trunc(&mut self, new_size: u64) -> u64 {
        let old_rs = self.count * FRAME_SIZE as u64;
        let new_rs = Self::real_size(new_size);

        if old_rs == new_rs || new_size > SIZE_LIMIT {
            return self.size();
        }

        if new_rs < old_rs {
            if self.file.set_len(new_rs).is_err() {
                return self.size();
            }
            self.count = new_rs / FRAME_SIZE as u64;
            return self.size();
        }

        let zeros = [0u8; BLOCK_SIZE];
        for index in old_rs / FRAME_SIZE as u64..new_rs / FRAME_SIZE as u64 {
            if !self.write_block(index, &zeros, 0) {
                return index * BLOCK_SIZE as u64;
            }
        }

        self.size()
    }

    /// Byte-granular read across blocks. Returns the number of bytes
    /// actually read; stops short at the first failing block.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> usize {
        let mut scratch = [0u8; BLOCK_SIZE];
        let mut done = 0;

        while done < buf.len() {
            let pos = offset + done as u64;
            let shift = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (buf.len() - done).min(BLOCK_SIZE - shift);

            if !self.read_block(pos / BLOCK_SIZE as u64, &mut scratch, 0) {
                break;
            }
            buf[done..done + chunk].copy_from_slice(&scratch[shift..shift + chunk]);
            done += chunk;
        }

        scratch.zeroize();
        done
    }

    /// Byte-granular write across blocks. Returns the number of bytes
    /// actually written.
    ///
    /// Writing past the current end first grows the container to the
    /// aligned predecessor of `offset`; that automatic growth is capped at
    /// 1 GiB per call. Partial blocks are read, patched and re-encrypted
    /// through a scratch buffer that is wiped afterwards.
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> usize {
        let mut fsize = self.size();
        let fneed = offset - offset % BLOCK_SIZE as u64;

        if fsize < fneed {
            // Offsets may be absurd; refuse to backfill more than 1 GiB
            if fneed - fsize > AUTO_GROW_LIMIT {
                return 0;
            }

            if self.trunc(fneed) != fneed {
                return 0;
            }

            fsize = fneed;
        }

        let mut scratch = [0u8; BLOCK_SIZE];
        let mut done = 0;

        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / BLOCK_SIZE as u64;
            let shift = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (buf.len() - done).min(BLOCK_SIZE - shift);

            let ok = if chunk == BLOCK_SIZE {
                let data: &[u8; BLOCK_SIZE] = buf[done..done + BLOCK_SIZE].try_into().unwrap();
                self.write_block(block, data, 0)
            } else {
                if pos >= fsize {
                    // Fresh block past the old end
                    scratch.fill(0);
                } else if !self.read_block(block, &mut scratch, 0) {
                    break;
                }
                scratch[shift..shift + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.write_block(block, &scratch, 0)
            };

            if !ok {
                break;
            }
            done += chunk;
        }

        scratch.zeroize();
        done
    }
}

/// List the entries of a directory: files by default, directories when
/// `directories` is set. Dot entries are skipped; errors yield an empty
/// list.
pub fn find_all(path: impl AsRef<Path>, directories: bool) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };

    let mut result = Vec::new();
    for entry in entries.flatten() {
        let Ok(kind) = entry.file_type() else {
            continue;
        };
        if kind.is_dir() != directories {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if directories && (name == "." || name == "..") {
            continue;
        }
        result.push(name);
    }

    result
}

impl Drop for View {
    fn drop(&mut self) {
        if self.count == 0 {
            // Empty storages are deleted automatically
            if self.set_delete() {
                return;
            }
        }

        // Discard any malformed tail beyond the last whole frame
        let _ = self.file.set_len(self.count * FRAME_SIZE as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn block_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.bin");
        let key = test_key();

        let mut view = View::open(&path, &key).unwrap();
        let mut data = [0u8; BLOCK_SIZE];
        data[0] = 0xAB;
        data[BLOCK_SIZE - 1] = 0xCD;

        assert!(view.write_block(0, &data, 0));
        assert_eq!(view.count(), 1);

        let mut out = [0u8; BLOCK_SIZE];
        assert!(view.read_block(0, &mut out, 0));
        assert_eq!(out[..], data[..]);
    }

    #[test]
    fn append_only_extension() {
        let dir = tempdir().unwrap();
        let key = test_key();
        let mut view = View::open(dir.path().join("v.bin"), &key).unwrap();
        let data = [7u8; BLOCK_SIZE];

        // Writing past the end is rejected
        assert!(!view.write_block(1, &data, 0));
        assert_eq!(view.count(), 0);

        assert!(view.write_block(0, &data, 0));
        assert!(view.write_block(1, &data, 0));
        assert_eq!(view.count(), 2);
    }

    #[test]
    fn wrong_index_or_ident_fails_verification() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.bin");
        let key = test_key();

        let mut view = View::open(&path, &key).unwrap();
        let data = [0x42u8; BLOCK_SIZE];
        assert!(view.write_block(0, &data, 0));
        assert!(view.write_block(1, &data, 0));

        // Swap the two frames on disk behind the view's back
        drop(view);
        let raw = std::fs::read(&path).unwrap();
        let mut swapped = raw[FRAME_SIZE..2 * FRAME_SIZE].to_vec();
        swapped.extend_from_slice(&raw[..FRAME_SIZE]);
        std::fs::write(&path, &swapped).unwrap();

        let mut view = View::open(&path, &key).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        assert!(!view.read_block(0, &mut out, 0));
        assert!(!view.read_block(1, &mut out, 0));

        // Wrong ident is also rejected
        let mut view2 = View::open(dir.path().join("w.bin"), &key).unwrap();
        assert!(view2.write_block(0, &data, 5));
        assert!(!view2.read_block(0, &mut out, 0));
        assert!(view2.read_block(0, &mut out, 5));
    }

    #[test]
    fn tampered_frame_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.bin");
        let key = test_key();

        let mut view = View::open(&path, &key).unwrap();
        assert!(view.write_block(0, &[1u8; BLOCK_SIZE], 0));
        drop(view);

        let mut raw = std::fs::read(&path).unwrap();
        raw[100] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let mut view = View::open(&path, &key).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        assert!(!view.read_block(0, &mut out, 0));
    }

    #[test]
    fn fresh_nonce_per_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.bin");
        let key = test_key();

        let mut view = View::open(&path, &key).unwrap();
        let data = [9u8; BLOCK_SIZE];
        assert!(view.write_block(0, &data, 0));
        view.flush();
        let first = std::fs::read(&path).unwrap();

        assert!(view.write_block(0, &data, 0));
        view.flush();
        let second = std::fs::read(&path).unwrap();

        assert_ne!(first[..NONCE_SIZE], second[..NONCE_SIZE]);
        assert_ne!(first[FRAME_SIZE - 16..], second[FRAME_SIZE - 16..]);
    }

    #[test]
    fn trunc_grow_writes_readable_zeros() {
        let dir = tempdir().unwrap();
        let key = test_key();
        let mut view = View::open(dir.path().join("v.bin"), &key).unwrap();

        let reached = view.trunc(3 * BLOCK_SIZE as u64);
        assert_eq!(reached, 3 * BLOCK_SIZE as u64);
        assert_eq!(view.count(), 3);

        let mut out = [1u8; BLOCK_SIZE];
        assert!(view.read_block(2, &mut out, 0));
        assert_eq!(out, [0u8; BLOCK_SIZE]);

        // Shrink back
        assert_eq!(view.trunc(BLOCK_SIZE as u64), BLOCK_SIZE as u64);
        assert_eq!(view.count(), 1);
        assert!(!view.read_block(1, &mut out, 0));
    }

    #[test]
    fn byte_granular_round_trip() {
        let dir = tempdir().unwrap();
        let key = test_key();
        let mut view = View::open(dir.path().join("v.bin"), &key).unwrap();

        // Crosses two block boundaries at an unaligned offset
        let payload: Vec<u8> = (0..9000).map(|i| (i % 251) as u8).collect();
        assert_eq!(view.write(100, &payload), payload.len());

        let mut out = vec![0u8; payload.len()];
        assert_eq!(view.read(100, &mut out), payload.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn write_past_eof_grows_aligned_gap() {
        let dir = tempdir().unwrap();
        let key = test_key();
        let mut view = View::open(dir.path().join("v.bin"), &key).unwrap();

        let offset = 2 * BLOCK_SIZE as u64 + 17;
        assert_eq!(view.write(offset, b"tail"), 4);
        assert_eq!(view.count(), 3);

        // The gap reads back as zeros
        let mut gap = vec![0xEEu8; BLOCK_SIZE];
        assert_eq!(view.read(0, &mut gap), BLOCK_SIZE);
        assert!(gap.iter().all(|&b| b == 0));

        let mut tail = [0u8; 4];
        assert_eq!(view.read(offset, &mut tail), 4);
        assert_eq!(&tail, b"tail");
    }

    #[test]
    fn empty_container_is_deleted_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.bin");
        let key = test_key();

        let view = View::open(&path, &key).unwrap();
        assert!(path.exists());
        drop(view);
        assert!(!path.exists());
    }

    #[test]
    fn malformed_tail_is_floored_and_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.bin");
        let key = test_key();

        let mut view = View::open(&path, &key).unwrap();
        assert!(view.write_block(0, &[3u8; BLOCK_SIZE], 0));
        drop(view);

        // Append garbage that is not a whole frame
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&[0u8; 100]);
        std::fs::write(&path, &raw).unwrap();

        let view = View::open(&path, &key).unwrap();
        assert_eq!(view.count(), 1);
        drop(view);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), FRAME_SIZE as u64);
    }

    #[test]
    fn find_all_separates_files_and_dirs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("one.bin"), b"x").unwrap();
        std::fs::write(dir.path().join("two.bin"), b"y").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut files = find_all(dir.path(), false);
        files.sort();
        assert_eq!(files, vec!["one.bin", "two.bin"]);

        assert_eq!(find_all(dir.path(), true), vec!["sub"]);
        assert!(find_all(dir.path().join("absent"), false).is_empty());
    }

    #[test]
    fn alloc_respects_cap() {
        let dir = tempdir().unwrap();
        let key = test_key();
        let mut view = View::open(dir.path().join("v.bin"), &key).unwrap();

        assert!(view.alloc(1024));
        assert!(!view.alloc(u64::MAX));
        assert_eq!(view.count(), 0);
    }
}
