//! Master key derivation and storage.
//!
//! A master key is a 128-byte secret, either derived from a password with
//! a memory-hard KDF or loaded from a key file. Named subkeys come out of
//! HMAC-SHA-512 keyed by the secret, so any number of purpose-specific
//! keys (view keys, identity seeds) can be recreated from the one secret
//! and a label.
//!
//! The KDF salt is fixed. A fixed salt is usually insecure, but here it is
//! what makes derivation stateless: the same password always reaches the
//! same secret with no side file to keep.
//!
//! Not thread-safe; use one instance per thread or guard externally.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use zeroize::{Zeroize, Zeroizing};

use crate::gui::Gui;

/// Size of the primary secret and of the key file.
pub const SECRET_SIZE: usize = 128;

/// Derived subkey size (HMAC-SHA-512 output).
pub const DERIVED_SIZE: usize = 64;

/// scrypt cost: N = 2^19, r = 8, p = 1 — about 512 MiB of working memory
/// and one to two seconds of single-core load on a typical desktop CPU.
const SCRYPT_LOG_N: u8 = 19;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_MEMORY: usize = 128 * (1 << SCRYPT_LOG_N) * SCRYPT_R as usize;

const STATIC_SALT: [u8; 64] = [
    0x06, 0xCA, 0x7E, 0xA7, 0x42, 0x01, 0x65, 0xBB, 0xC1, 0xEF, 0xBB, 0x02, 0x21, 0x5B, 0x90,
    0xCF, 0x2F, 0x45, 0x53, 0x90, 0x75, 0x2D, 0x1C, 0x21, 0x6F, 0x72, 0x36, 0xF4, 0xD4, 0x12,
    0xE7, 0xFA, 0x4A, 0xDB, 0xB1, 0x52, 0x2B, 0x6C, 0xCE, 0xB5, 0x55, 0xF6, 0xA4, 0x41, 0x02,
    0xFA, 0x42, 0x0C, 0x15, 0xB0, 0xAF, 0x6C, 0x35, 0x16, 0x53, 0x0A, 0xA8, 0x9B, 0x43, 0xFA,
    0x86, 0xC5, 0xAA, 0xBE,
];

struct Dictionary {
    words: &'static [&'static str],
    name: &'static str,
    delim: Option<char>,
}

// Characters removed: 'l', 'B', 'D', 'I', 'O'
static DICT_LATIN: &[&str] = &[
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "a", "b", "c", "d", "e", "f", "g", "h", "i",
    "j", "k", "m", "n", "o", "p", "q", "r", "s", "t", "u", "v", "w", "x", "y", "z", "A", "C", "E",
    "F", "G", "H", "J", "K", "L", "M", "N", "P", "Q", "R", "S", "T", "U", "V", "W", "X", "Y", "Z",
];

static DICT_PIN: &[&str] = &["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

// Characters removed: 'б', 'ё', 'л', 'ъ', 'ь', 'В', 'Ё', 'З', 'Л', 'О', 'Ъ', 'Ь'
static DICT_CYRILLIC: &[&str] = &[
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "а", "в", "г", "д", "е", "ж", "з", "и", "й",
    "к", "м", "н", "о", "п", "р", "с", "т", "у", "ф", "х", "ц", "ч", "ш", "щ", "ы", "э", "ю", "я",
    "А", "Б", "Г", "Д", "Е", "Ж", "И", "Й", "К", "М", "Н", "П", "Р", "С", "Т", "У", "Ф", "Х", "Ц",
    "Ч", "Ш", "Щ", "Ы", "Э", "Ю", "Я",
];

static DICTS: &[Dictionary] = &[
    Dictionary {
        words: DICT_LATIN,
        name: "Latin",
        delim: None,
    },
    Dictionary {
        words: DICT_PIN,
        name: "PIN",
        delim: None,
    },
    Dictionary {
        words: DICT_CYRILLIC,
        name: "Cyrillic",
        delim: None,
    },
];

/// Master key service.
pub struct MasterKey {
    /// HMAC-SHA-512 keyed by the secret; `None` until initialized.
    mac: Option<Hmac<Sha512>>,

    /// Path to the key file.
    key_path: PathBuf,

    /// Key file kept open for the lifetime of the key to deter tampering.
    key_file: Option<File>,

    /// Captured password, if the key came from one.
    pass: Option<Zeroizing<String>>,

    /// Key file contents / scrypt output.
    secret: Zeroizing<[u8; SECRET_SIZE]>,
}

impl MasterKey {
    /// Total number of password dictionaries.
    pub fn dict_count() -> usize {
        DICTS.len()
    }

    /// Dictionary name plus an example password with at least 64 bits of
    /// entropy, for display.
    pub fn dict_name(dict_id: usize) -> String {
        let Some(dict) = DICTS.get(dict_id) else {
            return String::new();
        };

        let strength = Self::dict_strength(dict_id) as usize;
        let count = 6400 / strength + usize::from(6400 % strength != 0);

        let mut result = format!("{}, ex.: ", dict.name);
        for _ in 0..count {
            let roll = OsRng.next_u32() as usize % dict.words.len();
            result.push_str(dict.words[roll]);
        }

        result
    }

    /// Bit strength of one dictionary element, times 100, rounded towards
    /// zero.
    pub fn dict_strength(dict_id: usize) -> i32 {
        match DICTS.get(dict_id) {
            Some(dict) => ((dict.words.len() as f64).log2() * 100.0).trunc() as i32,
            None => 0,
        }
    }

    /// Key service bound to a key file path; not yet initialized.
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        MasterKey {
            mac: None,
            key_path: key_path.into(),
            key_file: None,
            pass: None,
            secret: Zeroizing::new([0u8; SECRET_SIZE]),
        }
    }

    /// Key service initialized from raw secret bytes.
    pub fn from_secret(secret: &[u8], gui: &dyn Gui) -> Self {
        let mut key = Self::new(PathBuf::new());
        key.init_from_secret(secret, gui);
        key
    }

    /// Wipe all secret material and release the key file handle.
    pub fn reset(&mut self) {
        self.pass = None; // Zeroizing wipes on drop
        self.secret.zeroize();
        self.mac = None;
        self.key_file = None;
    }

    /// An empty secret or a MAC that cannot be keyed is an invariant
    /// violation; the process does not continue.
    fn keyed_mac(secret: &[u8], gui: &dyn Gui) -> Hmac<Sha512> {
        if secret.is_empty() {
            gui.fatal("HMAC init failed");
        }

        match Hmac::<Sha512>::new_from_slice(secret) {
            Ok(mac) => mac,
            Err(_) => gui.fatal("HMAC init failed"),
        }
    }

    /// Key the HMAC directly from secret bytes.
    pub fn init_from_secret(&mut self, secret: &[u8], gui: &dyn Gui) {
        self.mac = Some(Self::keyed_mac(secret, gui));
    }

    /// Derive the secret from a password with scrypt and capture the
    /// password.
    ///
    /// The derivation needs about 512 MiB of working memory; when that
    /// much cannot be reserved the user may retry via `gui.warn`, and
    /// declining aborts the process.
    pub fn init_from_password(&mut self, pass: &str, gui: &dyn Gui) {
        self.reset();

        loop {
            let mut reserve: Vec<u8> = Vec::new();
            if reserve.try_reserve_exact(SCRYPT_MEMORY).is_ok() {
                drop(reserve);
                break;
            }

            if !gui.warn("Out of memory. This operation requires 512 MiB of free memory.") {
                std::process::abort();
            }
        }

        let params = scrypt::Params::new(
            SCRYPT_LOG_N,
            SCRYPT_R,
            SCRYPT_P,
            scrypt::Params::RECOMMENDED_LEN,
        )
        .unwrap_or_else(|_| gui.fatal("Key derivation failed"));

        if scrypt::scrypt(pass.as_bytes(), &STATIC_SALT, &params, &mut *self.secret).is_err() {
            gui.fatal("Key derivation failed");
        }

        self.mac = Some(Self::keyed_mac(&*self.secret, gui));
        self.set_pass(pass);
    }

    /// Derive a named 64-byte subkey: HMAC-SHA-512 of `info` under the
    /// master secret. `None` until the key is initialized.
    pub fn derive(&self, info: &[u8]) -> Option<[u8; DERIVED_SIZE]> {
        let mac = self.mac.as_ref()?;
        let digest = mac.clone().chain_update(info).finalize().into_bytes();
        let mut out = [0u8; DERIVED_SIZE];
        out.copy_from_slice(&digest);
        Some(out)
    }

    /// Build a password from `count` random dictionary draws appended to
    /// `prefix`, then initialize from it.
    pub fn generate(&mut self, prefix: &str, dict_id: usize, count: usize, gui: &dyn Gui) {
        let dict = &DICTS[dict_id];

        let mut pass = Zeroizing::new(String::with_capacity(prefix.len() + count * 17));
        pass.push_str(prefix);

        for i in 0..count {
            if let Some(delim) = dict.delim {
                if i > 0 {
                    pass.push(delim);
                }
            }

            let roll = OsRng.next_u32() as usize % dict.words.len();
            pass.push_str(dict.words[roll]);
        }

        self.init_from_password(&pass, gui);
    }

    /// Load the secret from the key file. The file must hold exactly 128
    /// bytes and stays open until `reset`.
    pub fn load(&mut self, gui: &dyn Gui) -> bool {
        self.reset();

        let mut options = OpenOptions::new();
        options.read(true);

        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;
            const FILE_ATTRIBUTE_ENCRYPTED: u32 = 0x4000;
            options.attributes(FILE_ATTRIBUTE_ENCRYPTED);
        }

        let Ok(mut file) = options.open(&self.key_path) else {
            return false;
        };

        // The file must hold exactly SECRET_SIZE bytes
        if file.read_exact(&mut *self.secret).is_err()
            || file.read(&mut [0u8; 1]).map_or(true, |extra| extra != 0)
        {
            self.reset();
            return false;
        }

        self.mac = Some(Self::keyed_mac(&*self.secret, gui));
        self.key_file = Some(file);
        true
    }

    /// Write the secret to a new key file; the file must not already
    /// exist. Failure to create it is unrecoverable.
    pub fn save(&mut self, gui: &dyn Gui) {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;
            const FILE_ATTRIBUTE_ENCRYPTED: u32 = 0x4000;
            options.attributes(FILE_ATTRIBUTE_ENCRYPTED);
        }

        let written = options
            .open(&self.key_path)
            .and_then(|mut file| file.write_all(&*self.secret).map(|_| file));

        match written {
            Ok(file) => self.key_file = Some(file),
            Err(_) => gui.fatal("Failed to create key file. Check permissions and try again."),
        }
    }

    /// Replace the captured password.
    pub fn set_pass(&mut self, pass: &str) {
        self.pass = Some(Zeroizing::new(pass.to_owned()));
    }

    /// The captured password, if any.
    pub fn password(&self) -> Option<&str> {
        self.pass.as_deref().map(String::as_str)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.reset();
    }
}
