//! Compact tagged serialization for stored records.
//!
//! A value is encoded as a stream of tagged elements; compound values are
//! nested documents closed by a terminator. The same traversal is driven in
//! three modes — read, probe (size-only dry run) and write — so the size
//! computed by a probe always equals the byte count produced by a write.
//!
//! Schema evolution rules:
//! - the relative order and types of fields must be preserved across
//!   versions;
//! - a removed field is replaced by a `null` placeholder;
//! - new fields are appended at the end, optionally behind a metadata name;
//!   older readers skip what they do not recognize, newer readers get
//!   default values for fields missing from old data.
//!
//! Grammar (one byte of tag, big-endian payloads):
//!
//! ```text
//! doc ::= val doc | 0x00 (terminator)
//! val ::= 0x01 doc            document
//!       | 0x02                false / zero / empty
//!       | 0x03                true
//!       | 0x04 u8             8-bit value
//!       | 0x05 u8 bytes       sized buffer (8-bit length)
//!       | 0x06 u32            32-bit value
//!       | 0x07 u32 bytes      sized buffer (32-bit length)
//!       | 0x08 u64            64-bit value
//!       | 0x09 u64 bytes      sized buffer (64-bit length)
//!       | 0x0A..0x1E          reserved (reader aborts)
//!       | 0x1F                null (skip placeholder)
//!       | 0x20..0xFF val      metadata name byte(s) before a value
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use crate::endian::{Be32, Be64};

const TERMINATOR: u8 = 0x00;
const DOCUMENT: u8 = 0x01;
const BIT_FALSE: u8 = 0x02;
const BIT_TRUE: u8 = 0x03;
const U8_VALUE: u8 = 0x04;
const U8_SIZED: u8 = 0x05;
const U32_VALUE: u8 = 0x06;
const U32_SIZED: u8 = 0x07;
const U64_VALUE: u8 = 0x08;
const U64_SIZED: u8 = 0x09;
const NULL_VALUE: u8 = 0x1F;

/// Maximum document nesting accepted by the reader.
pub const MAX_DEPTH: usize = 128;

/// Encoding family of a type, used to pick the container representation:
/// scalars pack into one sized buffer, complex elements become a document.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Scalar { width: usize },
    Complex,
}

/// A type that can travel through the codec.
///
/// `traverse` must visit the value identically in all three modes; in read
/// mode it replaces the value with the decoded one.
pub trait Wire: Default {
    const KIND: Kind = Kind::Complex;

    fn traverse(&mut self, ctx: &mut Context<'_>);

    /// Raw bits for packed container storage; meaningful only when `KIND`
    /// is `Scalar`.
    fn to_scalar(&self) -> u64 {
        0
    }

    /// Inverse of [`Wire::to_scalar`].
    fn from_scalar(_bits: u64) -> Self {
        Self::default()
    }
}

enum Mode<'a> {
    Read { data: &'a [u8], pos: usize },
    Probe { size: usize },
    Write { out: &'a mut Vec<u8> },
}

/// Traversal state for one encode/probe/decode pass.
pub struct Context<'a> {
    mode: Mode<'a>,
    depth: usize,
}

impl<'a> Context<'a> {
    pub fn is_reading(&self) -> bool {
        matches!(self.mode, Mode::Read { .. })
    }

    /// True while reading and the current document has more values.
    pub fn more(&self) -> bool {
        match &self.mode {
            Mode::Read { data, pos } => *pos < data.len() && data[*pos] != TERMINATOR,
            _ => false,
        }
    }

    fn remaining(&self) -> usize {
        match &self.mode {
            Mode::Read { data, pos } => data.len() - pos,
            _ => 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        match &self.mode {
            Mode::Read { data, pos } => data.get(*pos).copied(),
            _ => None,
        }
    }

    fn advance(&mut self, n: usize) {
        if let Mode::Read { data, pos } = &mut self.mode {
            *pos = (*pos + n).min(data.len());
        }
    }

    /// Abort reading: jump to end of input.
    fn abort(&mut self) {
        if let Mode::Read { data, pos } = &mut self.mode {
            *pos = data.len();
        }
    }

    /// Copy out `buf.len()` bytes, or abort on truncated input leaving
    /// `buf` untouched.
    fn read_into(&mut self, buf: &mut [u8]) -> bool {
        if let Mode::Read { data, pos } = &mut self.mode {
            if data.len() - *pos >= buf.len() {
                buf.copy_from_slice(&data[*pos..*pos + buf.len()]);
                *pos += buf.len();
                return true;
            }
            *pos = data.len();
        }
        false
    }

    /// Decode a size field for the given tag and validate it against the
    /// remaining input. Overflow aborts the read and yields 0.
    fn read_size(&mut self, tag: u8) -> usize {
        let size = match tag {
            U8_VALUE | U8_SIZED => {
                let mut b = [0u8; 1];
                if !self.read_into(&mut b) {
                    return 0;
                }
                b[0] as usize
            }
            U32_VALUE | U32_SIZED => {
                let mut b = [0u8; 4];
                if !self.read_into(&mut b) {
                    return 0;
                }
                Be32::from_bytes(b).get() as usize
            }
            U64_VALUE | U64_SIZED => {
                let mut b = [0u8; 8];
                if !self.read_into(&mut b) {
                    return 0;
                }
                Be64::from_bytes(b).get() as usize
            }
            _ => 0,
        };

        // A declared size that cannot fit in the remaining input means the
        // stream is truncated or corrupt; stop reading entirely.
        if self.remaining() < size {
            self.abort();
            return 0;
        }

        size
    }

    /// Skip the current document `level` times; with level 0, skip exactly
    /// one value. A terminator at cursor level is never consumed by
    /// `skip(0)`.
    fn skip(&mut self, mut level: usize) {
        loop {
            let Some(b) = self.peek() else { return };

            if level == 0 && b == TERMINATOR {
                return;
            }

            self.advance(1);

            match b {
                TERMINATOR => level -= 1,
                DOCUMENT => level += 1,
                BIT_FALSE | BIT_TRUE | NULL_VALUE => {}
                U8_VALUE => self.advance(1),
                U32_VALUE => self.advance(4),
                U64_VALUE => self.advance(8),
                U8_SIZED | U32_SIZED | U64_SIZED => {
                    let n = self.read_size(b);
                    self.advance(n);
                }
                0x0A..=0x1E => {
                    // Reserved tags abort the read
                    self.abort();
                    return;
                }
                _ => continue, // metadata byte, not a value
            }

            if level == 0 {
                return;
            }
        }
    }

    /// Skip every remaining value of the current document.
    fn drop_document(&mut self) {
        while let Some(b) = self.peek() {
            if b == TERMINATOR {
                return;
            }
            self.skip(0);
        }
    }

    fn put_u8(&mut self, byte: u8) {
        match &mut self.mode {
            Mode::Probe { size } => *size += 1,
            Mode::Write { out } => out.push(byte),
            Mode::Read { .. } => unreachable!("write primitive in read mode"),
        }
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        match &mut self.mode {
            Mode::Probe { size } => *size += bytes.len(),
            Mode::Write { out } => out.extend_from_slice(bytes),
            Mode::Read { .. } => unreachable!("write primitive in read mode"),
        }
    }

    fn sized_tag(n: usize) -> u8 {
        if n < 256 {
            U8_SIZED
        } else if n <= u32::MAX as usize {
            U32_SIZED
        } else {
            U64_SIZED
        }
    }

    fn value_tag(n: usize) -> u8 {
        if n < 256 {
            U8_VALUE
        } else if n <= u32::MAX as usize {
            U32_VALUE
        } else {
            U64_VALUE
        }
    }

    fn put_size(&mut self, n: usize) {
        if n < 256 {
            self.put_u8(n as u8);
        } else if n <= u32::MAX as usize {
            self.put_bytes(Be32::from(n as u32).as_bytes());
        } else {
            self.put_bytes(Be64::from(n as u64).as_bytes());
        }
    }

    /// Write a sized buffer; an empty buffer collapses to `false`.
    fn put_sized(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            self.put_u8(BIT_FALSE);
            return;
        }
        self.put_u8(Self::sized_tag(bytes.len()));
        self.put_size(bytes.len());
        self.put_bytes(bytes);
    }

    /// Traverse an element count hint (zero collapses to `false`).
    fn size_hint(&mut self, n: &mut usize) {
        if self.is_reading() {
            match self.peek() {
                None => {}
                Some(BIT_FALSE) => {
                    self.advance(1);
                    *n = 0;
                }
                Some(t @ (U8_VALUE | U32_VALUE | U64_VALUE)) => {
                    self.advance(1);
                    *n = self.read_size(t);
                }
                Some(NULL_VALUE) => self.advance(1),
                Some(_) => self.drop_document(),
            }
            return;
        }

        if *n == 0 {
            self.put_u8(BIT_FALSE);
        } else {
            self.put_u8(Self::value_tag(*n));
            self.put_size(*n);
        }
    }

    /// Traverse one nested document around `body`.
    ///
    /// Write/probe emit `document … terminator`; read accepts a document
    /// (skipping anything the body leaves unread), a `null`, or drops the
    /// rest of the enclosing document on any other tag.
    pub fn document(&mut self, body: impl FnOnce(&mut Self)) {
        if !self.is_reading() {
            self.put_u8(DOCUMENT);
            body(self);
            self.put_u8(TERMINATOR);
            return;
        }

        match self.peek() {
            None => {}
            Some(DOCUMENT) => {
                self.advance(1);
                self.depth += 1;
                if self.depth < MAX_DEPTH {
                    body(self);
                }
                self.skip(1);
                self.depth -= 1;
            }
            Some(NULL_VALUE) => self.advance(1),
            Some(_) => self.drop_document(),
        }
    }

    /// Traverse `count` null placeholders (deleted or moved fields).
    pub fn null(&mut self, count: usize) {
        for _ in 0..count {
            if self.is_reading() {
                self.skip(0);
            } else {
                self.put_u8(NULL_VALUE);
            }
        }
    }

    /// Traverse a fixed metadata name. Every byte must be in `0x20..=0xFF`.
    /// On read, a mismatching name drops the rest of the current document.
    pub fn name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        debug_assert!(bytes.iter().all(|&b| b > NULL_VALUE));

        if !self.is_reading() {
            self.put_bytes(bytes);
            return;
        }

        if let Mode::Read { data, pos } = &mut self.mode {
            if data.len() - *pos >= bytes.len() && &data[*pos..*pos + bytes.len()] == bytes {
                *pos += bytes.len();
                return;
            }
        }

        self.drop_document();
    }

    /// Scalar value traversal used by the integer/float implementations.
    fn scalar(&mut self, width: usize, bits: &mut u64, is_default: bool) {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8));

        if !self.is_reading() {
            if is_default {
                self.put_u8(BIT_FALSE);
            } else {
                match width {
                    1 => {
                        self.put_u8(U8_VALUE);
                        self.put_bytes(&[*bits as u8]);
                    }
                    4 => {
                        self.put_u8(U32_VALUE);
                        self.put_bytes(Be32::from(*bits as u32).as_bytes());
                    }
                    8 => {
                        self.put_u8(U64_VALUE);
                        self.put_bytes(Be64::from(*bits).as_bytes());
                    }
                    _ => {
                        // Odd widths travel as a sized buffer
                        self.put_sized(&bits.to_be_bytes()[8 - width..]);
                    }
                }
            }
            return;
        }

        let expected = match width {
            1 => U8_VALUE,
            4 => U32_VALUE,
            8 => U64_VALUE,
            _ => U8_SIZED,
        };

        match self.peek() {
            None => {}
            Some(BIT_FALSE) => {
                self.advance(1);
                *bits = 0;
            }
            Some(t) if t == expected => {
                self.advance(1);
                if expected == U8_SIZED {
                    let size = self.read_size(t);
                    if size == width {
                        let mut buf = [0u8; 8];
                        if self.read_into(&mut buf[8 - width..]) {
                            *bits = u64::from_be_bytes(buf);
                        }
                    } else {
                        self.advance(size);
                        self.drop_document();
                    }
                } else {
                    let mut buf = [0u8; 8];
                    if self.read_into(&mut buf[8 - width..]) {
                        *bits = u64::from_be_bytes(buf);
                    }
                }
            }
            Some(NULL_VALUE) => self.advance(1),
            Some(_) => self.drop_document(),
        }
    }

    /// Byte-identical "copy" value: a sized buffer of fixed length, with
    /// the all-zero value collapsing to `false`.
    pub fn copy_bytes(&mut self, bytes: &mut [u8]) {
        if !self.is_reading() {
            if bytes.iter().all(|&b| b == 0) {
                self.put_u8(BIT_FALSE);
            } else {
                self.put_sized(bytes);
            }
            return;
        }

        match self.peek() {
            None => {}
            Some(BIT_FALSE) => {
                self.advance(1);
                bytes.fill(0);
            }
            Some(t @ (U8_SIZED | U32_SIZED | U64_SIZED)) => {
                self.advance(1);
                let size = self.read_size(t);
                if size == bytes.len() {
                    self.read_into(bytes);
                } else {
                    self.advance(size);
                    self.drop_document();
                }
            }
            Some(NULL_VALUE) => self.advance(1),
            Some(_) => self.drop_document(),
        }
    }
}

macro_rules! wire_int {
    ($($t:ty => $width:expr),* $(,)?) => {$(
        impl Wire for $t {
            const KIND: Kind = Kind::Scalar { width: $width };

            fn traverse(&mut self, ctx: &mut Context<'_>) {
                let mut bits = self.to_scalar();
                let zero = *self == <$t>::default();
                ctx.scalar($width, &mut bits, zero);
                if ctx.is_reading() {
                    *self = Self::from_scalar(bits);
                }
            }

            fn to_scalar(&self) -> u64 {
                *self as u64
            }

            fn from_scalar(bits: u64) -> Self {
                bits as $t
            }
        }
    )*};
}

wire_int! {
    u8 => 1, i8 => 1,
    u16 => 2, i16 => 2,
    u32 => 4, i32 => 4,
    u64 => 8, i64 => 8,
}

macro_rules! wire_float {
    ($($t:ty => ($width:expr, $bits:ty)),* $(,)?) => {$(
        impl Wire for $t {
            const KIND: Kind = Kind::Scalar { width: $width };

            fn traverse(&mut self, ctx: &mut Context<'_>) {
                let mut bits = self.to_scalar();
                let zero = *self == <$t>::default();
                ctx.scalar($width, &mut bits, zero);
                if ctx.is_reading() {
                    *self = Self::from_scalar(bits);
                }
            }

            fn to_scalar(&self) -> u64 {
                self.to_bits() as u64
            }

            fn from_scalar(bits: u64) -> Self {
                Self::from_bits(bits as $bits)
            }
        }
    )*};
}

wire_float! {
    f32 => (4, u32),
    f64 => (8, u64),
}

impl Wire for bool {
    fn traverse(&mut self, ctx: &mut Context<'_>) {
        if !ctx.is_reading() {
            ctx.put_u8(if *self { BIT_TRUE } else { BIT_FALSE });
            return;
        }

        match ctx.peek() {
            None => {}
            Some(t @ (BIT_FALSE | BIT_TRUE)) => {
                ctx.advance(1);
                *self = t == BIT_TRUE;
            }
            Some(NULL_VALUE) => ctx.advance(1),
            Some(_) => ctx.drop_document(),
        }
    }
}

impl Wire for String {
    fn traverse(&mut self, ctx: &mut Context<'_>) {
        if !ctx.is_reading() {
            ctx.put_sized(self.as_bytes());
            return;
        }

        match ctx.peek() {
            None => {}
            Some(BIT_FALSE) => {
                ctx.advance(1);
                self.clear();
            }
            Some(t @ (U8_SIZED | U32_SIZED | U64_SIZED)) => {
                ctx.advance(1);
                let size = ctx.read_size(t);
                let mut bytes = vec![0u8; size];
                ctx.read_into(&mut bytes);
                *self = String::from_utf8_lossy(&bytes).into_owned();
            }
            Some(NULL_VALUE) => ctx.advance(1),
            Some(_) => ctx.drop_document(),
        }
    }
}

/// Fixed byte arrays are byte-identical copy types. Sizes are enumerated
/// because the `Default` supertrait only exists for arrays up to 32.
macro_rules! wire_bytes {
    ($($n:literal),+) => {$(
        impl Wire for [u8; $n] {
            fn traverse(&mut self, ctx: &mut Context<'_>) {
                ctx.copy_bytes(self);
            }
        }
    )+};
}

wire_bytes!(4, 8, 12, 16, 20, 24, 28, 32);

impl<T: Wire> Wire for Vec<T> {
    fn traverse(&mut self, ctx: &mut Context<'_>) {
        if let Kind::Scalar { width } = T::KIND {
            traverse_scalar_seq(ctx, self, width);
        } else {
            traverse_complex_seq(ctx, self);
        }
    }
}

/// Packed sequence of scalars: one sized buffer of big-endian elements.
fn traverse_scalar_seq<T: Wire>(ctx: &mut Context<'_>, seq: &mut Vec<T>, width: usize) {
    if !ctx.is_reading() {
        if seq.is_empty() {
            ctx.put_u8(BIT_FALSE);
            return;
        }
        let total = seq.len() * width;
        ctx.put_u8(Context::sized_tag(total));
        ctx.put_size(total);
        for item in seq.iter() {
            let bytes = item.to_scalar().to_be_bytes();
            ctx.put_bytes(&bytes[8 - width..]);
        }
        return;
    }

    match ctx.peek() {
        None => {}
        Some(BIT_FALSE) => {
            ctx.advance(1);
            seq.clear();
        }
        Some(t @ (U8_SIZED | U32_SIZED | U64_SIZED)) => {
            ctx.advance(1);
            let total = ctx.read_size(t);
            seq.clear();
            seq.reserve(total / width);
            for _ in 0..total / width {
                let mut buf = [0u8; 8];
                if !ctx.read_into(&mut buf[8 - width..]) {
                    break;
                }
                seq.push(T::from_scalar(u64::from_be_bytes(buf)));
            }
            // Drop a ragged tail that is not a whole element
            ctx.advance(total % width);
        }
        Some(NULL_VALUE) => ctx.advance(1),
        Some(_) => ctx.drop_document(),
    }
}

/// Sequence of complex elements: a document holding a count hint and the
/// elements; an empty sequence collapses to `false`.
fn traverse_complex_seq<T: Wire>(ctx: &mut Context<'_>, seq: &mut Vec<T>) {
    if !ctx.is_reading() {
        if seq.is_empty() {
            ctx.put_u8(BIT_FALSE);
            return;
        }
        let mut hint = seq.len();
        ctx.document(|ctx| {
            ctx.size_hint(&mut hint);
            for item in seq.iter_mut() {
                item.traverse(ctx);
            }
        });
        return;
    }

    match ctx.peek() {
        None => {}
        Some(BIT_FALSE) => {
            ctx.advance(1);
            seq.clear();
        }
        Some(DOCUMENT) => {
            seq.clear();
            ctx.document(|ctx| {
                let mut hint = 0usize;
                ctx.size_hint(&mut hint);
                seq.reserve(hint.min(4096));
                while ctx.more() {
                    let mut item = T::default();
                    item.traverse(ctx);
                    seq.push(item);
                }
            });
        }
        Some(NULL_VALUE) => ctx.advance(1),
        Some(_) => ctx.drop_document(),
    }
}

macro_rules! wire_map {
    ($map:ident, $($bound:path),+) => {
        impl<K: Wire + $($bound+)+, V: Wire> Wire for $map<K, V> {
            fn traverse(&mut self, ctx: &mut Context<'_>) {
                if !ctx.is_reading() {
                    if self.is_empty() {
                        ctx.put_u8(BIT_FALSE);
                        return;
                    }
                    let mut hint = self.len();
                    ctx.document(|ctx| {
                        ctx.size_hint(&mut hint);
                        for (key, value) in self.iter_mut() {
                            let mut key = key.clone();
                            key.traverse(ctx);
                            value.traverse(ctx);
                        }
                    });
                    return;
                }

                match ctx.peek() {
                    None => {}
                    Some(BIT_FALSE) => {
                        ctx.advance(1);
                        self.clear();
                    }
                    Some(DOCUMENT) => {
                        self.clear();
                        ctx.document(|ctx| {
                            let mut hint = 0usize;
                            ctx.size_hint(&mut hint);
                            while ctx.more() {
                                let mut key = K::default();
                                key.traverse(ctx);
                                let mut value = V::default();
                                value.traverse(ctx);
                                self.insert(key, value);
                            }
                        });
                    }
                    Some(NULL_VALUE) => ctx.advance(1),
                    Some(_) => ctx.drop_document(),
                }
            }
        }
    };
}

wire_map!(HashMap, Clone, Eq, Hash);
wire_map!(BTreeMap, Clone, Ord);

macro_rules! wire_set {
    ($set:ident, $($bound:path),+) => {
        impl<K: Wire + $($bound+)+> Wire for $set<K> {
            fn traverse(&mut self, ctx: &mut Context<'_>) {
                if !ctx.is_reading() {
                    if self.is_empty() {
                        ctx.put_u8(BIT_FALSE);
                        return;
                    }
                    let mut hint = self.len();
                    ctx.document(|ctx| {
                        ctx.size_hint(&mut hint);
                        for key in self.iter() {
                            key.clone().traverse(ctx);
                        }
                    });
                    return;
                }

                match ctx.peek() {
                    None => {}
                    Some(BIT_FALSE) => {
                        ctx.advance(1);
                        self.clear();
                    }
                    Some(DOCUMENT) => {
                        self.clear();
                        ctx.document(|ctx| {
                            let mut hint = 0usize;
                            ctx.size_hint(&mut hint);
                            while ctx.more() {
                                let mut key = K::default();
                                key.traverse(ctx);
                                self.insert(key);
                            }
                        });
                    }
                    Some(NULL_VALUE) => ctx.advance(1),
                    Some(_) => ctx.drop_document(),
                }
            }
        }
    };
}

wire_set!(HashSet, Clone, Eq, Hash);
wire_set!(BTreeSet, Clone, Ord);

/// Owning references carry state the codec cannot rebuild; they travel as
/// a `null` placeholder and the owner restores them separately.
impl<T: Wire> Wire for Box<T> {
    fn traverse(&mut self, ctx: &mut Context<'_>) {
        ctx.null(1);
    }
}

/// Compute the encoded size of a traversal without producing bytes.
pub fn probe(body: impl FnOnce(&mut Context<'_>)) -> usize {
    let mut ctx = Context {
        mode: Mode::Probe { size: 0 },
        depth: 0,
    };
    body(&mut ctx);
    match ctx.mode {
        Mode::Probe { size } => size,
        _ => unreachable!(),
    }
}

/// Serialize a traversal: probe for the exact size, then write.
pub fn encode(mut body: impl FnMut(&mut Context<'_>)) -> Vec<u8> {
    let size = probe(&mut body);
    let mut out = Vec::with_capacity(size);
    let mut ctx = Context {
        mode: Mode::Write { out: &mut out },
        depth: 0,
    };
    body(&mut ctx);
    debug_assert_eq!(out.len(), size);
    out
}

/// Deserialize a traversal from `data`; returns the number of bytes
/// consumed.
pub fn decode(data: &[u8], body: impl FnOnce(&mut Context<'_>)) -> usize {
    let mut ctx = Context {
        mode: Mode::Read { data, pos: 0 },
        depth: 0,
    };
    body(&mut ctx);
    match ctx.mode {
        Mode::Read { pos, .. } => pos,
        _ => unreachable!(),
    }
}

/// Serialize a single value.
pub fn to_bytes<T: Wire + Clone>(value: &T) -> Vec<u8> {
    let mut tmp = value.clone();
    encode(|ctx| tmp.traverse(ctx))
}

/// Deserialize a single value, defaulting anything missing.
pub fn from_bytes<T: Wire>(data: &[u8]) -> T {
    let mut value = T::default();
    decode(data, |ctx| value.traverse(ctx));
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Sample {
        id: u64,
        label: String,
        flags: Vec<u32>,
        active: bool,
    }

    impl Wire for Sample {
        fn traverse(&mut self, ctx: &mut Context<'_>) {
            ctx.document(|ctx| {
                self.id.traverse(ctx);
                self.label.traverse(ctx);
                self.flags.traverse(ctx);
                self.active.traverse(ctx);
            });
        }
    }

    /// Same schema with the label removed and a new trailing field.
    #[derive(Clone, Debug, Default, PartialEq)]
    struct SampleV2 {
        id: u64,
        flags: Vec<u32>,
        active: bool,
        weight: u32,
    }

    impl Wire for SampleV2 {
        fn traverse(&mut self, ctx: &mut Context<'_>) {
            ctx.document(|ctx| {
                self.id.traverse(ctx);
                ctx.null(1); // label removed
                self.flags.traverse(ctx);
                self.active.traverse(ctx);
                ctx.name("W");
                self.weight.traverse(ctx);
            });
        }
    }

    #[test]
    fn scalar_round_trip() {
        for v in [0u64, 1, 255, 256, u32::MAX as u64, u64::MAX] {
            assert_eq!(from_bytes::<u64>(&to_bytes(&v)), v);
        }
        assert_eq!(from_bytes::<i32>(&to_bytes(&-5i32)), -5);
        assert_eq!(from_bytes::<u16>(&to_bytes(&513u16)), 513);
        assert_eq!(from_bytes::<bool>(&to_bytes(&true)), true);
        assert_eq!(from_bytes::<f64>(&to_bytes(&2.5f64)), 2.5);
    }

    #[test]
    fn zero_value_is_one_byte() {
        assert_eq!(to_bytes(&0u64), vec![BIT_FALSE]);
        assert_eq!(to_bytes(&String::new()), vec![BIT_FALSE]);
        assert_eq!(to_bytes(&Vec::<u32>::new()), vec![BIT_FALSE]);
    }

    #[test]
    fn struct_round_trip() {
        let sample = Sample {
            id: 42,
            label: "alpha".into(),
            flags: vec![1, 2, 3],
            active: true,
        };
        let bytes = to_bytes(&sample);
        assert_eq!(from_bytes::<Sample>(&bytes), sample);
    }

    #[test]
    fn probe_equals_write() {
        let sample = Sample {
            id: 7,
            label: "probe".into(),
            flags: vec![9; 300],
            active: false,
        };
        let mut tmp = sample.clone();
        let probed = probe(|ctx| tmp.traverse(ctx));
        assert_eq!(probed, to_bytes(&sample).len());
    }

    #[test]
    fn string_round_trip() {
        let text = String::from("hello, мир");
        assert_eq!(from_bytes::<String>(&to_bytes(&text)), text);
    }

    #[test]
    fn byte_vec_round_trip() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(from_bytes::<Vec<u8>>(&to_bytes(&data)), data);
    }

    #[test]
    fn copy_array_round_trip() {
        let mut key = [0u8; 32];
        key[0] = 0xFF;
        key[31] = 1;
        assert_eq!(from_bytes::<[u8; 32]>(&to_bytes(&key)), key);
        // All-zero collapses to one byte
        assert_eq!(to_bytes(&[0u8; 32]), vec![BIT_FALSE]);
    }

    #[test]
    fn map_and_set_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        map.insert("b".to_string(), 0u32);
        assert_eq!(from_bytes::<BTreeMap<String, u32>>(&to_bytes(&map)), map);

        let set: HashSet<u64> = [3, 5, 8].into_iter().collect();
        assert_eq!(from_bytes::<HashSet<u64>>(&to_bytes(&set)), set);
    }

    #[test]
    fn nested_vec_round_trip() {
        let nested = vec![vec![1u8, 2], vec![], vec![3]];
        assert_eq!(from_bytes::<Vec<Vec<u8>>>(&to_bytes(&nested)), nested);
    }

    #[test]
    fn old_reader_skips_new_field() {
        let v2 = SampleV2 {
            id: 9,
            flags: vec![4],
            active: true,
            weight: 70,
        };
        let bytes = to_bytes(&v2);

        // The V1 reader consumes id, reads the null into label (skip),
        // then flags/active, and drops the unknown named tail.
        let old = from_bytes::<Sample>(&bytes);
        assert_eq!(old.id, 9);
        assert_eq!(old.label, "");
        assert_eq!(old.flags, vec![4]);
        assert!(old.active);
    }

    #[test]
    fn new_reader_defaults_missing_field() {
        let v1 = Sample {
            id: 3,
            label: "gone".into(),
            flags: vec![],
            active: false,
        };
        let bytes = to_bytes(&v1);

        // The V2 reader nulls out the old label slot and finds no named
        // weight field: it stays at its default.
        let new = from_bytes::<SampleV2>(&bytes);
        assert_eq!(new.id, 3);
        assert_eq!(new.weight, 0);
    }

    #[test]
    fn truncated_input_yields_defaults() {
        let sample = Sample {
            id: u64::MAX,
            label: "x".into(),
            flags: vec![1],
            active: true,
        };
        let bytes = to_bytes(&sample);
        let cut = &bytes[..bytes.len() / 2];
        // Must not panic; whatever could not be read stays default.
        let _ = from_bytes::<Sample>(cut);
    }

    #[test]
    fn reserved_tag_aborts() {
        let bytes = vec![DOCUMENT, 0x0A, 0xDE, 0xAD, TERMINATOR];
        let consumed = decode(&bytes, |ctx| {
            let mut v = Sample::default();
            v.traverse(ctx);
        });
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn recursion_depth_is_bounded() {
        let mut bytes = vec![DOCUMENT; MAX_DEPTH * 2];
        bytes.extend(std::iter::repeat(TERMINATOR).take(MAX_DEPTH * 2));
        let _ = from_bytes::<Vec<Vec<u8>>>(&bytes);
    }

    #[test]
    fn boxed_value_is_null() {
        let boxed: Box<u32> = Box::new(55);
        assert_eq!(to_bytes(&boxed), vec![NULL_VALUE]);
        assert_eq!(*from_bytes::<Box<u32>>(&[NULL_VALUE]), 0);
    }
}
