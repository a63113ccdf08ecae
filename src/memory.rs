//! Byte storage shared between brokers, channels and GAMs.
//!
//! A [`ByteBlock`] is a fixed-size run of atomic bytes. Threads may copy into
//! and out of it concurrently without locks or allocation; which thread may
//! touch which buffer is decided by the double-buffer discipline, not here.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use std::sync::atomic::{fence, AtomicU8, Ordering};

/// Fixed-size, lock-free byte storage.
#[derive(Debug)]
pub struct ByteBlock {
    bytes: Box<[AtomicU8]>,
}

impl ByteBlock {
    /// Allocate a zeroed block.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Allocate a block holding a copy of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            bytes: data.iter().map(|b| AtomicU8::new(*b)).collect(),
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-sized block.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// Panics when the range is out of bounds.
    #[inline]
    pub fn load(&self, offset: usize, dst: &mut [u8]) {
        fence(Ordering::Acquire);
        let len = dst.len();
        for (d, s) in dst.iter_mut().zip(&self.bytes[offset..offset + len]) {
            *d = s.load(Ordering::Relaxed);
        }
    }

    /// Copy `src` into the block starting at `offset`.
    ///
    /// Panics when the range is out of bounds.
    #[inline]
    pub fn store(&self, offset: usize, src: &[u8]) {
        for (d, s) in self.bytes[offset..offset + src.len()].iter().zip(src) {
            d.store(*s, Ordering::Relaxed);
        }
        fence(Ordering::Release);
    }

    /// Copy `len` bytes from `src[src_offset..]` to `self[dst_offset..]`.
    ///
    /// Panics when either range is out of bounds.
    #[inline]
    pub fn copy_from(&self, dst_offset: usize, src: &ByteBlock, src_offset: usize, len: usize) {
        fence(Ordering::Acquire);
        let dst = &self.bytes[dst_offset..dst_offset + len];
        let src = &src.bytes[src_offset..src_offset + len];
        for (d, s) in dst.iter().zip(src) {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        fence(Ordering::Release);
    }

    /// Overwrite the whole block with `data`, which must have the same length.
    pub fn fill_from(&self, data: &[u8]) {
        self.store(0, &data[..self.len().min(data.len())]);
    }

    /// Snapshot of the whole block.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        self.load(0, &mut out);
        out
    }

    /// View of `len` bytes starting at `offset`.
    pub fn view(&self, offset: usize, len: usize) -> Option<SignalView<'_>> {
        (offset.checked_add(len)? <= self.len()).then_some(SignalView {
            block: self,
            offset,
            len,
        })
    }
}

/// Fixed-size primitive values that can be stored in a [`ByteBlock`].
pub trait Scalar: Copy {
    /// Size in bytes.
    const SIZE: usize;
    /// Write the native-endian bytes of `self` into `out[..SIZE]`.
    fn write_ne(self, out: &mut [u8]);
    /// Read a value from `bytes[..SIZE]`.
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn write_ne(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
                }

                #[inline]
                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Scalar for bool {
    const SIZE: usize = 1;

    #[inline]
    fn write_ne(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    #[inline]
    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// A window onto part of a [`ByteBlock`]: one signal, or one structure member.
#[derive(Debug, Clone, Copy)]
pub struct SignalView<'a> {
    block: &'a ByteBlock,
    offset: usize,
    len: usize,
}

impl<'a> SignalView<'a> {
    /// Size of the window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty window.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the window inside its block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Element `index` of type `T`, or `None` past the end.
    #[inline]
    pub fn get<T: Scalar>(&self, index: usize) -> Option<T> {
        let at = index.checked_mul(T::SIZE)?;
        if at + T::SIZE > self.len {
            return None;
        }
        let mut raw = [0u8; 8];
        self.block.load(self.offset + at, &mut raw[..T::SIZE]);
        Some(T::read_ne(&raw))
    }

    /// Store element `index` of type `T`.
    #[inline]
    pub fn set<T: Scalar>(&self, index: usize, value: T) -> Result<()> {
        let at = index
            .checked_mul(T::SIZE)
            .filter(|at| at + T::SIZE <= self.len)
            .ok_or_else(|| {
                Error::parameters(format!("element {index} out of a {}-byte signal", self.len))
            })?;
        let mut raw = [0u8; 8];
        value.write_ne(&mut raw);
        self.block.store(self.offset + at, &raw[..T::SIZE]);
        Ok(())
    }

    /// Element `offset` bytes into the window, for structure members.
    pub fn get_at<T: Scalar>(&self, byte_offset: usize) -> Option<T> {
        if byte_offset + T::SIZE > self.len {
            return None;
        }
        let mut raw = [0u8; 8];
        self.block.load(self.offset + byte_offset, &mut raw[..T::SIZE]);
        Some(T::read_ne(&raw))
    }

    /// Store an element `offset` bytes into the window.
    pub fn set_at<T: Scalar>(&self, byte_offset: usize, value: T) -> Result<()> {
        if byte_offset + T::SIZE > self.len {
            return Err(Error::parameters(format!(
                "byte offset {byte_offset} out of a {}-byte signal",
                self.len
            )));
        }
        let mut raw = [0u8; 8];
        value.write_ne(&mut raw);
        self.block.store(self.offset + byte_offset, &raw[..T::SIZE]);
        Ok(())
    }

    /// Copy of the window's bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.block.load(self.offset, &mut out);
        out
    }

    /// Overwrite the window; `data` must have exactly its length.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.len {
            return Err(Error::parameters(format!(
                "{} bytes written to a {}-byte signal",
                data.len(),
                self.len
            )));
        }
        self.block.store(self.offset, data);
        Ok(())
    }
}
