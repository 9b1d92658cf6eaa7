// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation seam and a bitmap-backed frame pool
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameNumber, FrameAllocator (trait), FramePool, allocate_or_halt()
//! DEPENDS_ON: sync::SpinLock, config::PAGE_SIZE
//! INVARIANTS: A frame is owned by at most one VM object; allocation failure halts the kernel
//!
//! The core never touches physical memory directly. Zero-fill, copy-on-write
//! copies and user copies all go through [`FrameAllocator`], which on bare metal
//! is backed by the direct map and on the host by [`FramePool`]'s heap arena.

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::sync::SpinLock;

/// Physical frame number (physical address >> PAGE_SHIFT).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// Physical address of the first byte of the frame.
    #[inline]
    pub const fn phys_addr(self) -> usize {
        self.0 << PAGE_SHIFT
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.phys_addr())
    }
}

/// Physical-memory provider consumed by VM objects.
///
/// `offset + len` of every byte access stays within one frame; callers split
/// larger copies at page boundaries.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame. Contents are unspecified.
    fn allocate(&self) -> Option<FrameNumber>;
    /// Returns a frame to the free pool.
    fn free(&self, frame: FrameNumber);
    /// Fills a frame with zeroes.
    fn zero(&self, frame: FrameNumber);
    /// Copies the full contents of `src` into `dst`.
    fn copy(&self, src: FrameNumber, dst: FrameNumber);
    /// Reads `buf.len()` bytes starting at `offset` within `frame`.
    fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]);
    /// Writes `data` starting at `offset` within `frame`.
    fn write(&self, frame: FrameNumber, offset: usize, data: &[u8]);
    /// Number of frames currently handed out.
    fn allocated(&self) -> usize;
}

/// Allocates a frame or halts: the kernel has no recovery path for physical exhaustion.
pub fn allocate_or_halt(frames: &dyn FrameAllocator) -> FrameNumber {
    match frames.allocate() {
        Some(frame) => frame,
        None => {
            log_error!(target: "mm", "out of physical memory ({} frames in use)", frames.allocated());
            panic!("out of physical memory");
        }
    }
}

const WORD_BITS: usize = u64::BITS as usize;

struct FrameBitmap {
    words: Vec<u64>,
    count: usize,
    next: usize,
    used: usize,
}

impl FrameBitmap {
    fn new(count: usize) -> Self {
        let mut words = Vec::with_capacity(count.div_ceil(WORD_BITS));
        words.resize(count.div_ceil(WORD_BITS), 0);
        Self { words, count, next: 0, used: 0 }
    }

    fn allocate(&mut self) -> Option<usize> {
        for _ in 0..self.count {
            let index = self.next % self.count;
            self.next = (index + 1) % self.count;
            let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
            if self.words[word] & (1 << bit) == 0 {
                self.words[word] |= 1 << bit;
                self.used += 1;
                return Some(index);
            }
        }
        None
    }

    fn free(&mut self, index: usize) -> bool {
        if index >= self.count {
            return false;
        }
        let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
        if self.words[word] & (1 << bit) == 0 {
            return false;
        }
        self.words[word] &= !(1 << bit);
        self.used -= 1;
        true
    }
}

type FrameBytes = Box<[u8; PAGE_SIZE]>;

/// Fixed-size frame pool: next-fit bitmap plus a heap arena standing in for the direct map.
pub struct FramePool {
    base: FrameNumber,
    bitmap: SpinLock<FrameBitmap>,
    memory: Box<[SpinLock<FrameBytes>]>,
}

impl FramePool {
    /// Creates a pool of `count` frames numbered from `base`.
    pub fn new(base: FrameNumber, count: usize) -> Self {
        let memory: Vec<SpinLock<FrameBytes>> =
            (0..count).map(|_| SpinLock::new(Box::new([0u8; PAGE_SIZE]))).collect();
        Self { base, bitmap: SpinLock::new(FrameBitmap::new(count)), memory: memory.into_boxed_slice() }
    }

    /// Pool of `count` frames starting at physical 1 MiB.
    pub fn with_capacity(count: usize) -> Self {
        Self::new(FrameNumber::from_raw(0x100), count)
    }

    /// Total frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    fn cell(&self, frame: FrameNumber) -> &SpinLock<FrameBytes> {
        let index = frame
            .as_raw()
            .checked_sub(self.base.as_raw())
            .filter(|index| *index < self.memory.len());
        match index {
            Some(index) => &self.memory[index],
            None => panic!("frame {} outside pool", frame),
        }
    }
}

impl FrameAllocator for FramePool {
    fn allocate(&self) -> Option<FrameNumber> {
        let index = self.bitmap.lock().allocate()?;
        Some(FrameNumber::from_raw(self.base.as_raw() + index))
    }

    fn free(&self, frame: FrameNumber) {
        let index = frame.as_raw().wrapping_sub(self.base.as_raw());
        let freed = self.bitmap.lock().free(index);
        assert!(freed, "double free of frame {}", frame);
    }

    fn zero(&self, frame: FrameNumber) {
        self.cell(frame).lock().fill(0);
    }

    fn copy(&self, src: FrameNumber, dst: FrameNumber) {
        if src == dst {
            return;
        }
        // Stage through a local copy so two frame locks are never held at once.
        let staged: [u8; PAGE_SIZE] = **self.cell(src).lock();
        self.cell(dst).lock().copy_from_slice(&staged);
    }

    fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]) {
        let bytes = self.cell(frame).lock();
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
    }

    fn write(&self, frame: FrameNumber, offset: usize, data: &[u8]) {
        let mut bytes = self.cell(frame).lock();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn allocated(&self) -> usize {
        self.bitmap.lock().used
    }
}
