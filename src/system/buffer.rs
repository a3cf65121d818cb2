//! Buffers whose size the kernel only tells us after the fact.

use std::mem;

/// Heap buffer aligned for the pointer-sized structures the kernel writes.
///
/// Allocation is fallible so memory exhaustion surfaces as an error instead of
/// aborting the process.
pub struct AlignedBuf {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBuf {
    /// Zeroed buffer of `len` bytes, or `None` if the allocation fails.
    pub fn try_alloc(len: usize) -> Option<Self> {
        let word_count = len.div_ceil(mem::size_of::<u64>());
        let mut words = Vec::new();
        words.try_reserve_exact(word_count).ok()?;
        words.resize(word_count, 0);
        Some(Self { words, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `words` owns at least `len` initialized bytes and u8 has no alignment.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

/// How the next size is chosen after a "too small" answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// Double the previous size; used when the kernel's hint can't be trusted.
    Double,
    /// Use exactly the size the kernel reported.
    Reported,
}

#[derive(Debug, Clone, Copy)]
pub struct GrowthPolicy {
    pub growth: Growth,
    pub max_size: usize,
    pub max_attempts: usize,
}

/// Answer of one attempt at a given size.
#[derive(Debug)]
pub enum Fit<T> {
    Done(T),
    TooSmall { required: usize },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Grow<E> {
    /// The attempt itself failed.
    Failed(E),
    /// No usable size left: zero, over the limit, or out of attempts.
    Exhausted { size: usize },
}

/// Call `attempt` with growing sizes until it stops answering "too small".
pub fn grow_until_fits<T, E>(
    initial: usize,
    policy: GrowthPolicy,
    mut attempt: impl FnMut(usize) -> Result<Fit<T>, E>,
) -> Result<T, Grow<E>> {
    let mut size = initial;
    for _ in 0..policy.max_attempts {
        if size == 0 || size > policy.max_size {
            return Err(Grow::Exhausted { size });
        }
        match attempt(size).map_err(Grow::Failed)? {
            Fit::Done(value) => return Ok(value),
            Fit::TooSmall { required } => {
                size = match policy.growth {
                    Growth::Double => size.saturating_mul(2),
                    Growth::Reported => required,
                };
            }
        }
    }
    Err(Grow::Exhausted { size })
}
