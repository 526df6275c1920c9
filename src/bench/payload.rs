//! Synthetic request payloads.

use crate::protocol::{HEADER_LEN, MAX_PAYLOAD_LEN};
use clap::ValueEnum;
use rand::Rng;

/// Word length range used by latency runs.
pub const LATENCY_WORD_LEN: usize = 10;

/// Word length range used by throughput runs.
pub const THROUGHPUT_WORD_LEN: usize = 5;

/// How each attempt picks its number of words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    Fixed(u32),
    /// Uniform in `1..=max`.
    Random { max: u32 },
    /// `1, 2, .., max, 1, 2, ..` by attempt index.
    Step { max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BatchMode {
    Fixed,
    Random,
    Step,
}

impl BatchPolicy {
    pub fn new(mode: BatchMode, size: u32) -> Self {
        let size = size.max(1);
        match mode {
            BatchMode::Fixed => BatchPolicy::Fixed(size),
            BatchMode::Random => BatchPolicy::Random { max: size },
            BatchMode::Step => BatchPolicy::Step { max: size },
        }
    }

    pub fn batch_size<R: Rng + ?Sized>(&self, attempt: usize, rng: &mut R) -> u32 {
        match *self {
            BatchPolicy::Fixed(n) => n,
            BatchPolicy::Random { max } => rng.gen_range(1..=max),
            BatchPolicy::Step { max } => (attempt % max as usize) as u32 + 1,
        }
    }

    pub fn largest(&self) -> u32 {
        match *self {
            BatchPolicy::Fixed(n) => n,
            BatchPolicy::Random { max } | BatchPolicy::Step { max } => max,
        }
    }
}

/// A request body and the number of words it actually holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub text: String,
    pub words: u32,
}

/// Largest payload whose whole frame fits in `mtu` bytes.
pub fn max_payload_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(HEADER_LEN).min(MAX_PAYLOAD_LEN)
}

pub fn random_word<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// Up to `words` random lowercase words of 1..=`max_word_len` letters.
///
/// Stops early rather than exceed `max_payload` bytes, so the frame never
/// outgrows the link; `Batch::words` reports what was actually generated.
pub fn random_batch<R: Rng + ?Sized>(
    rng: &mut R,
    words: u32,
    max_word_len: usize,
    max_payload: usize,
) -> Batch {
    let mut text = String::with_capacity((words as usize * (max_word_len + 1)).min(max_payload));
    let mut count = 0;
    for _ in 0..words {
        let len = rng.gen_range(1..=max_word_len.max(1));
        let word = random_word(rng, len);
        let needed = word.len() + usize::from(count > 0);
        if text.len() + needed > max_payload {
            break;
        }
        if count > 0 {
            text.push(' ');
        }
        text.push_str(&word);
        count += 1;
    }
    Batch { text, words: count }
}
