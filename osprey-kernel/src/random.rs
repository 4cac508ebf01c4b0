//! The kernel entropy pool and stream generator.
//!
//! Twenty pools collect interrupt-derived entropy (vector, rip, rsp and
//! TSC deltas). Each generate call drains a BLAKE2b digest from one
//! pool — 64 bits for small requests, 128 for bulk — and uses it as a
//! ChaCha20 key with a monotonic 96-bit nonce to stream the output.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spinning_top::Spinlock;

const POOL_COUNT: usize = 20;
const POOL_WORDS: usize = 32;

struct Pool {
    words: [u64; POOL_WORDS],
    cursor: usize,
}

impl Pool {
    const fn new() -> Pool {
        Pool {
            words: [0; POOL_WORDS],
            cursor: 0,
        }
    }

    fn mix(&mut self, value: u64) {
        let slot = self.cursor % POOL_WORDS;
        self.words[slot] = self.words[slot]
            .rotate_left(13)
            .wrapping_mul(0x9E3779B97F4A7C15)
            ^ value;
        self.cursor = self.cursor.wrapping_add(1);
    }
}

static POOLS: [Spinlock<Pool>; POOL_COUNT] = [const { Spinlock::new(Pool::new()) }; POOL_COUNT];
static NEXT_POOL: AtomicUsize = AtomicUsize::new(0);
static PREV_TSC: AtomicU64 = AtomicU64::new(0);
static NONCE: AtomicU64 = AtomicU64::new(1);

/// Fold interrupt state into the next pool. Called from every IRQ
/// dispatch; must not allocate or block.
pub fn add_irq_entropy(vector: u8, rip: u64, rsp: u64) {
    let tsc = unsafe { core::arch::x86_64::_rdtsc() };
    let delta = tsc.wrapping_sub(PREV_TSC.swap(tsc, Ordering::Relaxed));

    let entropy = (vector as u64) ^ (rip << 16) ^ ((rsp & 0xFFFF_FFFF) << 32) ^ delta;

    let index = NEXT_POOL.fetch_add(1, Ordering::Relaxed) % POOL_COUNT;
    // IRQ handlers on the same CPU cannot deadlock here (dispatch runs
    // with interrupts off); skip rather than spin if contended anyway.
    if let Some(mut pool) = POOLS[index].try_lock() {
        pool.mix(entropy);
    }
}

/// Mix caller-provided words in (boot seeding).
pub fn add_entropy(words: &[u64]) {
    let index = NEXT_POOL.fetch_add(1, Ordering::Relaxed) % POOL_COUNT;
    let mut pool = POOLS[index].lock();
    for &word in words {
        pool.mix(word);
    }
}

/// Fill `out` with generator output.
pub fn generate(out: &mut [u8]) {
    // Small requests key off a 64-bit digest, bulk off 128 bits.
    let digest_words = if out.len() <= 32 { 1 } else { 2 };

    let index = NEXT_POOL.fetch_add(1, Ordering::Relaxed) % POOL_COUNT;
    let digest = {
        let pool = POOLS[index].lock();
        let mut state = Blake2b::new(16);
        state.update_words(&pool.words);
        state.update_words(&[unsafe { core::arch::x86_64::_rdtsc() }]);
        state.finish()
    };

    let mut key = [0u32; 8];
    for (i, chunk) in digest[..digest_words * 8]
        .chunks(4)
        .cycle()
        .take(8)
        .enumerate()
    {
        key[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }

    let nonce_value = NONCE.fetch_add(1, Ordering::SeqCst);
    let nonce = [
        nonce_value as u32,
        (nonce_value >> 32) as u32,
        0x4f535052, // stream domain tag
    ];

    let mut counter = 1;
    for block in out.chunks_mut(64) {
        let stream = chacha20_block(&key, counter, &nonce);
        for (dst, src) in block.iter_mut().zip(stream.iter()) {
            *dst = *src;
        }
        counter += 1;
    }
}

pub fn random_u32() -> u32 {
    let mut bytes = [0u8; 4];
    generate(&mut bytes);
    u32::from_le_bytes(bytes)
}

pub fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    generate(&mut bytes);
    u64::from_le_bytes(bytes)
}

// ── ChaCha20 ─────────────────────────────────────────────────────────

fn quarter_round(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(16);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(12);
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(8);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(7);
}

fn chacha20_block(key: &[u32; 8], counter: u32, nonce: &[u32; 3]) -> [u8; 64] {
    let mut initial = [0u32; 16];
    initial[0] = 0x61707865;
    initial[1] = 0x3320646E;
    initial[2] = 0x79622D32;
    initial[3] = 0x6B206574;
    initial[4..12].copy_from_slice(key);
    initial[12] = counter;
    initial[13..16].copy_from_slice(nonce);

    let mut state = initial;
    for _ in 0..10 {
        quarter_round(&mut state, 0, 4, 8, 12);
        quarter_round(&mut state, 1, 5, 9, 13);
        quarter_round(&mut state, 2, 6, 10, 14);
        quarter_round(&mut state, 3, 7, 11, 15);
        quarter_round(&mut state, 0, 5, 10, 15);
        quarter_round(&mut state, 1, 6, 11, 12);
        quarter_round(&mut state, 2, 7, 8, 13);
        quarter_round(&mut state, 3, 4, 9, 14);
    }

    let mut out = [0u8; 64];
    for i in 0..16 {
        let word = state[i].wrapping_add(initial[i]);
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    out
}

// ── BLAKE2b ──────────────────────────────────────────────────────────

const BLAKE2B_IV: [u64; 8] = [
    0x6A09E667F3BCC908,
    0xBB67AE8584CAA73B,
    0x3C6EF372FE94F82B,
    0xA54FF53A5F1D36F1,
    0x510E527FADE682D1,
    0x9B05688C2B3E6C1F,
    0x1F83D9ABFB41BD6B,
    0x5BE0CD19137E2179,
];

const SIGMA: [[usize; 16]; 12] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [14, 10, 4, 8, 9, 15, 13, 6, 1, 12, 0, 2, 11, 7, 5, 3],
    [11, 8, 12, 0, 5, 2, 15, 13, 10, 14, 3, 6, 7, 1, 9, 4],
    [7, 9, 3, 1, 13, 12, 11, 14, 2, 6, 5, 10, 4, 0, 15, 8],
    [9, 0, 5, 7, 2, 4, 10, 15, 14, 1, 11, 12, 6, 8, 3, 13],
    [2, 12, 6, 10, 0, 11, 8, 3, 4, 13, 7, 5, 15, 14, 1, 9],
    [12, 5, 1, 15, 14, 13, 4, 10, 0, 7, 6, 3, 9, 2, 8, 11],
    [13, 11, 7, 14, 12, 1, 3, 9, 5, 0, 15, 4, 8, 6, 2, 10],
    [6, 15, 14, 9, 11, 3, 0, 8, 12, 2, 13, 7, 1, 4, 10, 5],
    [10, 2, 8, 4, 7, 6, 1, 5, 15, 11, 9, 14, 3, 12, 13, 0],
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [14, 10, 4, 8, 9, 15, 13, 6, 1, 12, 0, 2, 11, 7, 5, 3],
];

struct Blake2b {
    state: [u64; 8],
    input: [u64; 16],
    input_len: usize,
    bytes_processed: u128,
    digest_size: usize,
}

impl Blake2b {
    fn new(digest_size: usize) -> Blake2b {
        let mut state = BLAKE2B_IV;
        state[0] ^= 0x01010000 ^ digest_size as u64;
        Blake2b {
            state,
            input: [0; 16],
            input_len: 0,
            bytes_processed: 0,
            digest_size,
        }
    }

    fn update_words(&mut self, words: &[u64]) {
        for &word in words {
            if self.input_len == 16 {
                self.bytes_processed += 128;
                self.compress(false);
                self.input_len = 0;
                self.input = [0; 16];
            }
            self.input[self.input_len] = word;
            self.input_len += 1;
        }
    }

    fn finish(mut self) -> [u8; 16] {
        self.bytes_processed += (self.input_len * 8) as u128;
        self.compress(true);

        let mut out = [0u8; 16];
        for i in 0..self.digest_size.min(16) / 8 {
            out[i * 8..i * 8 + 8].copy_from_slice(&self.state[i].to_le_bytes());
        }
        out
    }

    fn compress(&mut self, last: bool) {
        let mut v = [0u64; 16];
        v[..8].copy_from_slice(&self.state);
        v[8..].copy_from_slice(&BLAKE2B_IV);
        v[12] ^= self.bytes_processed as u64;
        v[13] ^= (self.bytes_processed >> 64) as u64;
        if last {
            v[14] = !v[14];
        }

        for round in &SIGMA {
            Self::g(&mut v, 0, 4, 8, 12, self.input[round[0]], self.input[round[1]]);
            Self::g(&mut v, 1, 5, 9, 13, self.input[round[2]], self.input[round[3]]);
            Self::g(&mut v, 2, 6, 10, 14, self.input[round[4]], self.input[round[5]]);
            Self::g(&mut v, 3, 7, 11, 15, self.input[round[6]], self.input[round[7]]);
            Self::g(&mut v, 0, 5, 10, 15, self.input[round[8]], self.input[round[9]]);
            Self::g(&mut v, 1, 6, 11, 12, self.input[round[10]], self.input[round[11]]);
            Self::g(&mut v, 2, 7, 8, 13, self.input[round[12]], self.input[round[13]]);
            Self::g(&mut v, 3, 4, 9, 14, self.input[round[14]], self.input[round[15]]);
        }

        for i in 0..8 {
            self.state[i] ^= v[i] ^ v[i + 8];
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn g(v: &mut [u64; 16], a: usize, b: usize, c: usize, d: usize, x: u64, y: u64) {
        v[a] = v[a].wrapping_add(v[b]).wrapping_add(x);
        v[d] = (v[d] ^ v[a]).rotate_right(32);
        v[c] = v[c].wrapping_add(v[d]);
        v[b] = (v[b] ^ v[c]).rotate_right(24);
        v[a] = v[a].wrapping_add(v[b]).wrapping_add(y);
        v[d] = (v[d] ^ v[a]).rotate_right(16);
        v[c] = v[c].wrapping_add(v[d]);
        v[b] = (v[b] ^ v[c]).rotate_right(63);
    }
}
