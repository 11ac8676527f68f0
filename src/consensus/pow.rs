//! NogoPow, an Ethash-family memory-hard proof of work.
//!
//! For a given seed the engine builds a small pseudo-random cache and from it
//! a larger dataset. Hashimoto walks the dataset by indices derived from the
//! header digest and the nonce, folds the walk into a 32-byte mix digest and
//! hashes that with the seed into the final proof value. Verification and
//! mining read the same dataset, so both sides pay the memory cost.
//!
//! Engine construction is pure and single-threaded; callers that verify many
//! headers memoise engines through [`PowCache`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use ethereum_types::{H256, U256};
use parking_lot::Mutex;
use sha3::{Digest, Keccak512};

use crate::crypto::{keccak256, sha256};

/// Number of 64-byte cache items.
pub const CACHE_ITEMS: usize = 1024;
/// Number of 64-byte dataset items.
pub const DATASET_ITEMS: usize = 16_384;

/// Rounds of cache post-mixing.
const CACHE_ROUNDS: usize = 3;
/// Dataset parents folded into each dataset item.
const DATASET_PARENTS: usize = 16;
/// Dataset accesses per hashimoto evaluation.
const HASHIMOTO_ROUNDS: usize = 64;
/// Words in the hashimoto mix (128 bytes).
const MIX_WORDS: usize = 32;

const FNV_PRIME: u32 = 0x0100_0193;

type Item = [u8; 64];

fn fnv(a: u32, b: u32) -> u32 {
    a.wrapping_mul(FNV_PRIME) ^ b
}

fn keccak512(data: &[u8]) -> Item {
    let mut hasher = Keccak512::new();
    hasher.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn item_word(item: &Item, index: usize) -> u32 {
    let offset = (index % 16) * 4;
    u32::from_le_bytes([
        item[offset],
        item[offset + 1],
        item[offset + 2],
        item[offset + 3],
    ])
}

/// Result of a mining scan.
#[derive(Clone, Debug)]
pub struct MineOutcome {
    pub nonce: u64,
    pub hash: H256,
    pub mix_digest: H256,
    pub found: bool,
}

impl MineOutcome {
    fn miss() -> Self {
        Self {
            nonce: 0,
            hash: H256::zero(),
            mix_digest: H256::zero(),
            found: false,
        }
    }
}

/// A NogoPow engine holding the cache and dataset for one seed.
pub struct NogoPow {
    cache: Vec<Item>,
    dataset: Vec<Item>,
    seed_digest: Option<[u8; 32]>,
}

impl Default for NogoPow {
    fn default() -> Self {
        Self::new()
    }
}

impl NogoPow {
    pub fn new() -> Self {
        Self {
            cache: Vec::new(),
            dataset: Vec::new(),
            seed_digest: None,
        }
    }

    /// Build the cache and dataset for `seed`. Idempotent: re-initializing
    /// with the seed already built is a no-op.
    pub fn initialize(&mut self, seed: &[u8]) {
        let digest = sha256(seed);
        if self.seed_digest == Some(digest) {
            return;
        }
        self.build_cache(seed);
        self.build_dataset();
        self.seed_digest = Some(digest);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    fn build_cache(&mut self, seed: &[u8]) {
        let mut cache = Vec::with_capacity(CACHE_ITEMS);
        let mut item = keccak512(seed);
        cache.push(item);
        for _ in 1..CACHE_ITEMS {
            item = keccak512(&item);
            cache.push(item);
        }

        // Low-round memo-hash mixing over the sequential fill.
        for _ in 0..CACHE_ROUNDS {
            for i in 0..CACHE_ITEMS {
                let src = item_word(&cache[i], 0) as usize % CACHE_ITEMS;
                let prev = (i + CACHE_ITEMS - 1) % CACHE_ITEMS;
                let mut mixed = [0u8; 64];
                for (j, byte) in mixed.iter_mut().enumerate() {
                    *byte = cache[prev][j] ^ cache[src][j];
                }
                cache[i] = keccak512(&mixed);
            }
        }
        self.cache = cache;
    }

    fn build_dataset(&mut self) {
        let mut dataset = Vec::with_capacity(DATASET_ITEMS);
        for index in 0..DATASET_ITEMS {
            dataset.push(self.dataset_item(index));
        }
        self.dataset = dataset;
    }

    fn dataset_item(&self, index: usize) -> Item {
        let mut mix = self.cache[index % CACHE_ITEMS];
        let seeded = item_word(&mix, 0) ^ index as u32;
        mix[..4].copy_from_slice(&seeded.to_le_bytes());
        let mut mix = keccak512(&mix);

        for parent in 0..DATASET_PARENTS {
            let word = item_word(&mix, parent);
            let source = fnv(index as u32 ^ parent as u32, word) as usize % CACHE_ITEMS;
            let cache_item = &self.cache[source];
            for chunk in 0..16 {
                let combined = fnv(item_word(&mix, chunk), item_word(cache_item, chunk));
                mix[chunk * 4..chunk * 4 + 4].copy_from_slice(&combined.to_le_bytes());
            }
        }
        keccak512(&mix)
    }

    /// Run the hashimoto mix for `header ‖ nonce`. Returns the proof hash and
    /// the 32-byte mix digest, both deterministic in the inputs.
    pub fn hashimoto(&self, header: &[u8], nonce: u64) -> (H256, H256) {
        debug_assert!(!self.dataset.is_empty(), "engine not initialized");

        let mut seed_input = Vec::with_capacity(header.len() + 8);
        seed_input.extend_from_slice(header);
        seed_input.extend_from_slice(&nonce.to_le_bytes());
        let seed = keccak512(&seed_input);
        let seed_head = item_word(&seed, 0);

        // Replicate the 64-byte seed into the 128-byte mix.
        let mut mix = [0u32; MIX_WORDS];
        for (i, word) in mix.iter_mut().enumerate() {
            *word = item_word(&seed, i % 16);
        }

        for round in 0..HASHIMOTO_ROUNDS {
            let parent =
                fnv(round as u32 ^ seed_head, mix[round % MIX_WORDS]) as usize % DATASET_ITEMS;
            let item = &self.dataset[parent];
            for (j, word) in mix.iter_mut().enumerate() {
                *word = fnv(*word, item_word(item, j));
            }
        }

        // Compress 32 mix words down to 8.
        let mut compressed = [0u8; 32];
        for k in 0..MIX_WORDS / 4 {
            let word = fnv(fnv(fnv(mix[4 * k], mix[4 * k + 1]), mix[4 * k + 2]), mix[4 * k + 3]);
            compressed[k * 4..k * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        let mix_digest = H256::from_slice(&compressed);

        let mut final_input = Vec::with_capacity(64 + 32);
        final_input.extend_from_slice(&seed);
        final_input.extend_from_slice(mix_digest.as_bytes());
        (keccak256(&final_input), mix_digest)
    }

    /// True iff the proof value for `(header, nonce)` is numerically at most
    /// `target`. Never panics or errors.
    pub fn verify(&self, header: &[u8], nonce: u64, target: U256) -> bool {
        let (hash, _) = self.hashimoto(header, nonce);
        U256::from_big_endian(hash.as_bytes()) <= target
    }

    /// Linear scan over `iterations` nonces starting at `start_nonce`.
    pub fn mine(&self, header: &[u8], target: U256, start_nonce: u64, iterations: u64) -> MineOutcome {
        self.mine_with_flag(header, target, start_nonce, iterations, None)
    }

    fn mine_with_flag(
        &self,
        header: &[u8],
        target: U256,
        start_nonce: u64,
        iterations: u64,
        stop: Option<&AtomicBool>,
    ) -> MineOutcome {
        let mut nonce = start_nonce;
        for _ in 0..iterations {
            if let Some(flag) = stop {
                if flag.load(Ordering::Relaxed) {
                    return MineOutcome::miss();
                }
            }
            let (hash, mix_digest) = self.hashimoto(header, nonce);
            if U256::from_big_endian(hash.as_bytes()) <= target {
                return MineOutcome {
                    nonce,
                    hash,
                    mix_digest,
                    found: true,
                };
            }
            nonce = nonce.wrapping_add(1);
        }
        MineOutcome::miss()
    }

    /// Partition the nonce space across the available parallelism and scan
    /// `iterations` nonces in total; the first thread to find a solution
    /// cancels the rest.
    pub fn mine_parallel(&self, header: &[u8], target: U256, iterations: u64) -> MineOutcome {
        let threads = thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1)
            .min(iterations.max(1));
        let per_thread = iterations / threads + u64::from(iterations % threads != 0);
        let stride = u64::MAX / threads;

        let stop = AtomicBool::new(false);
        let winner: Mutex<Option<MineOutcome>> = Mutex::new(None);

        thread::scope(|scope| {
            for worker in 0..threads {
                let stop = &stop;
                let winner = &winner;
                scope.spawn(move || {
                    let outcome =
                        self.mine_with_flag(header, target, worker * stride, per_thread, Some(stop));
                    if outcome.found {
                        let mut slot = winner.lock();
                        if slot.is_none() {
                            *slot = Some(outcome);
                            stop.store(true, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        winner.into_inner().unwrap_or_else(MineOutcome::miss)
    }
}

/// Process-wide memoisation of initialized engines, keyed by the SHA-256 of
/// the seed bytes. Owned by whichever component verifies or mines; never a
/// module-level global.
#[derive(Default)]
pub struct PowCache {
    engines: Mutex<HashMap<[u8; 32], Arc<NogoPow>>>,
}

impl PowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or build the engine seeded with `seed`.
    pub fn engine_for(&self, seed: &[u8]) -> Arc<NogoPow> {
        let key = sha256(seed);
        let mut engines = self.engines.lock();
        if let Some(engine) = engines.get(&key) {
            return Arc::clone(engine);
        }
        let mut engine = NogoPow::new();
        engine.initialize(seed);
        let engine = Arc::new(engine);
        engines.insert(key, Arc::clone(&engine));
        engine
    }

    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenient_target() -> U256 {
        U256::from(1_000_000u64) << 240
    }

    fn initialized() -> NogoPow {
        let mut pow = NogoPow::new();
        pow.initialize(b"test seed");
        pow
    }

    #[test]
    fn initialize_builds_cache_and_dataset() {
        let pow = initialized();
        assert_eq!(pow.cache_len(), CACHE_ITEMS);
        assert_eq!(pow.dataset_len(), DATASET_ITEMS);
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut pow = initialized();
        let (before, _) = pow.hashimoto(b"header", 1);
        pow.initialize(b"test seed");
        let (after, _) = pow.hashimoto(b"header", 1);
        assert_eq!(before, after);
    }

    #[test]
    fn hashimoto_is_deterministic_with_fixed_widths() {
        let pow = initialized();
        let (hash_a, mix_a) = pow.hashimoto(b"test header", 12_345);
        let (hash_b, mix_b) = pow.hashimoto(b"test header", 12_345);
        assert_eq!(hash_a, hash_b);
        assert_eq!(mix_a, mix_b);
        let (hash_c, _) = pow.hashimoto(b"test header", 12_346);
        assert_ne!(hash_a, hash_c);
    }

    #[test]
    fn verify_agrees_with_hashimoto() {
        let pow = initialized();
        let (hash, _) = pow.hashimoto(b"test header", 12_345);
        let value = U256::from_big_endian(hash.as_bytes());
        assert!(pow.verify(b"test header", 12_345, value));
        if value > U256::zero() {
            assert!(!pow.verify(b"test header", 12_345, value - 1));
        }
    }

    #[test]
    fn mine_finds_verifiable_solutions() {
        let pow = initialized();
        let outcome = pow.mine(b"test header", lenient_target(), 0, 1_000);
        assert!(outcome.found);
        assert!(pow.verify(b"test header", outcome.nonce, lenient_target()));
    }

    #[test]
    fn mine_parallel_solution_passes_verify() {
        let pow = initialized();
        let outcome = pow.mine_parallel(b"test header", lenient_target(), 1_000);
        if outcome.found {
            assert!(pow.verify(b"test header", outcome.nonce, lenient_target()));
            let (hash, mix) = pow.hashimoto(b"test header", outcome.nonce);
            assert_eq!(hash, outcome.hash);
            assert_eq!(mix, outcome.mix_digest);
        }
    }

    #[test]
    fn cache_reuses_engines_per_seed() {
        let cache = PowCache::new();
        let first = cache.engine_for(b"seed-a");
        let again = cache.engine_for(b"seed-a");
        assert!(Arc::ptr_eq(&first, &again));
        let other = cache.engine_for(b"seed-b");
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(cache.len(), 2);
    }
}
