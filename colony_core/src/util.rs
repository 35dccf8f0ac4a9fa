use std::process;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::feature::{Feature, FeatureVec};
use crate::rng::Rng;

/// Hashes are always this many hex characters.
pub const HASH_LEN: usize = 40;

/// Returns a printable hash of a byte array: the first [`HASH_LEN`] hex
/// characters of SHA-256. Stable across processes and runs.
pub fn hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = hex::encode(digest);
    out.truncate(HASH_LEN);
    out
}

/// Returns a printable preview of at most `max_len` bytes of `data`,
/// as hex with a `..` marker when truncated.
pub fn as_printable(data: &[u8], max_len: usize) -> String {
    let mut out = hex::encode(&data[..data.len().min(max_len)]);
    if data.len() > max_len {
        out.push_str("..");
    }
    out
}

/// Packs `{features, hash(input)}` into one byte array: the features as a
/// little-endian u64 array followed by the ASCII hash of the input.
/// This is the record format of the per-shard features file.
pub fn pack_features_and_hash(input: &[u8], features: &FeatureVec) -> Vec<u8> {
    let mut out = Vec::with_capacity(features.len() * 8 + HASH_LEN);
    for &feature in features {
        out.extend_from_slice(&feature.to_le_bytes());
    }
    out.extend_from_slice(hash(input).as_bytes());
    out
}

/// Reverse of [`pack_features_and_hash`]. Returns `None` if the record is
/// too short to carry a hash or the feature section is not a whole number
/// of u64s.
pub fn unpack_features_and_hash(record: &[u8]) -> Option<(FeatureVec, String)> {
    if record.len() < HASH_LEN {
        return None;
    }
    let (feature_bytes, hash_bytes) = record.split_at(record.len() - HASH_LEN);
    if feature_bytes.len() % 8 != 0 {
        return None;
    }
    let features: FeatureVec = feature_bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            Feature::from_le_bytes(raw)
        })
        .collect();
    let hash = String::from_utf8(hash_bytes.to_vec()).ok()?;
    Some((features, hash))
}

/// If `seed` != 0, returns `seed`; otherwise returns a time- and
/// pid-derived value. Never returns zero.
pub fn get_random_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (nanos ^ (u64::from(process::id()) << 32)) | 1
}

// 0 means "no early exit requested". Written from signal handlers, so the
// whole mechanism is a single atomic.
static EARLY_EXIT_CODE: AtomicI32 = AtomicI32::new(0);

/// Requests that the process exits soon with `exit_code`.
/// `exit_code` must be non-zero. Async-signal-safe.
pub fn request_early_exit(exit_code: i32) {
    debug_assert_ne!(exit_code, 0);
    EARLY_EXIT_CODE.store(exit_code, Ordering::Relaxed);
}

/// Returns true iff [`request_early_exit`] was called.
pub fn early_exit_requested() -> bool {
    EARLY_EXIT_CODE.load(Ordering::Relaxed) != 0
}

/// Returns the value most recently passed to [`request_early_exit`],
/// or 0 if it was never called.
pub fn exit_code() -> i32 {
    EARLY_EXIT_CODE.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn clear_early_exit_for_tests() {
    EARLY_EXIT_CODE.store(0, Ordering::Relaxed);
}

/// Computes a random subset of `weights` to remove so that `target_size`
/// non-zero-weight elements remain.
///
/// Zero-weight elements are removed unconditionally. Among the non-zero
/// elements, lower weights are more likely to be chosen for removal
/// (weighted sampling with exponent keys). The result is a sorted vector
/// of indices into `weights`.
pub fn random_weighted_subset(weights: &[u64], target_size: usize, rng: &mut Rng) -> Vec<usize> {
    let mut to_remove: Vec<usize> = Vec::new();
    let mut keyed: Vec<(f64, usize)> = Vec::new();
    for (idx, &weight) in weights.iter().enumerate() {
        if weight == 0 {
            to_remove.push(idx);
        } else {
            // Efraimidis-Spirakis key: u^(1/w). Elements with small keys
            // are the ones a weighted lottery would not keep.
            let unit = ((rng.next() >> 11) as f64 + 1.0) / (1u64 << 53) as f64;
            keyed.push((unit.powf(1.0 / weight as f64), idx));
        }
    }
    if keyed.len() > target_size {
        let excess = keyed.len() - target_size;
        keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        to_remove.extend(keyed.iter().take(excess).map(|&(_, idx)| idx));
    }
    to_remove.sort_unstable();
    to_remove
}

/// Removes from `items` all elements whose indices appear in
/// `subset_indices` (sorted), preserving the order of the survivors.
pub fn remove_subset<T>(subset_indices: &[usize], items: &mut Vec<T>) {
    let mut next_removed = 0;
    let mut write = 0;
    for read in 0..items.len() {
        if next_removed < subset_indices.len() && subset_indices[next_removed] == read {
            next_removed += 1;
            continue;
        }
        items.swap(write, read);
        write += 1;
    }
    items.truncate(write);
}
