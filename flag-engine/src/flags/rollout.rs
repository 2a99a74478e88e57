use std::hash::Hasher;

use siphasher::sip::SipHasher13;

pub const BUCKET_COUNT: u64 = 100;

/// Maps a key to a bucket in `[0, 100)`.
///
/// The hash is SipHash-1-3 with both keys set to zero, fed the raw UTF-8 bytes of the key.
/// It must never change: a different hash re-buckets every subject and flips treatments
/// for live rollouts.
pub fn bucket(key: &str) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(key.as_bytes());
    hasher.finish() % BUCKET_COUNT
}

/// Deterministic admission test. `percentage >= 100` always admits, `percentage <= 0`
/// never does.
pub fn in_bucket(key: &str, percentage: i32) -> bool {
    if percentage >= 100 {
        return true;
    }
    if percentage <= 0 {
        return false;
    }
    bucket(key) < percentage as u64
}

/// Key used for the flag-level rollout. Percentage-group rules hash the subject id alone,
/// so the two assignments are decorrelated.
pub fn rollout_key(flag_name: &str, subject_id: &str) -> String {
    format!("{flag_name}:{subject_id}")
}
