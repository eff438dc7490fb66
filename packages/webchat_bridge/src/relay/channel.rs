//! Container selection.
//!
//! Repeat visitors hash to the same container across sessions, so agents find
//! earlier conversations in one place without any shared state.

/// 31-based string hash over UTF-16 code units with 32-bit wrap-around.
/// Matches the hash the widget backend has always used, so existing visitors
/// keep their container.
fn seed_hash(seed: &str) -> i32 {
    seed.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}

/// Pick a container for `seed`. `None` when no containers are configured.
pub fn select_channel<'a>(containers: &'a [String], seed: &str) -> Option<&'a str> {
    match containers {
        [] => None,
        [only] => Some(only.as_str()),
        _ => {
            let idx = seed_hash(seed).unsigned_abs() as usize % containers.len();
            Some(containers[idx].as_str())
        }
    }
}
