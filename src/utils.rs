//! Helpers shared across the placement engine

use rand::{thread_rng, Rng};

pub mod trace;

/// gets an epoch millis timestamp N seconds from now
#[macro_export]
macro_rules! from_now {
    ($seconds:expr) => {
        $crate::utils::now_ms() + ($seconds as i64) * 1000
    };
}

/// Get the current wall clock as epoch milliseconds
///
/// All engine timestamps are stored as epoch millis; rule configs are in
/// seconds and get converted at the boundary.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generates a random string from [a-z, 0-9]
///
/// # Arguments
///
/// * `len` - The length of the string to generate
pub fn gen_string(len: usize) -> String {
    // build charset to pull chars from
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz\
                           0123456789";
    // get some rng and build a string of the requested length
    let mut rng = thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_string_len_and_charset() {
        let name = gen_string(12);
        assert_eq!(name.len(), 12);
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
