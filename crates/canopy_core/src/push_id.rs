//! Chronologically sortable child keys.
//!
//! A push id is 20 characters: 8 encode the creation time in milliseconds,
//! 12 are random. Ids generated within the same millisecond increment the
//! random part so they still sort in creation order.

use parking_lot::Mutex;
use rand::Rng;

const PUSH_CHARS: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Length of a generated id.
pub const PUSH_ID_LEN: usize = 20;

const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

struct State {
    last_time: i64,
    last_random: [u8; RANDOM_CHARS],
}

/// Generates push ids. One generator per database keeps ids monotonic.
pub struct PushIdGenerator {
    state: Mutex<State>,
}

impl PushIdGenerator {
    /// Creates a generator.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                last_time: i64::MIN,
                last_random: [0; RANDOM_CHARS],
            }),
        }
    }

    /// Generates an id for a write made at `now_millis`.
    pub fn generate(&self, now_millis: i64) -> String {
        let mut state = self.state.lock();
        let duplicate = now_millis == state.last_time;
        state.last_time = now_millis;

        let mut out = [0u8; PUSH_ID_LEN];
        let mut now = now_millis.max(0) as u64;
        for slot in out[..TIME_CHARS].iter_mut().rev() {
            *slot = PUSH_CHARS[(now % 64) as usize];
            now /= 64;
        }

        if duplicate {
            increment(&mut state.last_random);
        } else {
            let mut rng = rand::thread_rng();
            for digit in state.last_random.iter_mut() {
                *digit = rng.gen_range(0..64);
            }
        }
        for (slot, digit) in out[TIME_CHARS..].iter_mut().zip(state.last_random.iter()) {
            *slot = PUSH_CHARS[*digit as usize];
        }

        out.iter().map(|b| *b as char).collect()
    }
}

impl Default for PushIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn increment(digits: &mut [u8; RANDOM_CHARS]) {
    for digit in digits.iter_mut().rev() {
        if *digit == 63 {
            *digit = 0;
        } else {
            *digit += 1;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::validate_key;

    #[test]
    fn ids_are_valid_keys() {
        let gen = PushIdGenerator::new();
        let id = gen.generate(1_700_000_000_000);
        assert_eq!(id.len(), PUSH_ID_LEN);
        validate_key(&id).unwrap();
    }

    #[test]
    fn same_millisecond_ids_sort_in_order() {
        let gen = PushIdGenerator::new();
        let ids: Vec<String> = (0..50).map(|_| gen.generate(1_000)).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert!(ids.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn later_time_sorts_later() {
        let gen = PushIdGenerator::new();
        let a = gen.generate(1_000);
        let b = gen.generate(1_001);
        let c = gen.generate(64 * 64);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn increment_carries() {
        let mut digits = [0u8; RANDOM_CHARS];
        digits[RANDOM_CHARS - 1] = 63;
        increment(&mut digits);
        assert_eq!(digits[RANDOM_CHARS - 1], 0);
        assert_eq!(digits[RANDOM_CHARS - 2], 1);
    }
}
