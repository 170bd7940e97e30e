//! Store-assigned message ids: 20 characters, lexicographically ordered by
//! creation time. Eight characters encode the millisecond timestamp in a
//! sorted 64-symbol alphabet; twelve are random. Ids minted in the same
//! millisecond reuse the previous random suffix incremented by one, so
//! ordering holds even under bursts, and a clock that steps backwards is
//! clamped to the last issued timestamp.

use std::sync::Mutex;

use rand::Rng;

// Sorted ASCII order; lexicographic id order matches numeric time order.
const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIMESTAMP_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

pub struct PushIdGenerator {
    state: Mutex<GenState>,
}

struct GenState {
    last_ms: i64,
    random: [u8; RANDOM_CHARS],
}

impl Default for PushIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GenState {
                last_ms: -1,
                random: [0; RANDOM_CHARS],
            }),
        }
    }

    pub fn next_id(&self, now_ms: i64) -> String {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let ms = now_ms.max(state.last_ms);
        if ms == state.last_ms {
            increment(&mut state.random);
        } else {
            state.last_ms = ms;
            let mut rng = rand::rng();
            for slot in state.random.iter_mut() {
                *slot = rng.random_range(0..64);
            }
        }

        let mut id = [0u8; TIMESTAMP_CHARS + RANDOM_CHARS];
        let mut rest = ms;
        for i in (0..TIMESTAMP_CHARS).rev() {
            id[i] = ALPHABET[(rest % 64) as usize];
            rest /= 64;
        }
        for (i, &slot) in state.random.iter().enumerate() {
            id[TIMESTAMP_CHARS + i] = ALPHABET[slot as usize];
        }
        String::from_utf8_lossy(&id).into_owned()
    }
}

fn increment(random: &mut [u8; RANDOM_CHARS]) {
    for slot in random.iter_mut().rev() {
        if *slot < 63 {
            *slot += 1;
            return;
        }
        *slot = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_generation_order() {
        let generator = PushIdGenerator::new();
        let mut ids = Vec::new();
        for i in 0..100 {
            // Repeat timestamps to force the same-millisecond path
            ids.push(generator.next_id(1_000 + i / 10));
        }
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), {
            let mut dedup = ids.clone();
            dedup.dedup();
            dedup.len()
        });
    }

    #[test]
    fn backwards_clock_stays_monotonic() {
        let generator = PushIdGenerator::new();
        let a = generator.next_id(5_000);
        let b = generator.next_id(4_000);
        assert!(b > a);
    }

    #[test]
    fn id_shape() {
        let id = PushIdGenerator::new().next_id(1_700_000_000_000);
        assert_eq!(id.len(), 20);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }
}
