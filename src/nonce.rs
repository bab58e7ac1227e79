//! Anti-replay nonces.

use std::collections::VecDeque;

use parking_lot::Mutex;

const DEFAULT_START: u64 = 0x8af2;
const DEFAULT_WINDOW: usize = 10;

/// Issues decimal nonces and accepts each one at most once.
///
/// Consumed values are remembered in a fixed-size window. Anything at or below the oldest
/// forgotten value is rejected outright, so memory stays bounded while replays are still caught.
#[derive(Debug)]
pub struct NonceSource {
    state: Mutex<NonceState>,
}

#[derive(Debug)]
struct NonceState {
    counter: u64,
    min: u64,
    used: VecDeque<u64>,
}

impl Default for NonceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceSource {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_START, DEFAULT_WINDOW)
    }

    /// Creates a source whose first nonce is `start + 1`, remembering `window` consumed values.
    pub fn with_window(start: u64, window: usize) -> Self {
        let window = window.max(1);

        NonceSource {
            state: Mutex::new(NonceState {
                counter: start,
                min: start,
                used: std::iter::repeat(start).take(window).collect(),
            }),
        }
    }

    /// Returns a fresh nonce.
    pub fn issue(&self) -> String {
        let mut state = self.state.lock();
        state.counter += 1;
        state.counter.to_string()
    }

    /// Accepts `nonce` if it was issued here and has not been consumed yet.
    pub fn consume(&self, nonce: &str) -> bool {
        if nonce.is_empty() || !nonce.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }

        let Ok(value) = nonce.parse::<u64>() else {
            return false;
        };

        let mut state = self.state.lock();

        if value <= state.min || value > state.counter || state.used.contains(&value) {
            log::trace!("Rejecting nonce {value}");
            return false;
        }

        // the floor never moves down, so evicted values stay rejected
        if let Some(oldest) = state.used.pop_front() {
            state.min = state.min.max(oldest);
        }
        state.used.push_back(value);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_nonce_is_accepted_once() {
        let nonces = NonceSource::new();
        let nonce = nonces.issue();

        assert!(nonces.consume(&nonce));
        assert!(!nonces.consume(&nonce));
    }

    #[test]
    fn unissued_and_garbage_nonces_are_rejected() {
        let nonces = NonceSource::new();
        let issued = nonces.issue();

        let future = (issued.parse::<u64>().unwrap() + 1).to_string();
        assert!(!nonces.consume(&future));
        assert!(!nonces.consume(""));
        assert!(!nonces.consume("12ab"));
        assert!(!nonces.consume("-1"));
        assert!(!nonces.consume(&DEFAULT_START.to_string()));
    }

    #[test]
    fn unconsumed_nonce_ages_out() {
        let nonces = NonceSource::with_window(42, 10);

        let old = nonces.issue();
        for _ in 0..11 {
            let nonce = nonces.issue();
            assert!(nonces.consume(&nonce));
        }

        assert!(!nonces.consume(&old));
    }

    #[test]
    fn evicted_nonce_cannot_be_replayed() {
        let nonces = NonceSource::with_window(0, 2);
        let a = nonces.issue();
        let _b = nonces.issue();
        let c = nonces.issue();
        let d = nonces.issue();
        let e = nonces.issue();

        assert!(nonces.consume(&c));
        assert!(nonces.consume(&a));
        assert!(nonces.consume(&d));
        assert!(nonces.consume(&e));

        // `c` was evicted before `a`; the floor must still cover it
        assert!(!nonces.consume(&c));
        assert!(!nonces.consume(&a));
    }

    #[test]
    fn out_of_order_consumption_within_window() {
        let nonces = NonceSource::with_window(0, 3);
        let a = nonces.issue();
        let b = nonces.issue();
        let c = nonces.issue();

        assert!(nonces.consume(&c));
        assert!(nonces.consume(&a));
        assert!(nonces.consume(&b));
        assert!(!nonces.consume(&a));
    }
}
