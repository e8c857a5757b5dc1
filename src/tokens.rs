//! Token-count oracle.
//!
//! The real tokenizer is an external collaborator; the core only needs a
//! `count(text) -> usize` oracle for usage estimation when a provider omits
//! usage statistics. The default estimate counts words and punctuation runs.

use std::sync::{Arc, RwLock};

/// A token-count oracle.
pub trait TokenOracle: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Word-and-punctuation estimate used until a real tokenizer is installed.
pub struct EstimateOracle;

impl TokenOracle for EstimateOracle {
    fn count(&self, text: &str) -> usize {
        let mut count = 0usize;
        let mut in_word = false;
        for ch in text.chars() {
            if ch.is_alphanumeric() {
                if !in_word {
                    count += 1;
                    in_word = true;
                }
            } else {
                in_word = false;
                if !ch.is_whitespace() {
                    count += 1;
                }
            }
        }
        count
    }
}

static ORACLE: RwLock<Option<Arc<dyn TokenOracle>>> = RwLock::new(None);

/// Install the process-wide token oracle. Replaces any previous oracle.
pub fn set_token_oracle(oracle: Arc<dyn TokenOracle>) {
    *ORACLE.write().expect("token oracle lock poisoned") = Some(oracle);
}

/// Count tokens with the installed oracle, falling back to the estimate.
pub fn token_count(text: &str) -> usize {
    let guard = ORACLE.read().expect("token oracle lock poisoned");
    match guard.as_ref() {
        Some(oracle) => oracle.count(text),
        None => EstimateOracle.count(text),
    }
}
