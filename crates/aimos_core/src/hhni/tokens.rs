//! Token counting with an optional external tokenizer.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

/// Word runs or single non-space symbols.
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\w+|[^\w\s]").unwrap_or_else(|_| unreachable!("static token regex is valid"))
});

/// External tokenizer capability (e.g. a BPE vocabulary).
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Counts tokens with the injected tokenizer, else by regex splitting.
#[derive(Clone, Default)]
pub struct TokenCounter {
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokenizer(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer: Some(tokenizer),
        }
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.tokenizer {
            Some(tokenizer) => tokenizer.count(text),
            None => count_fallback(text),
        }
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("external", &self.tokenizer.is_some())
            .finish()
    }
}

pub fn count_fallback(text: &str) -> usize {
    TOKEN_RE.find_iter(text).count()
}

/// Token strings in order, as the fallback counter sees them.
pub fn split_tokens(text: &str) -> Vec<&str> {
    TOKEN_RE.find_iter(text).map(|found| found.as_str()).collect()
}
