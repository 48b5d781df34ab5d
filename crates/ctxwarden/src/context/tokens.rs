//! Token estimation.
//!
//! The engine only needs approximate, consistent counts, so the default
//! [`HeuristicTokenCounter`] divides character counts by a fixed ratio and
//! adds a small per-message framing overhead. Counts keyed by message id are
//! memoized; the cache key also carries a hash of the content so an edited
//! message is never served a stale count.

use crate::Message;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use tracing::trace;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Tokens added per message for role and framing.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Upper bound on memoized entries before the cache is cleared.
const MAX_CACHE_ENTRIES: usize = 10_000;

/// Estimates token counts for text and message sequences.
///
/// Implementations must be cheap and deterministic: the orchestrator calls
/// them synchronously after every mutation.
pub trait TokenCounter: Send + Sync {
    /// Estimate tokens in a piece of text.
    fn count_tokens(&self, text: &str) -> usize;

    /// Estimate tokens for `text`, memoized by `id`.
    fn count_tokens_cached(&self, id: &str, text: &str) -> usize {
        let _ = id;
        self.count_tokens(text)
    }

    /// Tokens for one message, including framing overhead. A count already
    /// stored on the message is trusted.
    fn count_message_tokens(&self, message: &Message) -> usize {
        message.token_count.unwrap_or_else(|| {
            self.count_tokens_cached(&message.id, &message.content) + MESSAGE_OVERHEAD_TOKENS
        })
    }

    /// Total tokens for a message sequence.
    fn count_conversation_tokens(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message_tokens(m)).sum()
    }
}

/// Character-ratio token estimator with an id-keyed memo cache.
#[derive(Debug)]
pub struct HeuristicTokenCounter {
    chars_per_token: f64,
    cache: Mutex<CountCache>,
}

#[derive(Debug, Default)]
struct CountCache {
    entries: HashMap<(String, u64), usize>,
    hits: u64,
    misses: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl Default for HeuristicTokenCounter {
    fn default() -> Self {
        Self::with_ratio(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl HeuristicTokenCounter {
    /// Create a counter with a calibrated chars-per-token ratio.
    /// Non-positive ratios fall back to the default.
    pub fn with_ratio(chars_per_token: f64) -> Self {
        let ratio = if chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self {
            chars_per_token: ratio,
            cache: Mutex::new(CountCache::default()),
        }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    pub fn stats(&self) -> CacheStats {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            entries: cache.entries.len(),
            hits: cache.hits,
            misses: cache.misses,
        }
    }

    /// Drop every memoized count.
    pub fn clear(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.entries.clear();
    }
}

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

impl TokenCounter for HeuristicTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }

    fn count_tokens_cached(&self, id: &str, text: &str) -> usize {
        let key = (id.to_string(), hash_content(text));
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(&count) = cache.entries.get(&key) {
                cache.hits += 1;
                return count;
            }
            cache.misses += 1;
        }

        let count = self.count_tokens(text);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.entries.len() >= MAX_CACHE_ENTRIES {
            trace!("Token cache full ({MAX_CACHE_ENTRIES} entries), clearing");
            cache.entries.clear();
        }
        cache.entries.insert(key, count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero() {
        let counter = HeuristicTokenCounter::default();
        assert_eq!(counter.count_tokens(""), 0);
    }

    #[test]
    fn rounds_up_partial_tokens() {
        let counter = HeuristicTokenCounter::default();
        assert_eq!(counter.count_tokens("abc"), 1);
        assert_eq!(counter.count_tokens(&"x".repeat(35)), 10);
        assert_eq!(counter.count_tokens(&"x".repeat(36)), 11);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let counter = HeuristicTokenCounter::with_ratio(1.0);
        assert_eq!(counter.count_tokens("héllo"), 5);
    }

    #[test]
    fn invalid_ratio_uses_default() {
        let counter = HeuristicTokenCounter::with_ratio(0.0);
        assert!((counter.chars_per_token() - DEFAULT_CHARS_PER_TOKEN).abs() < f64::EPSILON);
    }

    #[test]
    fn cached_counts_hit_on_repeat() {
        let counter = HeuristicTokenCounter::default();
        let a = counter.count_tokens_cached("msg-1", "hello world");
        let b = counter.count_tokens_cached("msg-1", "hello world");
        assert_eq!(a, b);
        let stats = counter.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn edited_content_is_recounted() {
        let counter = HeuristicTokenCounter::with_ratio(1.0);
        assert_eq!(counter.count_tokens_cached("msg-1", "abc"), 3);
        assert_eq!(counter.count_tokens_cached("msg-1", "abcdef"), 6);
        assert_eq!(counter.stats().misses, 2);
    }

    #[test]
    fn conversation_includes_overhead() {
        let counter = HeuristicTokenCounter::with_ratio(1.0);
        let msgs = vec![Message::user("abcd"), Message::assistant("ef")];
        assert_eq!(
            counter.count_conversation_tokens(&msgs),
            4 + 2 + 2 * MESSAGE_OVERHEAD_TOKENS
        );
    }

    #[test]
    fn stored_count_is_trusted() {
        let counter = HeuristicTokenCounter::default();
        let mut msg = Message::user("anything");
        msg.token_count = Some(42);
        assert_eq!(counter.count_message_tokens(&msg), 42);
    }
}
