//! AMQP topic-exchange pattern matching.
//!
//! Routing keys are dot-separated words. In a binding pattern `*` matches
//! exactly one word and `#` matches zero or more words.

/// Returns true if `routing_key` matches the binding `pattern`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => {
                match_words(rest, key_rest)
            }
            _ => false,
        },
    }
}

/// Checks that a binding pattern is well formed: non-empty words only.
pub(crate) fn is_valid_pattern(pattern: &str) -> bool {
    !pattern.is_empty() && pattern.split('.').all(|word| !word.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(!topic_matches("order.created", "order.cancelled"));
        assert!(!topic_matches("order.created", "order.created.v2"));
    }

    #[test]
    fn star_matches_one_word() {
        assert!(topic_matches("order.*", "order.created"));
        assert!(topic_matches("*.reserved", "inventory.reserved"));
        assert!(!topic_matches("order.*", "order"));
        assert!(!topic_matches("order.*", "order.created.v2"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("#", "payment.failed"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("order.#", "order.created"));
        assert!(topic_matches("order.#", "order.created.v2"));
        assert!(topic_matches("#.failed", "payment.failed"));
        assert!(!topic_matches("order.#", "inventory.reserved"));
    }

    #[test]
    fn validates_patterns() {
        assert!(is_valid_pattern("order.*"));
        assert!(is_valid_pattern("#"));
        assert!(!is_valid_pattern(""));
        assert!(!is_valid_pattern("order..created"));
    }
}
