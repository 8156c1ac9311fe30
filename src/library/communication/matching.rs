//! Topic binding key evaluation
//!
//! Binding keys and routing keys are sequences of words separated by dots.
//! Within a binding key, `*` substitutes exactly one word and `#` substitutes
//! zero or more words. Matching follows the semantics of topic exchanges so
//! that keys resolved against a real broker behave identically against the
//! in-process one.

/// Checks whether a routing key matches a binding key pattern
pub fn matches_topic(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();

    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Greedily try every possible number of consumed words
            (0..=key.len()).any(|consumed| matches_words(rest, &key[consumed..]))
        }
        Some((&"*", rest)) => match key.split_first() {
            Some((_, key_rest)) => matches_words(rest, key_rest),
            None => false,
        },
        Some((word, rest)) => match key.split_first() {
            Some((key_word, key_rest)) => word == key_word && matches_words(rest, key_rest),
            None => false,
        },
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn match_literal_keys() {
        assert!(matches_topic("event.parsed", "event.parsed"));
        assert!(!matches_topic("event.parsed", "event.enriched"));
        assert!(!matches_topic("event.parsed", "event.parsed.extra"));
    }

    #[test]
    fn substitute_exactly_one_word_for_star() {
        assert!(matches_topic("*.parsed.*.*", "event.parsed.provider.channel"));
        assert!(!matches_topic("*.parsed.*.*", "event.parsed.provider"));
        assert!(!matches_topic("*", "two.words"));
    }

    #[test]
    fn substitute_any_number_of_words_for_hash() {
        assert!(matches_topic("#", ""));
        assert!(matches_topic("#", "event.parsed.provider.channel"));
        assert!(matches_topic("event.#", "event"));
        assert!(matches_topic("event.#.channel", "event.parsed.provider.channel"));
        assert!(!matches_topic("event.#.channel", "bl.parsed.provider.channel"));
    }
}
