//! Various small helper functions

use std::num::ParseIntError;
use std::time::Duration;

/// Splits the input string into two parts at the first occurence of the separator
pub fn split_into_two(input: &str, separator: &'static str) -> Option<(String, String)> {
    let parts: Vec<&str> = input.splitn(2, separator).collect();

    if parts.len() != 2 {
        return None;
    }

    Some((parts[0].to_string(), parts[1].to_string()))
}

/// Parses a Duration from a string containing seconds.
/// Useful for command line parsing
pub fn parse_seconds(src: &str) -> Result<Duration, ParseIntError> {
    let seconds = src.parse::<u64>()?;
    Ok(Duration::from_secs(seconds))
}

/// Splits a comma separated list into trimmed, non-empty items
pub fn split_comma_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn split_at_the_first_separator() {
        assert_eq!(
            split_into_two("provider.channel.extra", "."),
            Some(("provider".to_string(), "channel.extra".to_string()))
        );
        assert_eq!(split_into_two("no-separator", "."), None);
    }

    #[test]
    fn normalize_comma_lists() {
        assert_eq!(
            split_comma_list(" parsed, enriched ,,"),
            vec!["parsed".to_string(), "enriched".to_string()]
        );
        assert!(split_comma_list("").is_empty());
    }
}
