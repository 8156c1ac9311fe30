//! Identity and labelling of raw data messages

use crate::library::helpers::split_into_two;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Error raised when a source label does not have the expected shape
#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a valid source label, expected 'provider.channel'")]
pub struct InvalidSourceLabel(String);

/// Identifier of a data source in `provider.channel` notation
///
/// The label doubles as part of the routing key of published messages, so
/// both segments have to be non-empty, free of whitespace and must not
/// contain further dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceLabel {
    provider: String,
    channel: String,
}

impl SourceLabel {
    /// Organisation or system providing the data
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Concrete feed or channel within the provider
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl FromStr for SourceLabel {
    type Err = InvalidSourceLabel;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (provider, channel) =
            split_into_two(input, ".").ok_or_else(|| InvalidSourceLabel(input.to_string()))?;

        let segment_valid =
            |segment: &str| !segment.is_empty() && !segment.contains(['.', ' '].as_ref());

        if !segment_valid(&provider) || !segment_valid(&channel) {
            return Err(InvalidSourceLabel(input.to_string()));
        }

        Ok(Self { provider, channel })
    }
}

impl TryFrom<String> for SourceLabel {
    type Error = InvalidSourceLabel;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

impl From<SourceLabel> for String {
    fn from(label: SourceLabel) -> Self {
        label.to_string()
    }
}

impl fmt::Display for SourceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.provider, self.channel)
    }
}

/// Category of raw data published by a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawKind {
    /// Continuously flowing event data
    Stream,
    /// Periodically fetched documents
    File,
    /// Blacklist snapshots that supersede previous ones
    Blacklist,
}

impl Default for RawKind {
    fn default() -> Self {
        RawKind::Stream
    }
}

impl RawKind {
    /// Wire representation used in the `type` message property
    pub fn as_str(&self) -> &'static str {
        match self {
            RawKind::Stream => "stream",
            RawKind::File => "file",
            RawKind::Blacklist => "blacklist",
        }
    }
}

impl fmt::Display for RawKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Derives the deterministic message id for a piece of raw data
///
/// The id has to be reproducible so that a re-run over the same input
/// produces identical ids which downstream deduplication can rely on. It is
/// not a cryptographic fingerprint.
pub fn stable_message_id(source: &SourceLabel, created: &DateTime<Utc>, body: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();

    source.provider.hash(&mut hasher);
    source.channel.hash(&mut hasher);
    created.timestamp().hash(&mut hasher);
    created.timestamp_subsec_nanos().hash(&mut hasher);
    body.hash(&mut hasher);

    format!("{:016x}", hasher.finish())
}
