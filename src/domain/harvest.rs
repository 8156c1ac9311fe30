//! Incremental extraction of fresh rows from repeatedly fetched feeds
//!
//! Sources covered by this algorithm serve the whole feed on every fetch
//! instead of a diff. The harvester remembers the newest row time seen so
//! far together with the literal rows sharing that time, which makes a
//! re-fetch safe even when the source reorders same-instant rows or sneaks
//! in late duplicates near the boundary.

use crate::library::storage::{StateError, StateSchema};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

/// Time layout used by state files written before the envelope format
const LEGACY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Persisted bookkeeping that makes re-fetch based collection incremental
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestState {
    /// Time of the newest row emitted so far, absent before the first run
    #[serde(default)]
    pub newest_row_time: Option<DateTime<Utc>>,
    /// Literal text of every emitted row sharing the newest row time
    #[serde(default)]
    pub newest_rows: HashSet<String>,
    /// Running total of emitted rows, used for consistency checking
    #[serde(default)]
    pub rows_count: Option<u64>,
}

impl StateSchema for HarvestState {
    const VERSION: u32 = 1;

    fn upgrade(version: u32, payload: Value) -> Result<Value, StateError> {
        match version {
            // Legacy states used short keys and a space separated time layout
            0 => {
                let mut upgraded = Map::new();

                if let Value::Object(legacy) = payload {
                    for (key, value) in legacy {
                        match key.as_str() {
                            "time" => {
                                upgraded.insert("newest_row_time".into(), upgrade_time(value));
                            }
                            "rows" => {
                                upgraded.insert("newest_rows".into(), value);
                            }
                            "count" => {
                                upgraded.insert("rows_count".into(), value);
                            }
                            _ => {
                                upgraded.insert(key, value);
                            }
                        }
                    }
                }

                Ok(Value::Object(upgraded))
            }
            other => Err(StateError::NoUpgradePath(other)),
        }
    }
}

fn upgrade_time(value: Value) -> Value {
    let parsed = value
        .as_str()
        .and_then(|raw| NaiveDateTime::parse_from_str(raw, LEGACY_TIME_FORMAT).ok())
        .map(|naive| Utc.from_utc_datetime(&naive));

    match parsed {
        Some(time) => Value::String(time.to_rfc3339()),
        None => value,
    }
}

/// Reaction to an inconsistency between the feed and the persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Log the inconsistency and keep going
    Warn,
    /// Abort the run so an operator can inspect the source
    Fatal,
}

impl Default for MismatchPolicy {
    fn default() -> Self {
        MismatchPolicy::Warn
    }
}

/// Inconsistency detected while comparing a batch against the state
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HarvestError {
    /// The number of rows served by the source does not add up
    #[error(
        "the source served {current} datable rows where {expected} were expected \
         ({previous} previously emitted plus {fresh} fresh ones)"
    )]
    RowCountMismatch {
        /// Datable rows found in the current batch
        current: u64,
        /// Previously emitted rows plus fresh rows of this run
        expected: u64,
        /// Rows emitted by all previous runs
        previous: u64,
        /// Rows accepted in this run
        fresh: u64,
    },

    /// The same row text was accepted as fresh more than once in one batch
    #[error("duplicate row within one batch: {0:?}")]
    DuplicateRow(String),
}

/// One row accepted as not previously emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshRow {
    /// Time marker extracted from the row
    pub time: DateTime<Utc>,
    /// Literal row text
    pub text: String,
}

/// Outcome of a single harvesting run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harvest {
    /// Rows to emit, ordered oldest to newest
    pub fresh: Vec<FreshRow>,
    /// State to persist once the rows have been published
    pub state: HarvestState,
}

/// Selects fresh rows from a full re-fetch of a time ordered feed
///
/// Rows strictly older than the remembered newest row time are dropped,
/// strictly newer ones accepted. Rows matching the boundary exactly are
/// accepted only when their literal text has not been emitted before.
pub struct TimeOrderedHarvester<F> {
    extract_time: F,
    mismatch_policy: MismatchPolicy,
}

impl<F> TimeOrderedHarvester<F>
where
    F: Fn(&str) -> Option<DateTime<Utc>>,
{
    /// Creates a harvester using the given row time extractor
    ///
    /// Rows for which the extractor yields no time (headers, comments,
    /// malformed lines) do not participate in harvesting at all.
    pub fn new(extract_time: F) -> Self {
        Self {
            extract_time,
            mismatch_policy: MismatchPolicy::default(),
        }
    }

    /// Replaces the reaction to detected inconsistencies
    pub fn with_mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.mismatch_policy = policy;
        self
    }

    /// Runs one harvesting pass over a freshly fetched batch of rows
    pub fn harvest<'a, I>(&self, state: &HarvestState, rows: I) -> Result<Harvest, HarvestError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut fresh: Vec<FreshRow> = Vec::new();
        let mut accepted: HashSet<&str> = HashSet::new();
        let mut duplicate: Option<String> = None;
        let mut datable_rows: u64 = 0;

        for text in rows {
            let time = match (self.extract_time)(text) {
                Some(time) => time,
                None => continue,
            };

            datable_rows += 1;

            let is_fresh = match state.newest_row_time {
                None => true,
                Some(boundary) if time < boundary => false,
                Some(boundary) if time > boundary => true,
                Some(_) => !state.newest_rows.contains(text),
            };

            if !is_fresh {
                continue;
            }

            if !accepted.insert(text) {
                duplicate.get_or_insert_with(|| text.to_string());
                continue;
            }

            fresh.push(FreshRow {
                time,
                text: text.to_string(),
            });
        }

        // Stable by insertion order, so equal-time rows keep the feed order
        fresh.sort_by_key(|row| row.time);

        if let Some(text) = duplicate {
            self.report(HarvestError::DuplicateRow(text))?;
        }

        if let Some(previous) = state.rows_count {
            let expected = previous + fresh.len() as u64;

            if datable_rows != expected {
                self.report(HarvestError::RowCountMismatch {
                    current: datable_rows,
                    expected,
                    previous,
                    fresh: fresh.len() as u64,
                })?;
            }
        }

        Ok(Harvest {
            state: self.advance_state(state, &fresh),
            fresh,
        })
    }

    fn advance_state(&self, state: &HarvestState, fresh: &[FreshRow]) -> HarvestState {
        let newest_row_time = match fresh.last() {
            Some(row) => Some(row.time),
            None => state.newest_row_time,
        };

        let mut newest_rows = if newest_row_time == state.newest_row_time {
            state.newest_rows.clone()
        } else {
            HashSet::new()
        };

        for row in fresh {
            if Some(row.time) == newest_row_time {
                newest_rows.insert(row.text.clone());
            }
        }

        HarvestState {
            newest_row_time,
            newest_rows,
            rows_count: Some(state.rows_count.unwrap_or(0) + fresh.len() as u64),
        }
    }

    fn report(&self, error: HarvestError) -> Result<(), HarvestError> {
        match self.mismatch_policy {
            MismatchPolicy::Warn => {
                warn!("{}", error);
                Ok(())
            }
            MismatchPolicy::Fatal => Err(error),
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date_harvester() -> TimeOrderedHarvester<impl Fn(&str) -> Option<DateTime<Utc>>> {
        TimeOrderedHarvester::new(|row: &str| {
            let (_, date) = row.split_once(',')?;
            let naive = date.parse::<chrono::NaiveDate>().ok()?;
            Some(Utc.from_utc_datetime(&naive.and_hms_opt(0, 0, 0)?))
        })
    }

    fn texts(harvest: &Harvest) -> Vec<&str> {
        harvest.fresh.iter().map(|row| row.text.as_str()).collect()
    }

    #[test]
    fn accept_every_row_on_the_first_run() {
        let harvester = date_harvester();

        let harvest = harvester
            .harvest(
                &HarvestState::default(),
                vec!["2,2020-01-02", "1,2020-01-01", "# comment"],
            )
            .unwrap();

        assert_eq!(texts(&harvest), vec!["1,2020-01-01", "2,2020-01-02"]);
        assert_eq!(
            harvest.state.newest_row_time,
            Some(Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(harvest.state.rows_count, Some(2));
    }

    #[test]
    fn emit_nothing_when_fed_the_same_batch_twice() {
        let harvester = date_harvester();
        let batch = vec!["1,2020-01-01", "2,2020-01-02"];

        let first = harvester.harvest(&HarvestState::default(), batch.clone()).unwrap();
        let second = harvester.harvest(&first.state, batch).unwrap();

        assert!(second.fresh.is_empty());
        assert_eq!(second.state, first.state);
    }

    #[test]
    fn only_emit_rows_added_since_the_last_run() {
        let harvester = date_harvester();

        let first = harvester
            .harvest(
                &HarvestState::default(),
                vec!["1,2020-01-01", "2,2020-01-02"],
            )
            .unwrap();
        let second = harvester
            .harvest(
                &first.state,
                vec!["1,2020-01-01", "2,2020-01-02", "3,2020-01-03"],
            )
            .unwrap();

        assert_eq!(texts(&second), vec!["3,2020-01-03"]);
        assert_eq!(
            second.state.newest_row_time,
            Some(Utc.with_ymd_and_hms(2020, 1, 3, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn drop_unseen_rows_older_than_the_boundary() {
        let harvester = date_harvester();

        let first = harvester
            .harvest(&HarvestState::default(), vec!["2,2020-01-02"])
            .unwrap();
        let second = harvester
            .harvest(&first.state, vec!["0,2020-01-01", "2,2020-01-02"])
            .unwrap();

        assert!(second.fresh.is_empty());
    }

    #[test]
    fn accept_new_rows_sharing_the_boundary_time() {
        let harvester = date_harvester().with_mismatch_policy(MismatchPolicy::Fatal);

        let first = harvester
            .harvest(&HarvestState::default(), vec!["a,2020-01-02"])
            .unwrap();
        let second = harvester
            .harvest(&first.state, vec!["a,2020-01-02", "b,2020-01-02"])
            .unwrap();

        assert_eq!(texts(&second), vec!["b,2020-01-02"]);
        assert!(second.state.newest_rows.contains("a,2020-01-02"));
        assert!(second.state.newest_rows.contains("b,2020-01-02"));
    }

    #[test]
    fn flag_shrinking_sources_according_to_the_policy() {
        let harvester = date_harvester().with_mismatch_policy(MismatchPolicy::Fatal);

        let first = harvester
            .harvest(
                &HarvestState::default(),
                vec!["1,2020-01-01", "2,2020-01-02"],
            )
            .unwrap();
        let outcome = harvester.harvest(&first.state, vec!["2,2020-01-02"]);

        assert_eq!(
            outcome.unwrap_err(),
            HarvestError::RowCountMismatch {
                current: 1,
                expected: 2,
                previous: 2,
                fresh: 0,
            }
        );

        let lenient = date_harvester();
        assert!(lenient.harvest(&first.state, vec!["2,2020-01-02"]).is_ok());
    }

    #[test]
    fn deduplicate_fresh_rows_within_one_batch() {
        let strict = date_harvester().with_mismatch_policy(MismatchPolicy::Fatal);
        let batch = vec!["1,2020-01-01", "1,2020-01-01"];

        assert_eq!(
            strict.harvest(&HarvestState::default(), batch.clone()),
            Err(HarvestError::DuplicateRow("1,2020-01-01".to_string()))
        );

        let lenient = date_harvester();
        let harvest = lenient.harvest(&HarvestState::default(), batch).unwrap();
        assert_eq!(texts(&harvest), vec!["1,2020-01-01"]);
    }

    #[test]
    fn convert_legacy_state_payloads() {
        let legacy = serde_json::json!({
            "time": "2020-01-02 00:00:00",
            "rows": ["2,2020-01-02"],
        });

        let upgraded = HarvestState::upgrade(0, legacy).unwrap();
        let state: HarvestState = serde_json::from_value(upgraded).unwrap();

        assert_eq!(
            state.newest_row_time,
            Some(Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap())
        );
        assert!(state.newest_rows.contains("2,2020-01-02"));
        assert_eq!(state.rows_count, None);
    }
}
