//! Collection of time-ordered remote feeds into raw pipeline messages

mod client;
mod options;

pub use client::{DownloadError, FeedClient, FeedSource};
pub use options::Options;

use crate::domain::harvest::{HarvestState, MismatchPolicy, TimeOrderedHarvester};
use crate::domain::message::{RawKind, SourceLabel};
use crate::harness::{Collector, InputRecord};
use crate::library::storage::{StateKey, StateStore};
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use log::{debug, info};
use serde_json::Map;

/// Collector that downloads a feed and publishes only rows it has not
/// emitted before
///
/// The harvest state survives across executions in a [`StateStore`], keyed by
/// the source label. It is only persisted once a run has handed every fresh
/// row to the broker, so an aborted run simply re-collects on the next
/// attempt.
pub struct FeedCollector<S: FeedSource> {
    source: SourceLabel,
    feed: S,
    store: StateStore,
    key: StateKey,
    state: HarvestState,
    pending: Option<HarvestState>,
    mismatch_policy: MismatchPolicy,
    time_column: usize,
    time_format: String,
}

impl<S: FeedSource> FeedCollector<S> {
    /// Opens the collector, loading any previously persisted harvest state
    pub fn open(options: &Options, feed: S) -> Result<Self, BoxedError> {
        let store = StateStore::open(&options.state_dir)?;
        let key = StateKey::new(module_path!(), &options.source.to_string());
        let state = store.load_or_default(&key)?;

        Ok(Self {
            source: options.source.clone(),
            feed,
            store,
            key,
            state,
            pending: None,
            mismatch_policy: options.mismatch_policy(),
            time_column: options.time_column,
            time_format: options.time_format.clone(),
        })
    }

    /// Harvest state as of the last completed run
    pub fn state(&self) -> &HarvestState {
        &self.state
    }

    fn row_time(&self, row: &str) -> Option<DateTime<Utc>> {
        let column = row.split(',').nth(self.time_column)?.trim();

        let naive = NaiveDateTime::parse_from_str(column, &self.time_format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(column, &self.time_format)
                    .ok()
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })?;

        Some(Utc.from_utc_datetime(&naive))
    }
}

#[async_trait]
impl<S: FeedSource> Collector for FeedCollector<S> {
    type Pile = String;

    fn source(&self) -> &SourceLabel {
        &self.source
    }

    fn kind(&self) -> RawKind {
        RawKind::File
    }

    async fn obtain_input_pile(&mut self) -> Result<Option<Self::Pile>, BoxedError> {
        let body = self.feed.fetch().await?;

        if body.is_empty() {
            return Ok(None);
        }

        Ok(Some(String::from_utf8_lossy(&body).into_owned()))
    }

    fn generate_input_records(&mut self, pile: Self::Pile) -> Result<Vec<InputRecord>, BoxedError> {
        let harvester = TimeOrderedHarvester::new(|row: &str| self.row_time(row))
            .with_mismatch_policy(self.mismatch_policy);

        let rows = pile.lines().map(str::trim).filter(|row| !row.is_empty());
        let harvest = harvester.harvest(&self.state, rows)?;

        debug!(
            "Harvested {} fresh rows from '{}'",
            harvest.fresh.len(),
            self.source
        );

        let records = harvest
            .fresh
            .iter()
            .map(|row| InputRecord {
                raw: row.text.clone().into_bytes(),
                created: row.time,
                meta: Map::new(),
            })
            .collect();

        self.pending = Some(harvest.state);

        Ok(records)
    }

    async fn after_completed_publishing(&mut self) -> EmptyResult {
        if let Some(state) = self.pending.take() {
            self.store.save(&self.key, &state)?;
            self.state = state;
            info!("Persisted harvest state for '{}'", self.source);
        }

        Ok(())
    }
}
