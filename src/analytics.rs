//! Usage analytics rebuilt from the success log.
//!
//! The whole log is re-read on every report; nothing is cached or indexed.

use crate::event_log::{LogEvent, LogRecord, LogStream, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-model call counts and mean latency in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub model_usage: BTreeMap<String, u64>,
    pub average_time: BTreeMap<String, f64>,
}

impl AnalyticsReport {
    /// Fold raw log lines into a report; lines that are not success events are skipped.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut totals: BTreeMap<String, (u64, f64)> = BTreeMap::new();

        for line in lines {
            let Some(record) = LogRecord::parse(line.as_ref()) else {
                continue;
            };
            if let LogEvent::Success { model, duration } = record.event {
                let entry = totals.entry(model).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += duration.as_secs_f64();
            }
        }

        let mut report = AnalyticsReport::default();
        for (model, (count, total_secs)) in totals {
            report
                .average_time
                .insert(model.clone(), total_secs / count as f64);
            report.model_usage.insert(model, count);
        }
        report
    }
}

/// Reads the success stream and produces [`AnalyticsReport`]s.
#[derive(Debug, Clone)]
pub struct AnalyticsAggregator {
    success_log: LogStream,
}

impl AnalyticsAggregator {
    pub fn new(success_log: LogStream) -> Self {
        Self { success_log }
    }

    pub fn report(&self) -> Result<AnalyticsReport> {
        let lines = self.success_log.read_lines()?;
        Ok(AnalyticsReport::from_lines(&lines))
    }
}
