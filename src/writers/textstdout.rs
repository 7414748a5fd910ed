//! Write the [`RefreshReport`] to standard output
//! It is the default writer, it presents the outcome of each shard in a
//! text format and prints it on STDOUT.

use chrono::SecondsFormat;

use super::Writer;
use crate::models::report::RefreshReport;
use crate::models::ShardKey;

/// A writer to print the report in the terminal.
pub struct TextStdoutWriter {}

impl TextStdoutWriter {
    /// Create a new TextStdoutWriter
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for TextStdoutWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer for TextStdoutWriter {
    fn render(&self, report: &RefreshReport) -> String {
        let mut lines = vec![format!(
            "----------{} -> {} ({})----------\n",
            report.feed, report.directory, report.prefix
        )];
        for shard in &report.shards {
            let watermark = shard
                .watermark
                .map(|w| w.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_else(|| "unchanged".to_string());
            lines.push(format!(
                "[{}{}] {}: {} records, {} fetched, watermark {}",
                report.prefix, shard.shard, shard.outcome, shard.records, shard.fetched, watermark
            ));
        }
        let years = report
            .shards
            .iter()
            .filter(|s| matches!(s.shard, ShardKey::Year(_)))
            .count();
        lines.push(String::new());
        lines.push(format!(
            "{}/{} year shards refreshed{}",
            report.succeeded(),
            years,
            if report.interrupted { ", interrupted" } else { "" }
        ));
        lines.join("\n")
    }
}
