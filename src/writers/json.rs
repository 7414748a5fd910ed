//! Write the [`RefreshReport`] as JSON
//! It presents the report in a JSON format and prints it on STDOUT.

use log::error;

use super::Writer;
use crate::models::report::RefreshReport;

/// A writer to print the report as JSON.
pub struct JsonWriter {}

impl JsonWriter {
    /// Create a new JsonWriter
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for JsonWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer for JsonWriter {
    fn render(&self, report: &RefreshReport) -> String {
        match serde_json::to_string_pretty(report) {
            Ok(json) => json,
            Err(e) => {
                error!("Error while serializing the report to JSON: {}", e);
                String::from("{}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::report::{ShardOutcome, ShardReport};
    use crate::models::ShardKey;
    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};

    #[test]
    fn report_is_a_json_object() {
        let started = "2024-05-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut report = RefreshReport::new("ghsa", "/var/cache/ghsa", "ghsa-", started);
        report.shards.push(ShardReport {
            shard: ShardKey::Modified,
            outcome: ShardOutcome::Skipped("shutdown requested".to_string()),
            fetched: 0,
            records: 0,
            watermark: None,
        });

        let value: Value = serde_json::from_str(&JsonWriter::new().render(&report)).unwrap();
        assert_eq!("ghsa", value["feed"]);
        assert_eq!("ghsa-", value["prefix"]);
        assert_eq!(false, value["interrupted"]);
        assert_eq!(
            json!({
                "shard": "modified",
                "outcome": {"status": "skipped", "reason": "shutdown requested"},
                "fetched": 0,
                "records": 0,
                "watermark": null,
            }),
            value["shards"][0]
        );
    }
}
