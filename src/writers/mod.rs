//! Writing refresh reports
//!
//! After the orchestrator finishes its work, it's up to a writer to present
//! the [`RefreshReport`]. It provides a common interface, allowing to report
//! the run without affecting its execution.

pub mod json;
pub mod textstdout;

use clap::{builder::PossibleValue, ValueEnum};

use crate::models::report::RefreshReport;

/// A trait to have a common interface between writers.
/// A writer has the responsibility to present the [`RefreshReport`] in a way,
/// be it on standard output, in a file, or to an API.
pub trait Writer {
    /// Renders the report.
    fn render(&self, report: &RefreshReport) -> String;

    /// Writes the report on standard output.
    fn write(&self, report: &RefreshReport) {
        println!("{}", self.render(report));
    }
}

/// The writers available on the command line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Writers {
    /// TextStdoutWriter
    TextStdout,
    /// JsonWriter
    Json,
}

impl ValueEnum for Writers {
    /// Lists the variants available for clap
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::TextStdout, Self::Json]
    }

    /// Map each value to a possible value in clap
    fn to_possible_value(&self) -> Option<PossibleValue> {
        match &self {
            Self::TextStdout => Some(PossibleValue::new("textstdout")),
            Self::Json => Some(PossibleValue::new("json")),
        }
    }
}
