//! Outbound integrations with external services

pub mod rating;

pub use rating::{HttpRatingReporter, LogRatingReporter, MatchOutcome, MatchResultSink};
