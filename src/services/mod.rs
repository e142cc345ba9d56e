pub mod alerts;
pub mod evaluator;
pub mod fanout;
pub mod ingest;
pub mod readings;
pub mod thresholds;
