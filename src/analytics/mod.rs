pub mod analyzer;
pub mod api;
pub mod store;

pub use analyzer::{Analyzer, AnalyzerConfig, Anomaly, BackendBaseline, RouteBaseline};
pub use store::{Bucket, TrafficEvent, TrafficStore};
