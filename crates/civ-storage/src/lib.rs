//! Durable record storage (SQLite) and HTTP fetch utilities for the civic pipeline.

mod analytics;
mod http;
mod records;
mod store;

pub use analytics::{CategoryCount, ClassCounts, DailyClassCounts, DailyCount, OwnerRanking};
pub use http::{
    is_transient_status, BackoffPolicy, FetchError, FetchRequest, HttpClientConfig, HttpFetcher,
    Transport,
};
pub use records::{Record, SCHEMA};
pub use store::{Condition, Order, RecordStore, Select, SqlValue, StoreError};
