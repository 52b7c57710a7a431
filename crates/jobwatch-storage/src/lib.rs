//! HTTP fetch utilities and the job persistence store for jobwatch.

mod http;
mod memory;
mod postgres;
mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FailureClass, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, SimpleTokenBucket, TokenBucketConfig,
};
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{ChangeSet, JobStore, StoreError, Touch};

pub const CRATE_NAME: &str = "jobwatch-storage";
