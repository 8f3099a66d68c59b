//! Typed client for the batch job service REST API.

mod client;
pub mod types;

pub use client::{
    ACCESS_TOKEN_EXPIRED, JOB_IN_QUEUE, JobClient, JobSpec, LogStream, RetryPolicy,
};
pub use types::*;
