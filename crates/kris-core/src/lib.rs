//! Client library for submitting jobs to a cloud batch-execution service.
//!
//! Local code and data reach a job through a staging pipeline: directories
//! are zipped, files are uploaded to an object store under a content-derived
//! key, and the object is mirrored onto the service's shared filesystem by a
//! copy job. Every hop is skipped when its result already exists. The job then
//! starts the `kris-agent` binary, which unpacks the project and runs the
//! user's executable (see [`agent`]).

pub mod agent;
pub mod api;
pub mod archive;
pub mod backoff;
pub mod bridge;
pub mod buckets;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod images;
pub mod launch;
pub mod object_store;
pub mod paths;
pub mod poll;
pub mod redact;
pub mod staging;

pub use error::{KrisError, Result};
