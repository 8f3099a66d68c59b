// Aggregates all former standalone integration tests as modules.
mod client;
mod object_store;
mod staging;
mod support;
