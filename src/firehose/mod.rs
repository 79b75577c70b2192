/// Firehose ingestion
///
/// Subscribes to the upstream `com.atproto.sync.subscribeRepos` stream,
/// decodes every frame and applies its ops to the store. The persisted
/// cursor only ever advances past frames that have been fully handled.
pub mod client;
pub mod frame;
pub mod processor;

pub use client::{FirehoseClient, FirehoseHandle, IngestSnapshot, IngestStatus};
