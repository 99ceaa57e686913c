//! The Lifecycle Engine (§4.6): sharded `lc.N` shard objects, each
//! storing a header (`start_date`, `marker`) and an omap queue of
//! `{bucket_key -> LcEntry}`, driven through a random-permutation
//! per-shard sweep that expires/aborts objects and multipart uploads
//! per bucket lifecycle policy.
//!
//! Grounded on `datasync`'s `ShardController` for the per-shard
//! acquire/drain/release loop structure, and on `datasync`'s bounded
//! `buffer_unordered` fan-out for the non-versioned expiration
//! worker-pool.

mod client;
mod engine;
mod headers;
mod objects;
mod process;
mod scheduling;
mod shard;
mod types;

pub use client::{LifecycleObjectClient, ListedObject, MultipartUpload};
pub use engine::LifecycleEngine;
pub use headers::rgwlc_s3_expiration_header;
pub use process::{bucket_lc_process, ProcessConfig};
pub use scheduling::Schedule;
pub use shard::{bucket_lc_prepare, ShardHeader};
pub use types::{obj_has_expired, EntryStatus, Expiration, LcEntry, LcPolicy, LcRule, ProcessOutcome};
