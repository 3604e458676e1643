//! HTTP transfer engine
//!
//! Layered as: manager (registry and control signals) -> task (segment
//! planning, merge, verify) -> workers (one ranged stream each), with
//! the token-bucket governor and the sqlite record store shared across
//! all of them.

mod download_task;
mod manager;
mod persistence;
mod rate_limiter;
mod segment_worker;

pub use download_task::{plan_segments, HttpTransferTask};
pub use manager::TransferManager;
pub use persistence::RecordStore;
pub use rate_limiter::{BandwidthGovernor, RateLimiter};
pub use segment_worker::{part_path, SegmentWorker};
