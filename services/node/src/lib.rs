//! Symphony node library.
//!
//! A node holds one persistent session to the conductor, realizes
//! deployment assignments as managed child processes and streams
//! status and logs back.

pub mod agent;
pub mod backoff;
pub mod conda;
pub mod config;
pub mod cron;
pub mod logs;
pub mod repo;
pub mod resources;
pub mod supervisor;
pub mod tls;
pub mod workload;
