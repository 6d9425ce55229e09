//! Campaigner: bulk email campaign delivery engine.
//!
//! Takes a batch of rendered messages and delivers them through a
//! transactional email provider under concurrency, rate, and quota limits,
//! with bounded retries and per-provider (or per-domain) circuit breaking.
//!
//! See `DESIGN.md` for the architecture overview.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;

pub mod delivery;
pub mod providers;

pub mod recipients;
pub mod template;

pub mod campaign;
pub mod store;
