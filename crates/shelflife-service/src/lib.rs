//! A TTL cache with stale-while-revalidate, stampede protection and durable snapshot fallback.
//!
//! The entry point is [`caching::Cacher`], usually obtained from the [`caching::Caches`]
//! composition root built from a [`config::Config`]. See the [`caching`] module for how the
//! layers fit together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;
