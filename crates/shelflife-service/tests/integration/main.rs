// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod cleanup;
pub mod config;
pub mod snapshots;
pub mod utils;

pub use utils::*;
