//! Keeps a local, year-sharded mirror of vulnerability feeds up to date.
//!
//! Each run fetches only what changed upstream since the previous one, merges
//! it with the cached shards and rewrites them with integrity metadata.

pub mod application;
pub mod errors;
pub mod models;
pub mod readers;
pub mod vulnerabilities;
pub mod writers;

#[cfg(test)]
mod testing;
