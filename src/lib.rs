//! mnemo: a forward HTTP proxy that memoizes upstream responses in SQLite.
//!
//! Concurrent identical requests are collapsed into a single upstream fetch; every later
//! identical request is answered from the store.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
