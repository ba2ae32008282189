//! HTTP layer for the npm caching proxy.
//!
//! Recognises registry paths, runs them through the cache-aside controller,
//! and maps outcomes onto the status codes and bodies npm clients expect.

pub mod access_log;
pub mod handler;
pub mod route;
