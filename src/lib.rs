#![forbid(unsafe_code)]

//! Shared library for the GrabTube backend.
//!
//! The crate stays deliberately small: everything with real state or
//! subprocess plumbing lives here (the job registry, the yt-dlp fetcher,
//! URL validation) while `src/bin/backend.rs` only wires HTTP routes
//! around these modules.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod jobs;
pub mod security;
pub mod urls;
