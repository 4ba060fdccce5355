//! Site Archiver library.
//!
//! Archives web pages together with their images, stylesheets, scripts and
//! linked pages into a relocatable offline copy, and packages archived pages
//! as reproducible zip bundles.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod archiver;
pub mod config;
pub mod constants;
pub mod error;
pub mod fetch;
pub mod fs_utils;
pub mod journal;
pub mod retry;

pub use archiver::{ArchiveOptions, ArchivedPage, LinkPolicy, LinkScope, SiteArchiver};
pub use config::Config;
pub use error::{ArchiveError, Result};
pub use fetch::{FetchOptions, Fetcher, RenderMode};
