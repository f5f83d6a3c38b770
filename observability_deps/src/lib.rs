//! This crate exists to coordinate versions of `tracing` across the workspace.
//!
//! Dependencies should log through this re-export rather than depending on
//! `tracing` directly so that the facade can be swapped or pinned in one
//! place.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
