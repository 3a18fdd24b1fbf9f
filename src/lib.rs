//! # Collection Mirror
//!
//! Mirrors a private collection-management API into a public, read-only
//! collection API.
//!
//! The sync pipeline fetches records page by page from the private
//! upstream, relocates media assets out of signed expiring URLs into
//! public object storage, strips private fields, and writes each record
//! as a JSON file in the archive. A SQLite FTS5 index is maintained
//! incrementally and serves full-text search. The read API serves only
//! local state and keeps working when the upstream is down.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────┐   ┌───────────┐
//! │ Upstream │──▶│  Sync pipeline        │──▶│  Archive   │
//! │ (private)│   │ relocate + transform  │   │ JSON files │
//! └──────────┘   └───────────┬───────────┘   └─────┬─────┘
//!                            │                     │
//!                            ▼                     ▼
//!                     ┌────────────┐        ┌────────────┐
//!                     │ Object     │        │ FTS5 index │
//!                     │ storage    │        └─────┬──────┘
//!                     └────────────┘              ▼
//!                                           ┌────────────┐
//!                                           │  HTTP API  │
//!                                           └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! colm init                     # create archive layout and search index
//! colm sync                     # incremental sync from upstream
//! colm sync --full              # ignore the watermark, walk everything
//! colm search "mad max"
//! colm serve                    # start the public read API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy per pipeline stage |
//! | [`retry`] | Bounded retry with exponential backoff |
//! | [`upstream`] | Paginated client for the private source API |
//! | [`store`] | Object storage (S3-compatible) |
//! | [`relocate`] | Idempotent asset relocation |
//! | [`transform`] | Private record → public schema |
//! | [`archive`] | Per-record JSON archive, diff, watermark, run lock |
//! | [`index`] | SQLite FTS5 search index |
//! | [`sync`] | Sync orchestration |
//! | [`server`] | Public read API |

pub mod archive;
pub mod config;
pub mod error;
pub mod index;
pub mod models;
pub mod relocate;
pub mod retry;
pub mod server;
pub mod store;
pub mod sync;
pub mod transform;
pub mod upstream;
