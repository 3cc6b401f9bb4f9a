//! # postsync
//!
//! Incremental sync of long-form articles from a feed into a vector index.
//!
//! Posts are rendered in the user's own browser (so paywalled content is
//! visible), reduced to clean text plus outbound links, split into
//! overlapping word windows, embedded, and upserted under deterministic
//! ids. A SQLite ledger remembers what has been synced so each run only
//! touches new posts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌─────────┐   ┌──────────┐
//! │   Feed   │──▶│ Reconcile │──▶│ Browser  │──▶│ Extract │──▶│  Chunk   │
//! │ RSS/Atom │   │  (ledger) │   │  (CDP)   │   │  (HTML) │   │ overlap  │
//! └──────────┘   └───────────┘   └──────────┘   └─────────┘   └────┬─────┘
//!                                                                  ▼
//!                                ┌──────────┐   ┌──────────┐  ┌──────────┐
//!                                │  Ledger  │◀──│  Upsert  │◀─│  Embed   │
//!                                │ (SQLite) │   │ (index)  │  │ (OpenAI) │
//!                                └──────────┘   └──────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`browser`] | Browser control-protocol client |
//! | [`feed`] | Feed fetching, parsing, and reconciliation |
//! | [`extract`] | Article extraction from rendered HTML |
//! | [`chunk`] | Overlapping word-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_index`] | Vector records and index upsert |
//! | [`ledger`] | Sync records, imported posts, manifests |
//! | [`ingest`] | Pipeline orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`progress`] | Progress reporting on stderr |
//! | [`sources`] | Source listing |
//! | [`status`] | Ledger overview |

pub mod browser;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod feed;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod sources;
pub mod status;
pub mod vector_index;
