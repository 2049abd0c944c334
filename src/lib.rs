//! # docsage
//!
//! A local document index and retrieval engine for grounded chat answers.
//!
//! docsage keeps a durable, incrementally updated semantic index over a
//! directory of Markdown, Word, and PDF documents, and serves ranked,
//! size-bounded context for an answer-generating LLM.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────┐
//! │ source.rs  │──▶│ loader.rs  │──▶│ chunk (core) │──▶│ Embedding│
//! │ walk+hash  │   │ md/docx/pdf│   │ overlapping  │   │  client  │
//! └────────────┘   └────────────┘   └──────────────┘   └────┬─────┘
//!                                                          ▼
//!                    ┌──────────┐   query   ┌──────────────────────┐
//!                    │ Retriever│◀─────────▶│ Store (SQLite / mem) │
//!                    └──────────┘           └──────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docsage init                                  # write config, create index
//! docsage sync                                  # index ./documents
//! docsage ask "What is the retention policy?"   # print ranked context
//! docsage status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`source`] | Source tree scanning |
//! | [`loader`] | Document text extraction and normalization |
//! | [`embedding`] | Embedding providers and the batching/retrying client |
//! | [`sqlite_store`] | SQLite-backed [`Store`](docsage_core::store::Store) |
//! | [`sync`] | Index synchronization |
//! | [`retrieve`] | Query-time ranking and context assembly |
//! | [`engine`] | Library facade |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod retrieve;
pub mod source;
pub mod sqlite_store;
pub mod sync;

pub use docsage_core::{Error, Result};
