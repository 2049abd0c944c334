//! # docsage core
//!
//! Backend-agnostic logic for docsage: the data model, the overlapping
//! chunker, the [`store::Store`] abstraction with an in-memory backend,
//! ranking helpers, the [`embedding::EmbeddingProvider`] trait, and the
//! error taxonomy shared by every component.
//!
//! This crate performs no network, database, or filesystem I/O. The
//! `docsage` application crate supplies the SQLite store, the HTTP
//! embedding providers, and the sync/retrieval orchestration.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;

pub use error::{Error, Result};
