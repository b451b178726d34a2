//! # knowbase core
//!
//! Shared, I/O-free logic for knowbase: data models, chunking, the store
//! abstraction, the hybrid search algorithm, conversation history, and
//! prompt assembly for retrieval-augmented answers.
//!
//! This crate contains no tokio runtime, sqlx, HTTP clients, or filesystem
//! access. The `knowbase` application crate wires these pieces to SQLite,
//! the connectors, and the embedding and LLM providers.

pub mod chunk;
pub mod conversation;
pub mod embedding;
pub mod models;
pub mod prompt;
pub mod search;
pub mod store;
