//! # knowbase
//!
//! A local-first personal knowledge base. Point it at directories of
//! Obsidian notes, PDFs, and EPUBs; it keeps a SQLite index of their text,
//! answers questions grounded in what it finds, and remembers the
//! conversation so follow-up questions work.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────┐
//! │ Directories │──▶│  Pipeline   │──▶│  SQLite   │
//! │ md/pdf/epub │   │ Chunk+Embed │   │ FTS5+Vec  │
//! └─────────────┘   └─────────────┘   └─────┬─────┘
//!                                           │ retrieve
//!                                     ┌─────▼─────┐
//!                                     │    LLM    │
//!                                     └─────┬─────┘
//!                         ┌─────────────────┤
//!                         ▼                 ▼
//!                    ┌──────────┐     ┌──────────┐
//!                    │   CLI    │     │   HTTP   │
//!                    │  (kb)    │     │  (axum)  │
//!                    └──────────┘     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb init                         # create database
//! kb update                       # index every configured directory
//! kb ask "What are burping methods?"
//! kb chat                         # follow-up questions
//! kb serve                        # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`connector_fs`] | Directory scanning |
//! | [`extract`] | PDF and EPUB text extraction |
//! | [`markdown`] | Obsidian front matter, tags, and wiki links |
//! | [`ingest`] | Index update: scan, dedup, chunk, prune |
//! | [`embedding`] | Embedding providers |
//! | [`search`] | Keyword, semantic, and hybrid search |
//! | [`llm`] | Language model providers |
//! | [`query`] | Retrieval-augmented answers |
//! | [`chat`] | Interactive chat |
//! | [`server`] | HTTP API |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` |

pub mod chat;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod extract;
pub mod get;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod markdown;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod query;
pub mod search;
pub mod server;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
