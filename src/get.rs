//! `kb get <id>`: print one indexed document with its chunks.

use anyhow::{bail, Result};

use knowbase_core::store::{DocumentResponse, Store};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

pub async fn get_document(store: &SqliteStore, id: &str) -> Result<DocumentResponse> {
    match store.get_document(id).await? {
        Some(doc) => Ok(doc),
        None => bail!("document not found: {}", id),
    }
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let doc = get_document(&store, id).await;
    store.pool().close().await;
    let doc = doc?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!(
        "title:        {}",
        doc.title.as_deref().unwrap_or("(untitled)")
    );
    println!("source:       {}", doc.source);
    println!("path:         {}", doc.source_id);
    if let Some(url) = &doc.source_url {
        println!("url:          {}", url);
    }
    if let Some(author) = &doc.author {
        println!("author:       {}", author);
    }
    println!("created_at:   {}", doc.created_at);
    println!("updated_at:   {}", doc.updated_at);
    println!("content_type: {}", doc.content_type);
    if let Some(tags) = doc.metadata.get("tags").and_then(|t| t.as_array()) {
        if !tags.is_empty() {
            let names: Vec<&str> = tags.iter().filter_map(|t| t.as_str()).collect();
            println!("tags:         {}", names.join(", "));
        }
    }
    if let Some(links) = doc.metadata.get("links").and_then(|t| t.as_array()) {
        if !links.is_empty() {
            let names: Vec<&str> = links.iter().filter_map(|t| t.as_str()).collect();
            println!("links:        {}", names.join(", "));
        }
    }
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("[chunk {}]", chunk.index);
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}
