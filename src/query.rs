//! Retrieval-augmented answers: `kb ask`, `kb chat`, and `POST /query`.
//!
//! 1. Resolve the language model for the question.
//! 2. Retrieve up to `retrieval.context_chunks` passages. Follow-up
//!    questions are retrieved together with the previous user question so
//!    "and for newborns?" still finds the right notes.
//! 3. With no passages, return the fixed no-context answer without calling
//!    the model.
//! 4. Otherwise send system prompt, the last `chat.history_turns` turns, and
//!    the numbered passages plus question to the model.

use anyhow::{bail, Result};
use serde::Serialize;

use knowbase_core::conversation::{ChatTurn, Role};
use knowbase_core::embedding::EmbeddingProvider;
use knowbase_core::models::ContextPassage;
use knowbase_core::prompt::{build_messages, NO_CONTEXT_ANSWER};
use knowbase_core::search::{retrieve_passages, SearchMode, SearchRequest};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::llm::{self, Completion};
use crate::search::{default_mode, query_vector, search_params};
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub question: String,
    /// One of `llm.models`; `None` uses the default model.
    pub model: Option<String>,
    /// Earlier turns, oldest first. Only the most recent are used.
    pub history: Vec<ChatTurn>,
    pub source: Option<String>,
    pub mode: Option<SearchMode>,
}

/// A cited passage, numbered as in the answer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub n: usize,
    pub document_id: String,
    pub title: Option<String>,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub model: String,
    pub sources: Vec<SourceRef>,
}

fn source_refs(passages: &[ContextPassage]) -> Vec<SourceRef> {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| SourceRef {
            n: i + 1,
            document_id: p.document_id.clone(),
            title: p.title.clone(),
            source: p.source.clone(),
            source_id: p.source_id.clone(),
            source_url: p.source_url.clone(),
            score: p.score,
        })
        .collect()
}

/// Text used for retrieval: the question, prefixed by the last user turn.
fn retrieval_text(question: &str, history: &[ChatTurn]) -> String {
    match history.iter().rev().find(|t| t.role == Role::User) {
        Some(prev) => format!("{} {}", prev.content.trim(), question),
        None => question.to_string(),
    }
}

pub async fn answer_query(
    config: &Config,
    store: &SqliteStore,
    embedder: Option<&dyn EmbeddingProvider>,
    req: &QueryRequest,
) -> Result<QueryAnswer> {
    let question = req.question.trim();
    if question.is_empty() {
        bail!("question must not be empty");
    }

    let model = llm::resolve_model(&config.llm, req.model.as_deref())?;

    let keep = config.chat.history_turns;
    let history = &req.history[req.history.len().saturating_sub(keep)..];
    let passages = retrieve(config, store, embedder, req, question, history).await?;

    if passages.is_empty() {
        tracing::info!("no passages for question; answering without the model");
        return Ok(QueryAnswer {
            answer: NO_CONTEXT_ANSWER.to_string(),
            model: model.model_name().to_string(),
            sources: Vec::new(),
        });
    }

    let messages = build_messages(question, history, &passages);
    tracing::debug!(
        "asking {} with {} passages and {} history turns",
        model.model_name(),
        passages.len(),
        history.len()
    );
    let answer = model
        .complete(&Completion {
            messages: &messages,
            passages: &passages,
        })
        .await?;

    Ok(QueryAnswer {
        answer,
        model: model.model_name().to_string(),
        sources: source_refs(&passages),
    })
}

async fn retrieve(
    config: &Config,
    store: &SqliteStore,
    embedder: Option<&dyn EmbeddingProvider>,
    req: &QueryRequest,
    question: &str,
    history: &[ChatTurn],
) -> Result<Vec<ContextPassage>> {
    let text = retrieval_text(question, history);
    let mut mode = req.mode.unwrap_or_else(|| default_mode(config));

    let query_vec = match query_vector(mode, embedder, &text).await {
        Ok(v) => v,
        // The default hybrid mode degrades to keyword search when the
        // embedding backend is unreachable; an explicit mode does not.
        Err(e) if req.mode.is_none() => {
            tracing::warn!("query embedding failed, using keyword search: {:#}", e);
            mode = SearchMode::Keyword;
            None
        }
        Err(e) => return Err(e),
    };

    let request = SearchRequest {
        query: &text,
        query_vec: query_vec.as_deref(),
        mode,
        source_filter: req.source.as_deref(),
        since: None,
        params: search_params(config, config.retrieval.context_chunks as i64),
        explain: false,
    };
    retrieve_passages(store, &request).await
}

/// Build the embedder for question answering, if embeddings are on.
pub fn query_embedder(config: &Config) -> Option<Box<dyn EmbeddingProvider>> {
    if !config.embedding.is_enabled() {
        return None;
    }
    match embedding::create_provider(&config.embedding) {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!("embedding provider unavailable: {:#}", e);
            None
        }
    }
}

pub fn print_sources(sources: &[SourceRef]) {
    if sources.is_empty() {
        return;
    }
    println!();
    println!("Sources:");
    for s in sources {
        println!(
            "  [{}] {} ({}, {})",
            s.n,
            s.title.as_deref().unwrap_or(&s.source_id),
            s.source,
            s.source_id
        );
    }
}

/// `kb ask`: one question, no history.
pub async fn run_ask(
    config: &Config,
    question: &str,
    model: Option<String>,
    source: Option<String>,
    show_sources: bool,
) -> Result<()> {
    let embedder = query_embedder(config);
    let store = SqliteStore::new(db::connect(config).await?);

    let req = QueryRequest {
        question: question.to_string(),
        model,
        source,
        ..Default::default()
    };
    let answer = answer_query(config, &store, embedder.as_deref(), &req).await;
    store.pool().close().await;
    let answer = answer?;

    println!("{}", answer.answer);
    if show_sources {
        print_sources(&answer.sources);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::tests::{doc, memory_store};
    use knowbase_core::chunk::chunk_text;
    use knowbase_core::store::Store;

    fn config() -> Config {
        toml::from_str("[db]\npath = \"unused.sqlite\"").unwrap()
    }

    async fn seeded() -> SqliteStore {
        let store = memory_store().await;
        let notes = [
            ("Burping.md", "Burping methods: over the shoulder, sitting on the lap, or face down across the knees."),
            ("Sleep.md", "Newborns sleep 14 to 17 hours a day in short stretches."),
        ];
        for (sid, body) in notes {
            let d = doc("filesystem:vault", sid, body, 1);
            let id = store.upsert_document(&d).await.unwrap();
            store
                .replace_chunks(&id, &chunk_text(&id, body, 700, 0))
                .await
                .unwrap();
        }
        store
    }

    fn ask(question: &str) -> QueryRequest {
        QueryRequest {
            question: question.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn extractive_answer_cites_retrieved_notes() {
        let store = seeded().await;
        let answer = answer_query(&config(), &store, None, &ask("What are burping methods?"))
            .await
            .unwrap();
        assert_eq!(answer.model, "extractive");
        assert_eq!(answer.sources[0].source_id, "Burping.md");
        assert!(answer.answer.contains("over the shoulder"));
    }

    #[tokio::test]
    async fn nothing_relevant_gives_fixed_answer() {
        let store = seeded().await;
        let answer = answer_query(&config(), &store, None, &ask("quantum chromodynamics"))
            .await
            .unwrap();
        assert_eq!(answer.answer, NO_CONTEXT_ANSWER);
        assert!(answer.sources.is_empty());
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let store = seeded().await;
        assert!(answer_query(&config(), &store, None, &ask("   ")).await.is_err());
    }

    #[tokio::test]
    async fn follow_up_uses_previous_question_for_retrieval() {
        let store = seeded().await;
        let req = QueryRequest {
            question: "and how long?".to_string(),
            history: vec![
                ChatTurn {
                    role: Role::User,
                    content: "do newborns sleep much".to_string(),
                },
                ChatTurn {
                    role: Role::Assistant,
                    content: "Yes.".to_string(),
                },
            ],
            ..Default::default()
        };
        let answer = answer_query(&config(), &store, None, &req).await.unwrap();
        assert_eq!(answer.sources[0].source_id, "Sleep.md");
    }

    #[tokio::test]
    async fn unknown_model_is_a_typed_error() {
        let store = seeded().await;
        let req = QueryRequest {
            model: Some("gpt-5-ultra".to_string()),
            ..ask("burping")
        };
        let err = answer_query(&config(), &store, None, &req).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<llm::LlmError>(),
            Some(llm::LlmError::UnknownModel { .. })
        ));
    }

    #[test]
    fn retrieval_text_prefixes_last_user_turn() {
        let history = vec![ChatTurn {
            role: Role::User,
            content: "colic remedies".to_string(),
        }];
        assert_eq!(retrieval_text("for newborns?", &history), "colic remedies for newborns?");
        assert_eq!(retrieval_text("q", &[]), "q");
    }
}
