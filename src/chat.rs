//! `kb chat`: interactive question answering with follow-ups.
//!
//! Each answer is added to the conversation so follow-up questions are
//! understood in context. Lines starting with `/` are commands.

use anyhow::Result;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

use knowbase_core::conversation::ChatHistory;

use crate::config::Config;
use crate::db;
use crate::ingest::{self, SyncOptions};
use crate::llm;
use crate::progress::ProgressMode;
use crate::query::{self, QueryRequest};
use crate::sqlite_store::SqliteStore;

const HELP: &str = "\
Commands:
  /clear          forget the conversation
  /sources        toggle listing sources under answers
  /model [NAME]   show or switch the model
  /models         list available models
  /update         refresh the index from all sources
  /help           show this help
  /quit           exit";

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Clear,
    Sources,
    Model(Option<&'a str>),
    Models,
    Update,
    Help,
    Quit,
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let rest = line.strip_prefix('/')?;
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, Some(a.trim()).filter(|a| !a.is_empty())),
        None => (rest, None),
    };
    Some(match name {
        "clear" => Command::Clear,
        "sources" => Command::Sources,
        "model" => Command::Model(arg),
        "models" => Command::Models,
        "update" => Command::Update,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => Command::Unknown(other),
    })
}

struct Session {
    history: ChatHistory,
    model: Option<String>,
    show_sources: bool,
}

pub async fn run_chat(config: &Config, model: Option<String>, show_sources: bool) -> Result<()> {
    // Fail before the prompt if the model cannot be used.
    let default_model = llm::resolve_model(&config.llm, model.as_deref())?
        .model_name()
        .to_string();

    let embedder = query::query_embedder(config);
    let store = SqliteStore::new(db::connect(config).await?);
    let mut session = Session {
        history: ChatHistory::new(),
        model,
        show_sources,
    };

    println!(
        "knowbase chat ({}). Ask about your documents; /help for commands.",
        default_model
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(cmd) = parse_command(line) {
            match cmd {
                Command::Quit => break,
                Command::Clear => {
                    session.history.clear();
                    println!("Conversation cleared.");
                }
                Command::Sources => {
                    session.show_sources = !session.show_sources;
                    println!(
                        "Sources {}.",
                        if session.show_sources { "on" } else { "off" }
                    );
                }
                Command::Model(None) => println!(
                    "Model: {}",
                    session
                        .model
                        .as_deref()
                        .unwrap_or(config.llm.default_model())
                ),
                Command::Model(Some(name)) => match llm::resolve_model(&config.llm, Some(name)) {
                    Ok(m) => {
                        session.model = Some(m.model_name().to_string());
                        println!("Model: {}", m.model_name());
                    }
                    Err(e) => println!("error: {}", e),
                },
                Command::Models => {
                    for m in config.llm.available_models() {
                        println!("  {}", m);
                    }
                }
                Command::Update => {
                    let reporter = ProgressMode::default_for_tty().reporter();
                    match ingest::sync_all(
                        config,
                        &store,
                        "all",
                        SyncOptions::default(),
                        reporter.as_ref(),
                    )
                    .await
                    {
                        Ok(report) => {
                            for s in &report.sources {
                                match &s.error {
                                    Some(e) => println!("{}: error: {}", s.source, e),
                                    None => println!(
                                        "{}: {} updated, {} unchanged, {} removed",
                                        s.source, s.upserted, s.unchanged, s.pruned
                                    ),
                                }
                            }
                        }
                        Err(e) => println!("error: {:#}", e),
                    }
                }
                Command::Help => println!("{}", HELP),
                Command::Unknown(name) => println!("Unknown command /{}. Try /help.", name),
            }
            continue;
        }

        let req = QueryRequest {
            question: line.to_string(),
            model: session.model.clone(),
            history: session.history.recent(config.chat.history_turns),
            ..Default::default()
        };
        match query::answer_query(config, &store, embedder.as_deref(), &req).await {
            Ok(answer) => {
                println!("{}", answer.answer);
                if session.show_sources {
                    query::print_sources(&answer.sources);
                }
                println!();
                session.history.push_user(line);
                session.history.push_assistant(answer.answer);
            }
            Err(e) => println!("error: {:#}", e),
        }
    }

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_command("/clear"), Some(Command::Clear));
        assert_eq!(parse_command("/model gpt-4o"), Some(Command::Model(Some("gpt-4o"))));
        assert_eq!(parse_command("/model"), Some(Command::Model(None)));
        assert_eq!(parse_command("/exit"), Some(Command::Quit));
        assert_eq!(parse_command("/bogus"), Some(Command::Unknown("bogus")));
        assert_eq!(parse_command("what about /clear?"), None);
    }
}
