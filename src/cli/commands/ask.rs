use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{check_threshold, open_orchestrator, spinner};
use crate::cli::output::{Formatter, get_formatter};
use crate::error::RetrievalError;
use crate::models::{ChatMessage, ChatbotResponse, Config, OutputFormat};
use crate::services::{HttpCompletionProvider, ResponseAssembler, RetrievalOrchestrator};

#[derive(Debug, Args)]
pub struct AskArgs {
    #[arg(help = "Question to answer; omit with --interactive")]
    pub question: Option<String>,

    #[arg(long = "top-k", short = 'k', help = "Clauses passed to the model")]
    pub top_k: Option<usize>,

    #[arg(long, short = 't', help = "Minimum similarity score (0.0-1.0)")]
    pub threshold: Option<f32>,

    #[arg(long, help = "Do not print the cited clauses")]
    pub no_sources: bool,

    #[arg(long, short = 'i', help = "Keep asking questions, with conversation history")]
    pub interactive: bool,
}

struct Session {
    orchestrator: RetrievalOrchestrator,
    assembler: ResponseAssembler,
    top_k: Option<usize>,
    threshold: Option<f32>,
    format: OutputFormat,
}

impl Session {
    async fn answer(&self, question: &str, history: &[ChatMessage]) -> Result<ChatbotResponse> {
        let pb = spinner(self.format, "Thinking");
        let result = self.answer_inner(question, history).await;
        pb.finish_and_clear();
        result
    }

    async fn answer_inner(
        &self,
        question: &str,
        history: &[ChatMessage],
    ) -> Result<ChatbotResponse> {
        let results = match self
            .orchestrator
            .search(question, self.top_k, self.threshold)
            .await
        {
            Err(RetrievalError::NotInitialized) => {
                anyhow::bail!("nothing indexed yet; run `policy-rag ingest <path>` first")
            }
            other => other.context("retrieval failed")?,
        };

        self.assembler
            .answer(&results.query, &results.matches, history)
            .await
            .context("failed to generate answer")
    }
}

pub async fn handle_ask(
    args: AskArgs,
    config: &Config,
    format: OutputFormat,
    verbose: bool,
) -> Result<()> {
    check_threshold(args.threshold)?;
    if args.question.is_none() && !args.interactive {
        anyhow::bail!("provide a question or use --interactive");
    }

    let formatter = get_formatter(format);
    let provider = HttpCompletionProvider::new(&config.generation)
        .context("completion provider is not configured")?;
    let session = Session {
        orchestrator: open_orchestrator(config).await?,
        assembler: ResponseAssembler::new(Arc::new(provider), config.generation.history_window),
        top_k: args.top_k,
        threshold: args.threshold,
        format,
    };

    if verbose {
        eprintln!("Model: {}", config.generation.model);
        eprintln!("History window: {}", config.generation.history_window);
    }

    let mut history = Vec::new();
    if let Some(question) = args.question.as_deref() {
        let response = session.answer(question, &history).await?;
        print!("{}", formatter.format_answer(&response, !args.no_sources));
        remember(&mut history, &response);
    }

    if args.interactive {
        run_interactive(&session, formatter.as_ref(), !args.no_sources, history).await?;
    }
    Ok(())
}

fn remember(history: &mut Vec<ChatMessage>, response: &ChatbotResponse) {
    history.push(ChatMessage::user(response.query.clone()));
    history.push(ChatMessage::assistant(response.answer.clone()));
}

async fn run_interactive(
    session: &Session,
    formatter: &dyn Formatter,
    show_sources: bool,
    mut history: Vec<ChatMessage>,
) -> Result<()> {
    eprintln!("Ask about the policy. Type `exit` or press Ctrl+D to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        std::io::stderr().flush().ok();

        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        match session.answer(question, &history).await {
            Ok(response) => {
                println!("{}", formatter.format_answer(&response, show_sources));
                remember(&mut history, &response);
            }
            Err(e) => eprintln!("{}", formatter.format_error(&format!("{:#}", e))),
        }
    }
    Ok(())
}
