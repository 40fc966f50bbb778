use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facttrace_contracts::models::ModelSelector;
use facttrace_engine::{
    default_oracle_registry, CredentialGate, EnvCredentialGate, SessionOrchestrator,
    StaticCredentialGate,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "facttrace", version, about = "FactTrace media verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Analyze(AnalyzeArgs),
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    /// Image or video file to verify.
    #[arg(long)]
    file: PathBuf,
    /// Claim giving the media its context, e.g. "taken yesterday in Paris".
    #[arg(long, default_value = "")]
    claim: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    /// Image or video file to verify and then discuss.
    #[arg(long)]
    file: PathBuf,
    #[arg(long, default_value = "")]
    claim: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("facttrace error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Chat(args) => run_chat(args),
    }
}

fn build_orchestrator(model: Option<String>, events: Option<PathBuf>) -> SessionOrchestrator {
    let provider = ModelSelector::new(None)
        .select(model.as_deref(), "vision")
        .ok()
        .map(|selection| selection.model.provider);
    let credentials: Box<dyn CredentialGate> = if provider.as_deref() == Some("dryrun") {
        Box::new(StaticCredentialGate::ready())
    } else {
        Box::new(EnvCredentialGate)
    };
    let events_path = events.unwrap_or_else(|| PathBuf::from("events.jsonl"));
    SessionOrchestrator::new(default_oracle_registry(), credentials, model, events_path)
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let mut orchestrator = build_orchestrator(args.model, args.events);
    if let Err(failure) = orchestrator.submit_analysis(&args.file, &args.claim) {
        return Err(failure.into());
    }
    let session = orchestrator
        .active_session()
        .context("analysis finished but no session was stored")?;

    let output = json!({
        "report": session.report,
        "verifiedSearchSources": session.verified_sources,
    });
    if args.pretty {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", serde_json::to_string(&output)?);
    }
    Ok(0)
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let mut orchestrator = build_orchestrator(args.model, args.events);
    if let Err(failure) = orchestrator.submit_analysis(&args.file, &args.claim) {
        return Err(failure.into());
    }
    {
        let session = orchestrator
            .active_session()
            .context("analysis finished but no session was stored")?;
        let verdict = serde_json::to_value(session.report.verdict_color)?;
        println!(
            "Verdict: {} - {}",
            verdict.as_str().unwrap_or("UNKNOWN"),
            session.report.status
        );
        println!("{}", session.report.journalist_summary);
    }

    orchestrator.open_chat()?;
    if let Some(greeting) = orchestrator
        .active_session()
        .and_then(|session| session.chat())
        .and_then(|chat| chat.transcript().first())
    {
        println!("analyst> {}", greeting.text);
    }
    println!("Type /quit to exit, /reset to discard the session.");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" || input == "/exit" {
            break;
        }
        if input == "/reset" {
            orchestrator.reset_session()?;
            println!("Session discarded.");
            break;
        }

        let reply = orchestrator.send_chat_message(input)?;
        println!("analyst> {}", reply.text);
    }

    Ok(0)
}
