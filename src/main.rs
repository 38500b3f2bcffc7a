use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use convo_usage::config::{init_config, Config};
use convo_usage::filters::{filter_by_date, filter_by_model, find_by_title};
use convo_usage::inspect::{model_details, transcript};
use convo_usage::loader::load_conversations;
use convo_usage::logging::{init_logging, new_run_id, run_span};
use convo_usage::report::{self, Report, ReportFilters, ReportFormat, ReportMetadata};
use convo_usage::{rollup, Analyzer, BatchOutcome, Conversation, Mode, RollupOptions};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn, Instrument};

#[derive(Parser)]
#[command(name = "convo-usage")]
#[command(about = "Token and cost analysis for exported chat-conversation dumps")]
#[command(version)]
struct Cli {
    /// Export file (JSON array or object) or a directory of .json exports
    #[arg(short, long, global = true, default_value = "conversations.json")]
    input: PathBuf,
    /// Config file, overriding the default search path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Calculation mode: detailed or simple
    #[arg(long, global = true)]
    mode: Option<Mode>,
    /// Only conversations created on or after this date (YYYY-MM-DD)
    #[arg(long, global = true)]
    since: Option<NaiveDate>,
    /// Only conversations created on or before this date (YYYY-MM-DD)
    #[arg(long, global = true)]
    until: Option<NaiveDate>,
    /// Only conversations with an assistant message from this model
    #[arg(long, global = true)]
    model: Option<String>,
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Summary report across all conversations
    Report {
        /// Output format: text, json or csv
        #[arg(long)]
        format: Option<ReportFormat>,
        /// Also write the report to the report directory
        #[arg(long)]
        save: bool,
        /// List every conversation
        #[arg(short, long)]
        verbose: bool,
    },
    /// Conversations with the most real turns
    Top {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Find conversations by title
    Find {
        title: String,
        #[arg(long)]
        case_sensitive: bool,
    },
    /// Show one conversation's transcript and cost
    Show {
        /// Conversation id, or part of its title
        target: String,
    },
    /// Profile the messages produced by one model ("N/A" for none)
    Model { slug: String },
    /// Daily breakdown
    Daily {
        /// Show last N days
        #[arg(long)]
        limit: Option<usize>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Report { .. } => "report",
            Commands::Top { .. } => "top",
            Commands::Find { .. } => "find",
            Commands::Show { .. } => "show",
            Commands::Model { .. } => "model",
            Commands::Daily { .. } => "daily",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let json = cli.json;

    let config = match Config::load_with(cli.config.as_deref()) {
        Ok(config) => init_config(config),
        Err(e) => return handle_error(e, json),
    };
    let _guard = init_logging(config);

    let run_id = new_run_id();
    let command = cli.command.take().unwrap_or(Commands::Report {
        format: None,
        save: false,
        verbose: false,
    });
    let span = run_span(&run_id, command.name());

    match run(cli, command, config, run_id).instrument(span).await {
        Ok(()) => Ok(()),
        Err(e) => handle_error(e, json),
    }
}

async fn run(cli: Cli, command: Commands, config: &'static Config, run_id: String) -> Result<()> {
    let mode = cli.mode.unwrap_or(config.analysis.mode);
    let dataset = load_conversations(&cli.input).await?;
    if dataset.report.skipped > 0 && !cli.json {
        eprintln!("Skipped {} malformed conversations", dataset.report.skipped);
    }

    let mut conversations = filter_by_date(dataset.conversations, cli.since, cli.until, config.report.day_bucket);
    if let Some(model) = &cli.model {
        conversations = filter_by_model(conversations, model);
    }
    info!(conversations = conversations.len(), %mode, "Input selected");

    let analyzer = Analyzer::from_config(config);
    let filters = ReportFilters {
        since: cli.since,
        until: cli.until,
        model: cli.model.clone(),
    };

    match command {
        Commands::Model { slug } => {
            let details = model_details(&conversations, &slug, &analyzer.options().ordering);
            if cli.json {
                print_json(&details, config.report.json_pretty)?;
            } else {
                print!("{}", report::render_model_details(&details));
            }
        }
        Commands::Show { target } => {
            let conversation = find_conversation(&conversations, &target)
                .with_context(|| format!("No conversation matches '{}'", target))?;
            let result = analyzer.analyze(conversation, mode);
            let entries = transcript(conversation, &analyzer.options().ordering);
            if cli.json {
                print_json(
                    &serde_json::json!({"result": result, "transcript": entries}),
                    config.report.json_pretty,
                )?;
            } else {
                print!("{}", report::render_transcript(&result, &entries));
            }
        }
        Commands::Report { format, save, verbose } => {
            let outcome = analyze_cancellable(analyzer, conversations, mode).await?;
            let summary = rollup(&outcome.results, &config.report.rollup_options());
            let format = if cli.json {
                ReportFormat::Json
            } else {
                format.unwrap_or(config.report.format)
            };

            let report = Report {
                metadata: ReportMetadata {
                    generated_at: Utc::now(),
                    run_id,
                    mode,
                    filters,
                    total_conversations: outcome.results.len(),
                    cancelled: outcome.cancelled,
                },
                summary,
                conversations: outcome.results,
            };

            print!("{}", report.render(format, config.report.json_pretty, verbose)?);
            if format == ReportFormat::Json {
                println!();
            }
            if save {
                let path = report.save(&config.report.directory, format, config.report.json_pretty, verbose)?;
                eprintln!("Report saved to {}", path.display());
            }
        }
        Commands::Top { limit } => {
            let outcome = analyze_cancellable(analyzer, conversations, mode).await?;
            let options = RollupOptions {
                top_n: limit.unwrap_or(config.report.top_n),
                ..config.report.rollup_options()
            };
            let summary = rollup(&outcome.results, &options);
            if cli.json {
                print_json(&summary.top_conversations, config.report.json_pretty)?;
            } else {
                print!("{}", report::render_top(&summary));
            }
        }
        Commands::Find { title, case_sensitive } => {
            let outcome = analyze_cancellable(analyzer, conversations, mode).await?;
            let found = find_by_title(&outcome.results, &title, case_sensitive);
            if cli.json {
                print_json(&found, config.report.json_pretty)?;
            } else {
                print!(
                    "{}",
                    report::render_results(&format!("Conversations matching '{}'", title), &found)
                );
            }
        }
        Commands::Daily { limit } => {
            let outcome = analyze_cancellable(analyzer, conversations, mode).await?;
            let summary = rollup(&outcome.results, &config.report.rollup_options());
            if cli.json {
                print_json(&summary.per_day, config.report.json_pretty)?;
            } else {
                print!("{}", report::render_daily(&summary, limit));
            }
        }
    }

    Ok(())
}

/// Runs the batch off the async runtime; Ctrl-C stops it between conversations.
async fn analyze_cancellable(analyzer: Analyzer, conversations: Vec<Conversation>, mode: Mode) -> Result<BatchOutcome> {
    let cancel = Arc::new(AtomicBool::new(false));

    let watcher = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping analysis");
                cancel.store(true, Ordering::Relaxed);
            }
        })
    };

    let span = tracing::Span::current();
    let outcome = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        analyzer.analyze_all(&conversations, mode, &cancel)
    })
    .await
    .context("Analysis task failed")?;

    watcher.abort();
    Ok(outcome)
}

/// Exact id first, then the first title containing `target` (case-insensitive).
fn find_conversation<'a>(conversations: &'a [Conversation], target: &str) -> Option<&'a Conversation> {
    conversations.iter().find(|c| c.id() == target).or_else(|| {
        let needle = target.to_lowercase();
        conversations
            .iter()
            .find(|c| c.title().to_lowercase().contains(&needle))
    })
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

fn handle_error(e: anyhow::Error, json: bool) -> Result<(), anyhow::Error> {
    if json {
        println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
    } else {
        eprintln!("Error: {:#}", e);
    }
    process::exit(1);
}
