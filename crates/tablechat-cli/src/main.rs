//! tablechat: headless chat driver for table exploration.
//!
//! Reads questions and `:commands` from stdin, streams answers to stdout,
//! and keeps a per-table selection that attached queries highlight into.
//!
//! Usage:
//!   cargo run -p tablechat-cli -- --table cars
//!   cargo run -p tablechat-cli -- --base-url http://db-host:8000 --ws-url ws://db-host:8000/ws/chat-client
//!
//! Logs go to stderr; set RUST_LOG=tablechat_client=debug for wire detail.

mod commands;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tablechat_client::{ChatSession, Config, ConnectionStatus};
use tablechat_state::{Applied, Conversation, MergeReport, QueryContext};
use tablechat_types::USER_ROLE;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, fmt};

use commands::{HELP, Input, Target};

#[derive(Parser, Debug)]
#[command(name = "tablechat")]
#[command(about = "Ask questions about database tables and highlight the answers")]
struct Args {
    /// Config file (default: $TABLECHAT_CONFIG or the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend HTTP base URL, overrides the config file
    #[arg(long)]
    base_url: Option<String>,

    /// Chat websocket URL, overrides the config file
    #[arg(long)]
    ws_url: Option<String>,

    /// Document name sent with each question
    #[arg(long)]
    pdf: Option<String>,

    /// Table to open at start-up
    #[arg(short, long)]
    table: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    tracing::info!(
        base_url = %config.server.base_url,
        ws_url = %config.server.ws_url,
        "connecting"
    );
    let mut session = ChatSession::connect(&config)
        .await
        .context("starting chat session")?;

    if let Some(table) = &args.table {
        open(&mut session, table, 1).await?;
    }
    eprintln!("type :help for commands");

    let result = drive(&mut session).await;
    session.connection().close().await;
    tracing::info!("tablechat shutting down");
    result
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::load_default().context("loading config")?,
    };
    if let Some(url) = &args.base_url {
        config.server.base_url.clone_from(url);
    }
    if let Some(url) = &args.ws_url {
        config.server.ws_url.clone_from(url);
    }
    if let Some(pdf) = &args.pdf {
        config.chat.pdf_name = Some(pdf.clone());
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Main loop: stdin lines, stream events, and status changes.
async fn drive(session: &mut ChatSession) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut events = session.subscribe_events();
    let mut status = session.connection().subscribe_status();
    let mut printer = StreamPrinter::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match commands::parse(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => {
                        if let Err(e) = run(session, input).await {
                            eprintln!("error: {e:#}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("{e}"),
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let applied = session.apply_event(&event);
                    printer.show(applied, session.conversation())?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "fell behind the event stream");
                }
                Err(RecvError::Closed) => break,
            },
            change = status.recv() => match change {
                Ok(change) => eprintln!("[{}]", describe(&change)),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

async fn run(session: &mut ChatSession, input: Input) -> Result<()> {
    match input {
        Input::Chat(text) => session.send(&text).await?,
        Input::Tables => {
            for name in session.list_tables().await? {
                println!("{name}");
            }
        }
        Input::Open { table, page } => open(session, &table, page).await?,
        Input::Page(page) => {
            let table = open_table_name(session)?;
            open(session, &table, page).await?;
        }
        Input::Query => {
            let report = session.run_attached_query().await?;
            print_report(&report);
        }
        Input::Sql(sql) => {
            let report = session.run_query(&sql, &QueryContext::new(USER_ROLE)).await?;
            print_report(&report);
        }
        Input::Select(target) => select(session, target)?,
        Input::Selection => print_selection(session)?,
        Input::Clear => {
            let table = open_table_name(session)?;
            session.selection_mut().clear_table(&table);
            println!("selection cleared");
        }
        Input::Usage => {
            let usage = session.conversation().total_usage();
            println!(
                "tokens: {} in, {} out, {} total",
                usage.input_tokens, usage.output_tokens, usage.total_tokens
            );
        }
        Input::Reconnect => session.connection().reconnect().await?,
        Input::Reset => {
            session.reset_thread().await?;
            println!("started a new conversation");
        }
        Input::Help => println!("{HELP}"),
        // Handled by the caller.
        Input::Quit => {}
    }
    Ok(())
}

async fn open(session: &mut ChatSession, table: &str, page: u32) -> Result<()> {
    let opened = session
        .open_table(table, page)
        .await
        .with_context(|| format!("opening {table}"))?;
    println!(
        "{} page {}/{} ({} rows)",
        opened.name, opened.page.page, opened.page.total_pages, opened.page.total_rows
    );
    Ok(())
}

fn open_table_name(session: &ChatSession) -> Result<String> {
    session
        .table()
        .map(|t| t.name.clone())
        .ok_or_else(|| anyhow!("no table open (use :open <table>)"))
}

fn select(session: &mut ChatSession, target: Target) -> Result<()> {
    let table = open_table_name(session)?;
    let selected = match target {
        Target::Row(row_id) => session.selection_mut().toggle_row(&table, &row_id),
        Target::Cell { row_id, column } => {
            let value = session
                .selection()
                .schema(&table)
                .ok_or_else(|| anyhow!("no page loaded for {table}"))?
                .cell_value(&row_id, &column);
            session
                .selection_mut()
                .toggle_cell(&table, &row_id, &column, value)?
        }
        Target::Column(column) => {
            let index = session
                .selection()
                .schema(&table)
                .and_then(|s| s.columns().iter().position(|c| *c == column))
                .ok_or_else(|| anyhow!("unknown column {column}"))?;
            let page = session.table().map_or(1, |t| t.page.page);
            session
                .selection_mut()
                .toggle_column(&table, &column, index, page)
        }
    };
    println!("{}", if selected { "selected" } else { "deselected" });
    Ok(())
}

fn print_selection(session: &ChatSession) -> Result<()> {
    let table = open_table_name(session)?;
    let Some(sel) = session.selection().table(&table).filter(|s| !s.is_empty()) else {
        println!("nothing selected in {table}");
        return Ok(());
    };
    for row in sel.rows() {
        println!("row    {}", row.row_id);
    }
    for cell in sel.cells() {
        println!("cell   {} {} = {}", cell.row_id, cell.column, cell.value);
    }
    for column in sel.columns() {
        println!("column {} (#{} on page {})", column.column, column.column_index, column.page);
    }
    Ok(())
}

fn print_report(report: &MergeReport) {
    if report.is_noop() && report.off_page_rows.is_empty() {
        println!("no new matches");
        return;
    }
    println!(
        "highlighted {} rows and {} cells",
        report.rows_added, report.cells_added
    );
    if !report.off_page_rows.is_empty() {
        println!("{} matches are on other pages", report.off_page_rows.len());
    }
}

fn describe(status: &ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Connected => "connected".to_string(),
        ConnectionStatus::Disconnected => "disconnected".to_string(),
        ConnectionStatus::Reconnecting { attempt } => format!("reconnecting (attempt {attempt})"),
        ConnectionStatus::Error(e) => format!("connection error: {e}"),
    }
}

/// Writes streamed message content to stdout as it grows.
#[derive(Default)]
struct StreamPrinter {
    shown: String,
}

impl StreamPrinter {
    fn show(&mut self, applied: Applied, conversation: &Conversation) -> std::io::Result<()> {
        let Some(msg) = conversation.last() else {
            return Ok(());
        };
        let mut out = std::io::stdout().lock();
        match applied {
            Applied::Ignored => return Ok(()),
            Applied::Opened => {
                self.shown.clear();
                write!(out, "{}> ", msg.role)?;
            }
            Applied::Updated | Applied::Completed => {}
        }

        // Cumulative deltas and the final text usually extend what is on
        // screen; anything else is reprinted on a fresh line.
        match msg.content.strip_prefix(self.shown.as_str()) {
            Some(rest) => write!(out, "{rest}")?,
            None => write!(out, "\n{}", msg.content)?,
        }
        self.shown.clone_from(&msg.content);

        if applied == Applied::Completed {
            writeln!(out)?;
            if let Some(elapsed) = &msg.elapsed_time {
                writeln!(out, "  ({elapsed}s, {} tokens)", msg.total_tokens())?;
            }
            if let Some(query) = &msg.attached_query {
                let label = msg.query_label.as_deref().unwrap_or(query);
                writeln!(out, "  query: {label} (:query to highlight)")?;
            }
        }
        out.flush()
    }
}
