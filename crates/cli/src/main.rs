use anyhow::{Context, Result};
use chquery::{adhoc, compile_with_max_depth, format_query};
use chquery::{AdHocFilter, DateTimeType, QueryOptions, Target, TimeRange, Variable};
use chrono::{Duration, Utc};
use clap::Parser;
use config::Config;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// ClickHouse dashboard query compiler
#[derive(Parser, Debug)]
#[command(name = "chquery")]
#[command(about = "Compile dashboard query templates into ClickHouse SQL", long_about = None)]
struct Args {
    /// Compile a single query and exit
    #[arg(short, long)]
    exec: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Range start in unix seconds (default: one hour ago)
    #[arg(long)]
    from: Option<i64>,

    /// Range end in unix seconds (default: now)
    #[arg(long)]
    to: Option<i64>,

    /// JSON file with ad-hoc filters: [{"key", "operator", "value"}]
    #[arg(long)]
    filters: Option<PathBuf>,

    /// JSON file with dashboard variables: [{"name", "current", "multi", "includeAll", "options"}]
    #[arg(long)]
    variables: Option<PathBuf>,

    /// Only pretty-print queries instead of compiling them
    #[arg(short, long)]
    format: bool,
}

/// Everything a query needs besides its text
struct Session {
    config: Config,
    date_time_type: DateTimeType,
    options: QueryOptions,
    format_only: bool,
}

impl Session {
    fn new(args: &Args) -> Result<Self> {
        let config = Config::load(args.config.as_deref())?;
        config.validate().context("Invalid configuration")?;

        let date_time_type: DateTimeType = config
            .target
            .date_time_type
            .parse()
            .context("Invalid target date_time_type")?;

        let now = Utc::now().timestamp();
        let to = args.to.unwrap_or(now);
        let from = args
            .from
            .unwrap_or(to - Duration::hours(1).num_seconds());
        anyhow::ensure!(from <= to, "Range start {} is after range end {}", from, to);
        let range = TimeRange::from_timestamps(from, to)
            .with_context(|| format!("Invalid time range {}..{}", from, to))?;

        let mut options = QueryOptions::new(range);
        options.interval = config.compiler.panel_interval.clone();
        if let Some(path) = &args.filters {
            options.adhoc_filters = read_json::<Vec<AdHocFilter>>(path)?;
        }
        if let Some(path) = &args.variables {
            options.variables = read_json::<Vec<Variable>>(path)?;
        }
        debug!(
            from,
            to,
            filters = options.adhoc_filters.len(),
            variables = options.variables.len(),
            "session ready"
        );

        Ok(Self {
            config,
            date_time_type,
            options,
            format_only: args.format,
        })
    }

    fn target(&self, query: &str) -> Target {
        let defaults = &self.config.target;
        Target {
            query: query.to_string(),
            database: defaults.database.clone(),
            table: defaults.table.clone(),
            date_col: defaults.date_col.clone(),
            date_time_col: defaults.date_time_col.clone(),
            date_time_type: self.date_time_type,
            interval: defaults.interval.clone(),
            interval_factor: defaults.interval_factor,
            round: defaults.round.clone(),
        }
    }

    fn run(&self, query: &str) -> Result<String> {
        if self.format_only {
            return format_query(query);
        }
        compile_with_max_depth(
            &self.target(query),
            &self.options,
            self.config.compiler.max_depth,
        )
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn main() -> Result<()> {
    // Initialize tracing subscriber with environment filter
    // Set RUST_LOG environment variable to control log level
    // Example: RUST_LOG=info or RUST_LOG=chquery=debug
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
                .add_directive("rustyline=error".parse()?),
        )
        .init();

    let args = Args::parse();
    let session = Session::new(&args)?;

    // If --exec flag is provided, compile the query and exit
    if let Some(query) = &args.exec {
        println!("{}", session.run(query)?);
        return Ok(());
    }

    println!("chquery REPL");
    println!("Type 'exit' or 'quit' to exit, '\\h' for help\n");

    // Setup history file path
    let history_file = get_history_file_path();

    // Create rustyline editor
    let mut rl = DefaultEditor::new().context("Failed to create readline editor")?;

    // Load history from file if it exists
    if history_file.exists() {
        rl.load_history(&history_file)
            .context("Failed to load history file")?;
    }

    // REPL loop
    loop {
        let readline = rl.readline("chquery> ");
        match readline {
            Ok(line) => {
                let line = line.trim();

                // Skip empty lines
                if line.is_empty() {
                    continue;
                }

                // Add to history
                let _ = rl.add_history_entry(line);

                // Check for exit commands
                if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
                    save_history(&mut rl, &history_file);
                    println!("Goodbye!");
                    break;
                }

                // Check for help command
                if line == "\\h" {
                    print_help();
                    continue;
                }

                // Ad-hoc key discovery query
                if line == "\\k" {
                    println!(
                        "{}",
                        adhoc::columns_query(&session.config.compiler.adhoc_default_database)
                    );
                    continue;
                }

                let result = match line.strip_prefix("\\f") {
                    Some(query) => format_query(query.trim()),
                    None => session.run(line),
                };
                match result {
                    Ok(sql) => {
                        println!("{}", sql);
                    }
                    Err(e) => {
                        error!("Query compilation failed: {:#}", e);
                        eprintln!("Error: {:#}", e);
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                save_history(&mut rl, &history_file);
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                save_history(&mut rl, &history_file);
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                save_history(&mut rl, &history_file);
                error!("Readline error: {:?}", err);
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

fn get_history_file_path() -> PathBuf {
    // Try to use home directory, otherwise use current directory
    if let Some(home) = dirs::home_dir() {
        home.join(".chquery_history")
    } else {
        PathBuf::from(".chquery_history")
    }
}

fn save_history(rl: &mut DefaultEditor, history_file: &Path) {
    rl.save_history(history_file)
        .context("Failed to save history file")
        .unwrap_or_else(|e| {
            warn!("Could not save history: {}", e);
            eprintln!("Warning: Could not save history: {}", e);
        });
}

fn print_help() {
    println!("chquery REPL Help:");
    println!("  exit, quit    - Exit the REPL");
    println!("  \\h            - Show this help message");
    println!("  \\k            - Print the ad-hoc filter key discovery query");
    println!("  \\f <query>    - Pretty-print a query without compiling it");
    println!("  <query>       - Compile a query template into SQL");
    println!("\nExample queries:");
    println!("  SELECT $timeSeries AS t, count() FROM $table WHERE $timeFilter GROUP BY t ORDER BY t");
    println!("  $rate(countIf(Type = 200) AS good, countIf(Type != 200) AS bad) FROM $table");
    println!("  $columns(OSName, count() c) FROM $table");
    println!("  $perSecond(BytesReceived) FROM $table");
}
