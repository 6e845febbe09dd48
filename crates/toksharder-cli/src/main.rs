//! toksharder - tokenize text datasets into fixed-size token shards
//!
//! Streams records from JSONL, text or Parquet inputs (local or HTTP),
//! encodes them in parallel and writes `shard_NNNNN.npy` files.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "toksharder")]
#[command(about = "Tokenize text datasets into fixed-size token shards")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file path (default: ./toksharder.toml or ~/.config/toksharder/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Read timeout in seconds for stall detection on remote inputs
    #[arg(long, global = true)]
    read_timeout: Option<u64>,

    /// Maximum retry attempts when opening remote inputs
    #[arg(long, global = true)]
    max_retries: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Tokenize inputs and write shards
    Run(cmd::run::RunArgs),
    /// Check the shards in an output directory
    Inspect(cmd::inspect::InspectArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(toksharder_core::ProgressContext::new());

    let multi = progress.is_tty().then(|| progress.multi());
    let verbosity = toksharder_core::Verbosity::from_flags(cli.quiet, cli.debug);
    toksharder_core::init_logging(verbosity, multi);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Config file defaults, CLI overrides
    let http_config = toksharder_core::HttpConfig {
        read_timeout: std::time::Duration::from_secs(
            cli.read_timeout.unwrap_or(config.http.read_timeout),
        ),
        max_retries: cli.max_retries.unwrap_or(config.http.max_retries),
    };
    toksharder_core::set_http_config(http_config);

    match cli.command {
        Command::Run(args) => cmd::run::run(args, &config, &progress),
        Command::Inspect(args) => cmd::inspect::run(args),
        Command::Config => {
            use comfy_table::{
                Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
            };

            let p = &config.pipeline;
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec![
                    Cell::new("Setting").fg(Color::Cyan),
                    Cell::new("Value").fg(Color::Cyan),
                ]);

            table.add_row(vec!["Output directory", &p.output_dir.display().to_string()]);
            table.add_row(vec!["Shard size", &toksharder_core::fmt_num(p.shard_size)]);
            table.add_row(vec!["Shard format", &p.shard_format.to_string()]);
            table.add_row(vec!["Workers", &p.workers.to_string()]);
            table.add_row(vec!["Channel capacity", &p.channel_capacity.to_string()]);
            table.add_row(vec!["Chunk size", &p.chunk_size.to_string()]);
            table.add_row(vec!["Overwrite", &p.overwrite.to_string()]);
            table.add_row(vec!["Encoder", &config.encoder.to_string()]);
            table.add_row(vec!["Text field", &config.input.text_field]);
            table.add_row(vec![
                "Read timeout",
                &format!("{}s", http_config.read_timeout.as_secs()),
            ]);
            table.add_row(vec!["Max retries", &http_config.max_retries.to_string()]);

            let overridden: Vec<&str> = config::ENV_OVERRIDES
                .iter()
                .copied()
                .filter(|name| std::env::var_os(name).is_some())
                .collect();
            if !overridden.is_empty() {
                table.add_row(vec!["Env overrides", &overridden.join(", ")]);
            }

            eprintln!("\n{table}");
            Ok(())
        }
    }
}
