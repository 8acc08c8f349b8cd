mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "evalkit")]
#[command(about = "Evaluate untrusted script snippets in a sandbox")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Source kind accepted by `eval`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Script,
    Typescript,
    /// JSON-encoded compiled document (`{"code": ..., "expressions": [...]}`)
    Document,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate a snippet and print the result as JSON
    Eval {
        /// Source file, or `-` for stdin
        input: String,

        /// How to interpret the input
        #[arg(short, long, value_enum, default_value_t = KindArg::Script)]
        kind: KindArg,

        /// Wall-clock timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Fail every fetch
        #[arg(long, conflicts_with = "allow_domain")]
        block_network: bool,

        /// Only allow fetches to this domain (repeatable)
        #[arg(long = "allow-domain")]
        allow_domain: Vec<String>,

        /// Inject a data binding, `name=<json>` (repeatable)
        #[arg(short, long = "bind")]
        bind: Vec<String>,

        /// Only inject bindings with this name (repeatable)
        #[arg(long = "allow-binding")]
        allow_binding: Vec<String>,

        /// JSON file seeding the `db` binding (object of id -> document)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Expose `db` without set/delete
        #[arg(long, requires = "db")]
        db_read_only: bool,

        /// Keep the isolate warm under this id
        #[arg(short, long)]
        worker_id: Option<String>,

        /// Skip the isolation platform and use the in-process interpreter
        #[arg(long)]
        fallback: bool,

        /// Engine configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the type-stripped form of a typed script
    Strip {
        /// Source file, or `-` for stdin
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Eval {
            input,
            kind,
            timeout_ms,
            block_network,
            allow_domain,
            bind,
            allow_binding,
            db,
            db_read_only,
            worker_id,
            fallback,
            config,
            verbose,
        } => {
            init_logging(verbose);
            let args = commands::EvalArgs {
                input,
                kind,
                timeout_ms,
                block_network,
                allow_domains: allow_domain,
                bindings: bind,
                allow_bindings: allow_binding,
                db,
                db_read_only,
                worker_id,
                fallback,
                config,
            };
            let result = commands::execute_eval(args).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Strip { input } => {
            let source = commands::read_input(&input)?;
            println!("{}", evalkit_sandbox::strip_types(&source)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}
