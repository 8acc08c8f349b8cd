//! CLI command implementations

use crate::KindArg;
use anyhow::{anyhow, bail, Context, Result};
use evalkit_sandbox::{
    BindingSet, CompiledDocument, DbContext, EngineConfig, EvaluateOptions, EvaluationResult,
    Evaluator, MemoryDb, NetworkPosture, SourceUnit, ThreadIsolatePlatform,
};
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Arguments of the `eval` subcommand
#[derive(Debug, Clone)]
pub struct EvalArgs {
    pub input: String,
    pub kind: KindArg,
    pub timeout_ms: Option<u64>,
    pub block_network: bool,
    pub allow_domains: Vec<String>,
    pub bindings: Vec<String>,
    pub allow_bindings: Vec<String>,
    pub db: Option<PathBuf>,
    pub db_read_only: bool,
    pub worker_id: Option<String>,
    pub fallback: bool,
    pub config: Option<PathBuf>,
}

/// Read a source file, or stdin when the path is `-`
pub fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read stdin")?;
        return Ok(source);
    }
    std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))
}

/// Split `name=<json>`; a value that is not valid JSON is taken as a string
pub fn parse_binding(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Binding '{}' must have the form name=<json>", raw))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Binding '{}' has an empty name", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn load_db(path: &PathBuf, read_only: bool) -> Result<Arc<dyn DbContext>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read db file {}", path.display()))?;
    let seed: Value = serde_json::from_str(&text)
        .with_context(|| format!("Db file {} is not valid JSON", path.display()))?;
    let db = Arc::new(MemoryDb::from_json(seed)?);
    debug!(documents = db.len(), read_only, "Loaded db seed");
    Ok(if read_only {
        Arc::new(db.read_only())
    } else {
        db
    })
}

fn source_unit(kind: KindArg, source: String) -> Result<SourceUnit> {
    Ok(match kind {
        KindArg::Script => SourceUnit::script(source),
        KindArg::Typescript => SourceUnit::typed(source),
        KindArg::Document => {
            let document: CompiledDocument = serde_json::from_str(&source)
                .context("Document input must be a JSON compiled document")?;
            SourceUnit::document(document.to_script())
        }
    })
}

/// Build the options for one evaluation from the command line
pub fn build_options(args: &EvalArgs, config: &EngineConfig) -> Result<EvaluateOptions> {
    let mut bindings = BindingSet::new();
    for raw in &args.bindings {
        let (name, value) = parse_binding(raw)?;
        bindings = bindings.data(name, value)?;
    }

    let mut policy = config.security.clone();
    if args.block_network {
        policy = policy.with_network(NetworkPosture::Blocked);
    } else if !args.allow_domains.is_empty() {
        policy = policy.with_network(NetworkPosture::AllowListed(args.allow_domains.clone()));
    }
    if !args.allow_bindings.is_empty() {
        policy = policy.with_bindings_allow_list(args.allow_bindings.iter().cloned());
    }

    let mut options = EvaluateOptions::new()
        .with_bindings(bindings)
        .with_security(policy);
    if let Some(timeout_ms) = args.timeout_ms {
        options = options.with_timeout_ms(timeout_ms);
    }
    if let Some(path) = &args.db {
        options = options.with_db(load_db(path, args.db_read_only)?);
    }
    if let Some(worker_id) = &args.worker_id {
        options = options.with_worker_id(worker_id.clone());
    }
    Ok(options)
}

/// Execute the `eval` command
pub async fn execute_eval(args: EvalArgs) -> Result<EvaluationResult> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let unit = source_unit(args.kind, read_input(&args.input)?)?;
    let options = build_options(&args, &config)?;

    let builder = Evaluator::builder().config(config);
    let evaluator = if args.fallback {
        builder.build()
    } else {
        builder.platform(ThreadIsolatePlatform::new()).build()
    };

    info!(
        evaluation_id = %unit.id,
        path = %evaluator.dispatch_decision().path,
        "Running eval command"
    );
    let result = evaluator.evaluate(&unit, options).await?;
    evaluator.registry().unload_all().await;
    Ok(result)
}
