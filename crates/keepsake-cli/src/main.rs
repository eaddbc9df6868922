use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use keepsake_contracts::generation::{GenerationKind, GenerationRequest};
use keepsake_contracts::jobs::{JobStatus, TrainingRequest};
use keepsake_engine::{EngineConfig, KeepsakeEngine};
use serde_json::{json, Map, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "keepsake",
    version,
    about = "Style-adapter training and avatar generation"
)]
struct Cli {
    #[command(flatten)]
    overrides: ConfigArgs,
    #[command(subcommand)]
    command: Command,
}

/// Flags applied on top of the config file and `KEEPSAKE_*` variables.
#[derive(Debug, Args)]
struct ConfigArgs {
    /// JSON config file.
    #[arg(long, global = true, env = "KEEPSAKE_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Serve everything from the offline stub provider.
    #[arg(long, global = true)]
    stub: bool,
    #[arg(long, global = true)]
    legacy_fallback: bool,
    #[arg(long, global = true)]
    poll_interval: Option<f64>,
    #[arg(long, global = true)]
    max_poll_attempts: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a training job and wait for it unless `--detach` is given.
    Train(TrainArgs),
    /// Show one training job.
    Job { adapter_id: String },
    /// List an owner's training jobs, most recent first.
    Jobs {
        #[arg(long)]
        owner: String,
    },
    /// Show the owner's most recent completed adapter.
    Latest {
        #[arg(long)]
        owner: String,
    },
    /// Recover jobs left unfinished by an earlier process.
    Reconcile {
        /// Keep polling resumed jobs until they finish.
        #[arg(long)]
        wait: bool,
    },
    Generate(GenerateArgs),
    /// Stitch reference images into one grid.
    Stitch(StitchArgs),
    /// Keep the centre panel of a stored multi-panel image.
    Extract {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        uri: String,
        #[arg(long, default_value_t = 3)]
        panels: u32,
    },
    /// Copy a local file into the blob store.
    Upload {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        key: String,
    },
    /// Check whether the primary backend answers.
    Health,
}

#[derive(Debug, Args)]
struct TrainArgs {
    #[arg(long)]
    owner: String,
    /// Blob URI of the training images.
    #[arg(long)]
    data: String,
    #[arg(long)]
    adapter_id: Option<String>,
    #[arg(long)]
    name: Option<String>,
    /// Training parameter as `key=value`; JSON values are parsed.
    #[arg(long = "param")]
    params: Vec<String>,
    #[arg(long)]
    detach: bool,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    owner: String,
    /// subject, memory or multi-angle.
    #[arg(long, default_value = "subject")]
    kind: String,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long = "reference")]
    references: Vec<String>,
    #[arg(long = "label")]
    labels: Vec<String>,
    #[arg(long)]
    adapter_id: Option<String>,
}

#[derive(Debug, Args)]
struct StitchArgs {
    #[arg(long)]
    owner: String,
    #[arg(long = "image", required = true)]
    images: Vec<String>,
    #[arg(long = "label")]
    labels: Vec<String>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("keepsake error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// `KEEPSAKE_LOG` wins over `RUST_LOG`; default is `warn`.
fn init_tracing() {
    let env_filter = std::env::var("KEEPSAKE_LOG")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .try_init()
        .ok();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli.overrides)?;
    let engine = KeepsakeEngine::new(config)?;
    match cli.command {
        Command::Train(args) => run_train(&engine, args),
        Command::Job { adapter_id } => {
            let job = engine.orchestrator().get_job(&adapter_id)?;
            match job {
                Some(job) => print_json(&serde_json::to_value(job)?),
                None => bail!("no training job with adapter id {adapter_id}"),
            }
        }
        Command::Jobs { owner } => {
            let jobs = engine.orchestrator().list_jobs(&owner)?;
            print_json(&serde_json::to_value(jobs)?)
        }
        Command::Latest { owner } => {
            let latest = engine.orchestrator().most_recent_completed(&owner)?;
            print_json(&serde_json::to_value(latest)?)
        }
        Command::Reconcile { wait } => run_reconcile(&engine, wait),
        Command::Generate(args) => run_generate(&engine, args),
        Command::Stitch(args) => {
            let stitched =
                engine
                    .avatars()
                    .stitch_reference_images(&args.owner, &args.images, &args.labels)?;
            print_json(&serde_json::to_value(stitched)?)
        }
        Command::Extract { owner, uri, panels } => {
            let front = engine.avatars().extract_primary_angle(&owner, &uri, panels)?;
            print_json(&json!({ "image_uri": front }))
        }
        Command::Upload { file, key } => {
            let bytes =
                fs::read(&file).with_context(|| format!("failed reading {}", file.display()))?;
            let uri = engine.blobs().put(&bytes, &key)?;
            print_json(&json!({ "uri": uri }))
        }
        Command::Health => {
            let healthy = engine.router().health_check();
            print_json(&json!({
                "healthy": healthy,
                "capabilities": engine.router().capabilities(),
            }))?;
            Ok(if healthy { 0 } else { 1 })
        }
    }
}

fn load_config(args: &ConfigArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir.clone() {
        config.data_dir = data_dir;
    }
    if args.stub {
        config.stub_mode = true;
    }
    if args.legacy_fallback {
        config.legacy_fallback_enabled = true;
    }
    if let Some(interval) = args.poll_interval {
        config.poll_interval_seconds = interval;
    }
    if let Some(attempts) = args.max_poll_attempts {
        config.max_poll_attempts = attempts;
    }
    config.validate()?;
    Ok(config)
}

fn run_train(engine: &KeepsakeEngine, args: TrainArgs) -> Result<i32> {
    let mut request = TrainingRequest::new(args.owner, args.data);
    request.adapter_id = args.adapter_id;
    request.name = args.name;
    request.params = parse_params(&args.params)?;

    let adapter_id = engine.orchestrator().start_training(request)?;
    if args.detach {
        eprintln!("training started; run `keepsake reconcile --wait` to keep polling");
        print_json(&json!({ "adapter_id": adapter_id }))?;
        return Ok(0);
    }

    let job = engine.orchestrator().join(&adapter_id)?;
    print_json(&serde_json::to_value(&job)?)?;
    Ok(if job.status == JobStatus::Completed { 0 } else { 1 })
}

fn run_reconcile(engine: &KeepsakeEngine, wait: bool) -> Result<i32> {
    let report = engine.orchestrator().reconcile()?;
    if !wait {
        // Resumed workers die with the process; their records stay as they are.
        engine.orchestrator().shutdown();
        print_json(&serde_json::to_value(&report)?)?;
        return Ok(0);
    }

    let mut finished = Vec::new();
    for adapter_id in &report.resumed {
        finished.push(serde_json::to_value(engine.orchestrator().join(adapter_id)?)?);
    }
    print_json(&json!({
        "report": report,
        "jobs": finished,
    }))?;
    Ok(0)
}

fn run_generate(engine: &KeepsakeEngine, args: GenerateArgs) -> Result<i32> {
    let Some(kind) = GenerationKind::parse(&args.kind) else {
        bail!("unknown generation kind {:?}", args.kind);
    };
    let avatars = engine.avatars();
    let outcome = match kind {
        GenerationKind::MultiAngle => {
            avatars.generate_multi_angle(&args.owner, &args.references, &args.labels)?
        }
        GenerationKind::Subject if args.references.is_empty() && args.adapter_id.is_none() => {
            avatars.generate_subject(&args.owner)?
        }
        GenerationKind::Memory if args.references.is_empty() && args.adapter_id.is_none() => {
            let prompt = args.prompt.as_deref().unwrap_or_default();
            avatars.generate_memory(&args.owner, prompt)?
        }
        GenerationKind::Subject | GenerationKind::Memory => {
            let mut request = match kind {
                GenerationKind::Memory => {
                    GenerationRequest::memory(&args.owner, args.prompt.clone().unwrap_or_default())
                }
                _ => GenerationRequest::subject(&args.owner),
            };
            request.prompt = args.prompt.clone().or(request.prompt);
            request.reference_images = args.references.clone();
            request.reference_labels = args.labels.clone();
            request.adapter_id = args.adapter_id.clone();
            avatars.generate_with_fallback(&request)?
        }
    };
    if let Some(reason) = outcome.fallback_reason.as_deref() {
        eprintln!("fallback: {reason}");
    }
    print_json(&serde_json::to_value(outcome)?)?;
    Ok(0)
}

fn parse_params(raw: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("training parameter {entry:?} is not key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("training parameter {entry:?} has an empty key");
        }
        let value = serde_json::from_str(value.trim())
            .unwrap_or_else(|_| Value::String(value.trim().to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

fn print_json(value: &Value) -> Result<i32> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_params;

    #[test]
    fn params_parse_json_or_fall_back_to_text() -> anyhow::Result<()> {
        let params = parse_params(&[
            "lora_rank=8".to_string(),
            "instance_prompt=a photo of SKS dog".to_string(),
            "flip=true".to_string(),
        ])?;
        assert_eq!(params["lora_rank"], json!(8));
        assert_eq!(params["instance_prompt"], json!("a photo of SKS dog"));
        assert_eq!(params["flip"], json!(true));
        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=1".to_string()]).is_err());
        Ok(())
    }
}
