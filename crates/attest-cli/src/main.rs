//! attest - validate generated text against providers and guidelines.
//!
//! ## Commands
//!
//! - `generate`: complete a prompt with the default provider
//! - `validate`: run a validation, optionally with guidelines and a proof
//! - `verify-proof`: check a `{request, verdict, proof}` document
//! - `bleu`, `tokens`, `cost`, `content`: stateless metrics
//! - `guidelines`: ingest, score, embed, save and load collections
//! - `metrics`: record and export metric history
//! - `storage`, `logs`, `version`
//!
//! Payload arguments accept inline JSON, a file path, or `-` for stdin.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use attest_runtime::{Engine, LogCaptureLayer, RuntimeConfig, StorageConfig, ValidationOptions};

#[derive(Parser, Debug)]
#[command(name = "attest")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Validate generated text against answer providers and guidelines", long_about = None)]
struct Cli {
    /// Runtime config file (.yaml, .yml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Persist guidelines and metrics under this directory
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Log attest events at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Complete a prompt with the default provider
    Generate { prompt: String },

    /// Validate a prompt against one or more providers
    Validate {
        prompt: String,

        /// Provider list (JSON array or single object)
        #[arg(short, long)]
        providers: Option<String>,

        /// Inline collection, or {"collection": name, "method": tag}
        #[arg(short, long)]
        guidelines: Option<String>,

        /// Load this stored collection before validating
        #[arg(long)]
        load: Option<String>,

        /// Emit {request, verdict, proof}
        #[arg(long)]
        proof: bool,

        /// Reference answer to score providers against
        #[arg(long)]
        reference: Option<String>,

        /// Pass threshold in [0, 1]
        #[arg(long)]
        threshold: Option<f64>,

        /// Value mixed into the proof's request hash
        #[arg(long)]
        salt: Option<String>,
    },

    /// Verify a proof document produced by `validate --proof`
    VerifyProof { document: String },

    /// BLEU score of a candidate against a reference
    Bleu { reference: String, candidate: String },

    /// Count tokens
    Tokens { text: String },

    /// Estimate the cost of a call
    Cost {
        #[arg(long)]
        tokens_in: u64,
        #[arg(long)]
        tokens_out: u64,
        #[arg(long)]
        provider: String,
        /// Cost rules (map or list form); defaults to `cost_rules` from the config
        #[arg(long)]
        rules: Option<String>,
    },

    /// Content quality metrics
    Content {
        metric: ContentMetric,
        /// Metric inputs; see `attest content --help`
        #[arg(required = true)]
        args: Vec<String>,
    },

    /// Guideline collections
    Guidelines {
        #[command(subcommand)]
        action: GuidelineAction,
    },

    /// Recorded metric history
    Metrics {
        #[command(subcommand)]
        action: MetricAction,
    },

    /// List storage keys
    Storage,

    /// Show captured engine logs for this invocation
    Logs {
        #[arg(long)]
        recent: Option<usize>,
    },

    /// Print the engine version
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ContentMetric {
    /// reference, candidate
    RougeL,
    /// expected, generated
    Accuracy,
    /// facts (JSON array), candidate
    FactCoverage,
    /// text
    Coherence,
    /// samples (JSON array)
    Diversity,
    /// text
    Fluency,
    /// facts (JSON array), candidate
    FactcheckAdv,
    /// corpus (JSON array), candidate, [n]
    Plagiarism,
    /// samples (JSON array)
    Bias,
    /// previous samples (JSON array), current samples (JSON array)
    Drift,
}

#[derive(Subcommand, Debug)]
enum GuidelineAction {
    /// Ingest a collection payload
    Ingest {
        payload: String,
        /// Save the resulting collection
        #[arg(long)]
        save: bool,
    },
    /// Rank guidelines of the active collection against a query
    Score {
        query: String,
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,
        #[arg(short, long)]
        method: Option<String>,
        /// Load this stored collection first
        #[arg(long)]
        load: Option<String>,
    },
    /// Build embeddings for a stored collection and save it
    Build {
        name: String,
        #[arg(short, long, default_value = "embedding")]
        method: String,
    },
    /// Save a collection, ingesting the payload first if given
    Save {
        name: String,
        payload: Option<String>,
    },
    /// Load a stored collection and print its size
    Load { name: String },
}

#[derive(Subcommand, Debug)]
enum MetricAction {
    Record { name: String, value: f64 },
    History { name: String },
    List,
    Export {
        #[arg(short, long, default_value = "json")]
        format: String,
    },
}

/// Inline JSON, `-` for stdin, or a file path.
fn read_payload(arg: &str) -> Result<String> {
    let trimmed = arg.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(arg.to_string());
    }
    if arg == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read payload from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(arg).with_context(|| format!("Failed to read payload file {}", arg))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = &cli.store {
        config.storage = StorageConfig::File { path: dir.clone() };
    }
    Ok(config)
}

fn init_tracing(verbose: bool, engine: &Engine) {
    let default = if verbose { "warn,attest=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // try_init: a second initialisation in the same process is not an error
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .with(LogCaptureLayer::new(engine.log_buffer()))
        .try_init();
}

fn content_metric(
    engine: &Engine,
    metric: ContentMetric,
    args: &[String],
) -> Result<serde_json::Value> {
    let arg = |i: usize| -> Result<&str> {
        args.get(i)
            .map(String::as_str)
            .with_context(|| format!("{:?} needs {} argument(s)", metric, i + 1))
    };
    let score = match metric {
        ContentMetric::RougeL => engine.metrics_rouge_l(arg(0)?, arg(1)?),
        ContentMetric::Accuracy => engine.metrics_accuracy(arg(0)?, arg(1)?),
        ContentMetric::FactCoverage => {
            engine.metrics_fact_coverage(&read_payload(arg(0)?)?, arg(1)?)?
        }
        ContentMetric::Coherence => engine.metrics_coherence(arg(0)?),
        ContentMetric::Diversity => engine.metrics_diversity(&read_payload(arg(0)?)?)?,
        ContentMetric::Fluency => engine.metrics_fluency(arg(0)?),
        ContentMetric::FactcheckAdv => {
            let check = engine.metrics_factcheck_adv(&read_payload(arg(0)?)?, arg(1)?)?;
            return Ok(serde_json::to_value(check)?);
        }
        ContentMetric::Plagiarism => {
            let corpus = read_payload(arg(0)?)?;
            match args.get(2) {
                Some(n) => {
                    let n: usize = n
                        .parse()
                        .with_context(|| format!("n-gram size '{}' is not a number", n))?;
                    engine.metrics_plagiarism_ngram(&corpus, arg(1)?, n)?
                }
                None => engine.metrics_plagiarism(&corpus, arg(1)?)?,
            }
        }
        ContentMetric::Bias => {
            return Ok(serde_json::to_value(
                engine.detect_bias(&read_payload(arg(0)?)?)?,
            )?)
        }
        ContentMetric::Drift => {
            engine.detect_drift(&read_payload(arg(0)?)?, &read_payload(arg(1)?)?)?
        }
    };
    Ok(serde_json::json!(score))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let engine = Engine::new(load_config(&cli)?)?;
    init_tracing(cli.verbose, &engine);
    tracing::debug!(store = ?cli.store, config = ?cli.config, "Engine ready");

    match cli.command {
        // Stateless commands: no initialisation needed.
        Commands::Bleu {
            reference,
            candidate,
        } => println!("{}", engine.metrics_bleu(&reference, &candidate)),
        Commands::Tokens { text } => println!("{}", engine.token_count(&text)),
        Commands::Cost {
            tokens_in,
            tokens_out,
            provider,
            rules,
        } => {
            let rules = match rules {
                Some(r) => read_payload(&r)?,
                None => serde_json::to_string(&engine.config().cost_rules)?,
            };
            let cost = engine.calculate_cost(tokens_in, tokens_out, &provider, &rules)?;
            println!("{}", cost);
        }
        Commands::Content { metric, args } => match content_metric(&engine, metric, &args)? {
            serde_json::Value::Number(score) => println!("{}", score),
            report => print_json(&report)?,
        },
        Commands::VerifyProof { document } => {
            let valid = engine.verify_proof(&read_payload(&document)?)?;
            println!("{}", valid);
            if !valid {
                std::process::exit(1);
            }
        }
        Commands::Version => println!("{}", engine.version()),

        command => {
            engine.initialize()?;
            run_stateful(&engine, command).await?;
        }
    }
    Ok(())
}

async fn run_stateful(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Generate { prompt } => println!("{}", engine.generate(&prompt).await?),

        Commands::Validate {
            prompt,
            providers,
            guidelines,
            load,
            proof,
            reference,
            threshold,
            salt,
        } => {
            if let Some(name) = load {
                engine.guidelines_load(&name)?;
            }
            let providers = match providers {
                Some(p) => read_payload(&p)?,
                None => serde_json::to_string(&engine.config().default_provider)?,
            };
            let options = ValidationOptions {
                reference,
                threshold,
                salt,
            };
            if options != ValidationOptions::default() {
                let guidelines = match guidelines {
                    Some(g) => read_payload(&g)?,
                    None => String::new(),
                };
                let options = serde_json::to_string(&options)?;
                if proof {
                    print_json(
                        &engine
                            .validate_with_options_and_proof(
                                &prompt,
                                &providers,
                                &guidelines,
                                &options,
                            )
                            .await?,
                    )?;
                } else {
                    print_json(
                        &engine
                            .validate_with_options(&prompt, &providers, &guidelines, &options)
                            .await?,
                    )?;
                }
                return Ok(());
            }
            match (guidelines, proof) {
                (Some(g), true) => print_json(
                    &engine
                        .validate_custom_with_proof(&prompt, &providers, &read_payload(&g)?)
                        .await?,
                )?,
                (Some(g), false) => print_json(
                    &engine
                        .validate_custom(&prompt, &providers, &read_payload(&g)?)
                        .await?,
                )?,
                (None, true) => {
                    print_json(&engine.validate_multi_with_proof(&prompt, &providers).await?)?
                }
                (None, false) => print_json(&engine.validate_multi(&prompt, &providers).await?)?,
            }
        }

        Commands::Guidelines { action } => match action {
            GuidelineAction::Ingest { payload, save } => {
                let report = engine.guidelines_ingest(&read_payload(&payload)?)?;
                if save {
                    engine.guidelines_save(&report.collection, "")?;
                }
                print_json(&report)?;
            }
            GuidelineAction::Score {
                query,
                top_k,
                method,
                load,
            } => {
                if let Some(name) = load {
                    engine.guidelines_load(&name)?;
                }
                print_json(
                    &engine
                        .guidelines_scores(&query, top_k, method.as_deref())
                        .await?,
                )?;
            }
            GuidelineAction::Build { name, method } => {
                engine.guidelines_load(&name)?;
                let built = engine.guidelines_build_embeddings(&method).await?;
                engine.guidelines_save(&name, "")?;
                println!("{}", built);
            }
            GuidelineAction::Save { name, payload } => {
                let payload = match payload {
                    Some(p) => read_payload(&p)?,
                    None => String::new(),
                };
                engine.guidelines_save(&name, &payload)?;
                println!("saved {}", name);
            }
            GuidelineAction::Load { name } => println!("{}", engine.guidelines_load(&name)?),
        },

        Commands::Metrics { action } => match action {
            MetricAction::Record { name, value } => engine.record_metric(&name, value)?,
            MetricAction::History { name } => print_json(&engine.metric_history(&name)?)?,
            MetricAction::List => print_json(&engine.list_metrics()?)?,
            MetricAction::Export { format } => print!("{}", engine.export_metrics(&format)?),
        },

        Commands::Storage => print_json(&engine.list_storage_items()?)?,

        Commands::Logs { recent } => {
            let lines = match recent {
                Some(n) => engine.get_recent_logs(Some(n))?,
                None => engine.get_logs()?,
            };
            print_json(&lines)?;
        }

        _ => bail!("stateless command routed to the initialised engine"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_validate_flags_parse() {
        let cli = Cli::try_parse_from([
            "attest",
            "validate",
            "Capital of France?",
            "--providers",
            r#"[{"type": "echo"}]"#,
            "--proof",
            "--store",
            "/tmp/attest",
        ])
        .unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/attest")));
        match cli.command {
            Commands::Validate {
                prompt,
                providers,
                proof,
                guidelines,
                ..
            } => {
                assert_eq!(prompt, "Capital of France?");
                assert!(providers.is_some());
                assert!(proof);
                assert!(guidelines.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_content_metric_names() {
        let cli = Cli::try_parse_from(["attest", "content", "rouge-l", "a b", "a c"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Content {
                metric: ContentMetric::RougeL,
                ..
            }
        ));
    }

    #[test]
    fn test_read_payload_inline_and_file() {
        assert_eq!(read_payload(r#"{"a": 1}"#).unwrap(), r#"{"a": 1}"#);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"[{"match": "x"}]"#).unwrap();
        assert_eq!(
            read_payload(path.to_str().unwrap()).unwrap(),
            r#"[{"match": "x"}]"#
        );
        assert!(read_payload("/definitely/not/here.json").is_err());
    }

    #[test]
    fn test_store_flag_overrides_storage() {
        let cli = Cli::try_parse_from(["attest", "--store", "/tmp/x", "storage"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(
            config.storage,
            StorageConfig::File {
                path: PathBuf::from("/tmp/x")
            }
        );
    }

    #[test]
    fn test_content_metric_needs_arguments() {
        let engine = Engine::new(RuntimeConfig::default()).unwrap();
        assert!(content_metric(&engine, ContentMetric::RougeL, &["only".to_string()]).is_err());
        let score =
            content_metric(&engine, ContentMetric::Coherence, &["a b c".to_string()]).unwrap();
        assert!((0.0..=1.0).contains(&score.as_f64().unwrap()));
    }

    #[test]
    fn test_integrity_content_metrics() {
        let engine = Engine::new(RuntimeConfig::default()).unwrap();
        let args = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let check = content_metric(
            &engine,
            ContentMetric::FactcheckAdv,
            &args(&[r#"["insulin"]"#, "never give insulin"]),
        )
        .unwrap();
        assert_eq!(check["contradiction_rate"], 1.0);

        let corpus = r#"["the quick brown fox jumps"]"#;
        let full = content_metric(
            &engine,
            ContentMetric::Plagiarism,
            &args(&[corpus, "the quick brown fox jumps"]),
        )
        .unwrap();
        assert_eq!(full.as_f64(), Some(1.0));
        let unigram = content_metric(
            &engine,
            ContentMetric::Plagiarism,
            &args(&[corpus, "fox brown quick", "1"]),
        )
        .unwrap();
        assert_eq!(unigram.as_f64(), Some(0.6));
        assert!(content_metric(
            &engine,
            ContentMetric::Plagiarism,
            &args(&[corpus, "fox", "three"])
        )
        .is_err());

        let bias = content_metric(&engine, ContentMetric::Bias, &args(&[r#"["he and she"]"#]))
            .unwrap();
        assert_eq!(bias["bias_score"], 0.0);
        let drift = content_metric(
            &engine,
            ContentMetric::Drift,
            &args(&[r#"["a b"]"#, r#"["a c"]"#]),
        )
        .unwrap();
        assert_eq!(drift.as_f64(), Some(0.5));
    }

    #[test]
    fn test_validate_option_flags_parse() {
        let cli = Cli::try_parse_from([
            "attest",
            "validate",
            "q",
            "--reference",
            "Paris",
            "--threshold",
            "0.8",
            "--salt",
            "run-7",
        ])
        .unwrap();
        match cli.command {
            Commands::Validate {
                reference,
                threshold,
                salt,
                ..
            } => {
                assert_eq!(reference.as_deref(), Some("Paris"));
                assert_eq!(threshold, Some(0.8));
                assert_eq!(salt.as_deref(), Some("run-7"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validate_with_reference_and_threshold() {
        let engine = Engine::new(RuntimeConfig::default()).unwrap();
        engine.initialize().unwrap();
        let cli = Cli::try_parse_from([
            "attest",
            "validate",
            "Capital of France?",
            "--reference",
            "Paris",
            "--threshold",
            "1.0",
        ])
        .unwrap();
        run_stateful(&engine, cli.command).await.unwrap();
        assert!(engine
            .get_logs()
            .unwrap()
            .iter()
            .any(|l| l == "validate_with_options"));
    }
}
