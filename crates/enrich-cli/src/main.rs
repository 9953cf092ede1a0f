//! `catalog-enrich`: run one enrichment job over a catalog in a bucket

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use enrich_core::jobs::{language_name, LANGUAGES};
use enrich_core::{
    ConfigError, EnrichConfig, EnrichError, FinalValidationPolicy, FsObjectStore,
    GenerationClient, Orchestrator, PracticeJob, QualityCheckJob, RunReport, StubJob,
    TranslationJob,
};
use enrich_gemini::{GeminiClient, GeminiError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Job selected on the command line
#[derive(Debug)]
enum Job {
    Translate(TranslationJob),
    Practice(PracticeJob),
    Quality(QualityCheckJob),
    Stub(StubJob),
}

fn asset_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("prompt")
            .long("prompt")
            .value_parser(value_parser!(PathBuf))
            .help("Prompt template file (defaults to the built-in prompt)"),
    )
    .arg(
        Arg::new("schema")
            .long("schema")
            .value_parser(value_parser!(PathBuf))
            .help("JSON Schema file for the model response"),
    )
}

fn cli() -> Command {
    Command::new("catalog-enrich")
        .version(enrich_core::VERSION)
        .about("Enrich OSCAL catalogs with a generative model")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file (otherwise read from the environment)"),
        )
        .arg(
            Arg::new("store-root")
                .long("store-root")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Directory acting as the bucket (default: $BUCKET_NAME)"),
        )
        .arg(Arg::new("source").long("source").global(true).help("Object path of the source catalog"))
        .arg(
            Arg::new("output-prefix")
                .long("output-prefix")
                .global(true)
                .help("Object prefix for the enriched catalogs"),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .global(true)
                .value_parser(value_parser!(usize))
                .help("Maximum concurrent model calls"),
        )
        .arg(
            Arg::new("max-attempts")
                .long("max-attempts")
                .global(true)
                .value_parser(value_parser!(u32))
                .help("Attempts per batch, including the first"),
        )
        .arg(
            Arg::new("abort-on-invalid")
                .long("abort-on-invalid")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Write nothing if the enriched catalog fails validation"),
        )
        .arg(
            Arg::new("catalog-schema")
                .long("catalog-schema")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("JSON Schema file the output catalog is validated against"),
        )
        .arg(
            Arg::new("no-checkpoint")
                .long("no-checkpoint")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Neither read nor write progress checkpoints"),
        )
        .arg(
            Arg::new("test")
                .long("test")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Process a small sample only, with debug logging"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("translate")
                .about("Translate titles and prose into other languages")
                .arg(
                    Arg::new("languages")
                        .long("languages")
                        .value_delimiter(',')
                        .help("Comma-separated language codes (default: all supported)"),
                ),
        )
        .subcommand(asset_args(
            Command::new("practice").about("Add a practice part to every control"),
        ))
        .subcommand(
            asset_args(Command::new("quality").about("Review maturity-level prose"))
                .arg(
                    Arg::new("components")
                        .long("components")
                        .help("Object prefix of component definitions selecting the controls"),
                )
                .arg(
                    Arg::new("controls")
                        .long("controls")
                        .value_delimiter(',')
                        .help("Comma-separated control ids to review"),
                ),
        )
        .subcommand(
            asset_args(Command::new("stub").about("Generate Baustein parts from source documents"))
                .arg(
                    Arg::new("sources")
                        .long("sources")
                        .help("Object prefix of the Baustein documents, one per Baustein"),
                )
                .arg(
                    Arg::new("document-base")
                        .long("document-base")
                        .help("URI prefix the model fetches documents from (default: $DOCUMENT_BASE_URI)"),
                ),
        )
}

/// Log filter used when `RUST_LOG` is unset
fn default_directive(test_mode: bool) -> &'static str {
    if test_mode {
        "debug"
    } else {
        "info"
    }
}

fn init_tracing(json: bool, test_mode: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(test_mode)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::warn!("tracing subscriber already set");
    }
}

/// Configuration from TOML or the environment, overridden by flags
fn load_config(matches: &ArgMatches) -> Result<EnrichConfig, ConfigError> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => EnrichConfig::from_toml_file(path)?,
        None => EnrichConfig::from_env()?,
    };

    if let Some(source) = matches.get_one::<String>("source") {
        config.source_path.clone_from(source);
    }
    if let Some(prefix) = matches.get_one::<String>("output-prefix") {
        config.output_prefix.clone_from(prefix);
    }
    if let Some(&concurrency) = matches.get_one::<usize>("concurrency") {
        config.concurrency = concurrency;
    }
    if let Some(&attempts) = matches.get_one::<u32>("max-attempts") {
        config.retry.max_attempts = attempts;
    }
    if matches.get_flag("abort-on-invalid") {
        config.final_validation = FinalValidationPolicy::Abort;
    }
    if let Some(path) = matches.get_one::<PathBuf>("catalog-schema") {
        config.catalog_schema_path = Some(path.display().to_string());
    }
    if matches.get_flag("no-checkpoint") {
        config.checkpoint = false;
    }
    if matches.get_flag("test") {
        config.test_mode = true;
    }
    let source_prefix = match matches.subcommand() {
        Some(("quality", args)) => args.get_one::<String>("components"),
        Some(("stub", args)) => args.get_one::<String>("sources"),
        _ => None,
    };
    if let Some(prefix) = source_prefix {
        config.source_prefix = Some(prefix.clone());
    }
    Ok(config)
}

fn build_job(matches: &ArgMatches) -> Result<Job, ConfigError> {
    let assets = |args: &ArgMatches| {
        (
            args.get_one::<PathBuf>("prompt").cloned(),
            args.get_one::<PathBuf>("schema").cloned(),
        )
    };

    match matches.subcommand() {
        Some(("translate", args)) => {
            let Some(codes) = args.get_many::<String>("languages") else {
                return Ok(Job::Translate(TranslationJob::all_languages()));
            };
            let codes: Vec<String> = codes.map(|c| c.trim().to_ascii_lowercase()).collect();
            if let Some(unknown) = codes.iter().find(|code| language_name(code).is_none()) {
                let known: Vec<&str> = LANGUAGES.iter().map(|(code, _)| *code).collect();
                return Err(ConfigError::invalid(
                    "languages",
                    format!("unknown language `{unknown}`; supported: {}", known.join(",")),
                ));
            }
            Ok(Job::Translate(TranslationJob::new(codes)))
        }
        Some(("practice", args)) => {
            let (prompt, schema) = assets(args);
            Ok(Job::Practice(PracticeJob::from_files(prompt.as_deref(), schema.as_deref())?))
        }
        Some(("quality", args)) => {
            let (prompt, schema) = assets(args);
            let mut job = QualityCheckJob::from_files(prompt.as_deref(), schema.as_deref())?;
            if let Some(ids) = args.get_many::<String>("controls") {
                job = job.with_control_ids(ids.map(|id| id.trim().to_string()));
            }
            Ok(Job::Quality(job))
        }
        Some(("stub", args)) => {
            let (prompt, schema) = assets(args);
            let mut job = StubJob::from_files(prompt.as_deref(), schema.as_deref())?;
            let base = args.get_one::<String>("document-base").cloned().or_else(|| {
                std::env::var("DOCUMENT_BASE_URI")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
            });
            if let Some(base) = base {
                job = job.with_document_base(base);
            }
            Ok(Job::Stub(job))
        }
        _ => Err(ConfigError::Missing("subcommand")),
    }
}

fn store_root(matches: &ArgMatches) -> Result<PathBuf, ConfigError> {
    if let Some(root) = matches.get_one::<PathBuf>("store-root") {
        return Ok(root.clone());
    }
    std::env::var("BUCKET_NAME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .ok_or(ConfigError::Missing("BUCKET_NAME"))
}

async fn run(
    matches: &ArgMatches,
    config: Result<EnrichConfig, ConfigError>,
) -> anyhow::Result<RunReport> {
    let config = config?;
    let job = build_job(matches)?;
    let root = store_root(matches)?;
    let store = Arc::new(FsObjectStore::new(&root));
    let client: Arc<dyn GenerationClient> = Arc::new(GeminiClient::from_env()?);
    tracing::info!(store = %root.display(), client = client.name(), "starting");

    let mut orchestrator = Orchestrator::new(config, client, store);
    let report = match job {
        Job::Translate(job) => orchestrator.run(job).await,
        Job::Practice(job) => orchestrator.run(job).await,
        Job::Quality(job) => orchestrator.run(job).await,
        Job::Stub(job) => orchestrator.run(job).await,
    }
    .context("enrichment run failed")?;
    Ok(report)
}

/// Process exit status for a failed run
fn exit_code(err: &anyhow::Error) -> u8 {
    let code = if let Some(err) = err.downcast_ref::<EnrichError>() {
        err.exit_code()
    } else if err.downcast_ref::<ConfigError>().is_some()
        || matches!(err.downcast_ref::<GeminiError>(), Some(GeminiError::MissingApiKey))
    {
        2
    } else {
        1
    };
    u8::try_from(code).unwrap_or(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    let config = load_config(&matches);
    // test mode set in the file or the environment also selects debug logging
    let test_mode = config
        .as_ref()
        .map_or(matches.get_flag("test"), |config| config.test_mode);
    init_tracing(matches.get_flag("json-logs"), test_mode);

    match run(&matches, config).await {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "catalog-enrich failed");
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn parse(args: &[&str]) -> ArgMatches {
        cli().try_get_matches_from(args).unwrap()
    }

    fn config_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn command_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn flags_override_file() {
        let file = config_file(
            "source_path = \"a/catalog.json\"\noutput_prefix = \"out\"\nconcurrency = 2\n",
        );
        let path = file.path().to_str().unwrap();
        let matches = parse(&[
            "catalog-enrich",
            "--config",
            path,
            "--concurrency",
            "7",
            "--no-checkpoint",
            "quality",
            "--components",
            "components/",
            "--abort-on-invalid",
        ]);

        let config = load_config(&matches).unwrap();
        assert_eq!(config.source_path, "a/catalog.json");
        assert_eq!(config.concurrency, 7);
        assert!(!config.checkpoint);
        assert_eq!(config.final_validation, FinalValidationPolicy::Abort);
        assert_eq!(config.source_prefix.as_deref(), Some("components/"));
    }

    #[test]
    fn test_mode_from_file_enables_debug_logging() {
        let file = config_file(
            "source_path = \"a/catalog.json\"\noutput_prefix = \"out\"\ntest_mode = true\n",
        );
        let matches = parse(&["catalog-enrich", "--config", file.path().to_str().unwrap(), "practice"]);
        assert!(!matches.get_flag("test"));

        let config = load_config(&matches).unwrap();
        assert!(config.test_mode);
        assert_eq!(default_directive(config.test_mode), "debug");
        assert_eq!(default_directive(false), "info");
    }

    #[test]
    fn unreadable_config_file_is_a_config_error() {
        let matches = parse(&["catalog-enrich", "--config", "/nonexistent/enrich.toml", "practice"]);
        assert!(matches!(load_config(&matches), Err(ConfigError::File { .. })));
    }

    #[test]
    fn translate_languages_are_checked() {
        let matches = parse(&["catalog-enrich", "translate", "--languages", "en,FR"]);
        match build_job(&matches).unwrap() {
            Job::Translate(job) => assert_eq!(job.languages(), ["en", "fr"]),
            other => panic!("unexpected job {other:?}"),
        }

        let matches = parse(&["catalog-enrich", "translate", "--languages", "en,xx"]);
        let err = build_job(&matches).unwrap_err();
        assert!(err.to_string().contains("xx"));
    }

    #[test]
    fn stub_sources_become_the_source_prefix() {
        let file = config_file("source_path = \"a/catalog.json\"\noutput_prefix = \"out\"\n");
        let matches = parse(&[
            "catalog-enrich",
            "--config",
            file.path().to_str().unwrap(),
            "stub",
            "--sources",
            "bausteine/",
            "--document-base",
            "gs://grundschutz",
        ]);

        let config = load_config(&matches).unwrap();
        assert_eq!(config.source_prefix.as_deref(), Some("bausteine/"));
        assert!(matches!(build_job(&matches).unwrap(), Job::Stub(_)));
    }

    #[test]
    fn missing_prompt_file_is_a_config_error() {
        let matches = parse(&["catalog-enrich", "practice", "--prompt", "/nonexistent/prompt.txt"]);
        let err = anyhow::Error::from(build_job(&matches).unwrap_err());
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn exit_codes() {
        let source = anyhow::Error::from(EnrichError::source_load("x", "gone"));
        assert_eq!(exit_code(&source), 3);
        let validation = anyhow::Error::from(EnrichError::FinalValidation {
            count: 2,
            first: "dup".into(),
        })
        .context("enrichment run failed");
        assert_eq!(exit_code(&validation), 4);
        assert_eq!(exit_code(&anyhow::Error::from(GeminiError::MissingApiKey)), 2);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
