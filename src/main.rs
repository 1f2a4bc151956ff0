pub(crate) mod config;
pub(crate) mod date;
pub(crate) mod dimse;
pub(crate) mod mapper;
pub(crate) mod pipeline;
pub(crate) mod query;
pub(crate) mod report;

use crate::config::{AppConfig, ConfigOverrides};
use crate::mapper::PathMapper;
use crate::pipeline::{FailurePolicy, FileOutcome, Pipeline};
use crate::query::{Backend, QueryParameters};
use crate::report::ReportFormat;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DISPLAY_TITLE: &str = r"
       _                                 _       _
      | |                               | |     | |
 _ __ | |______ _ __   __ _  ___ ___  __| | __ _| |_ ___  __ _ _   _  ___ _ __ _   _
| '_ \| |______| '_ \ / _` |/ __/ __|/ _` |/ _` | __/ _ \/ _` | | | |/ _ \ '__| | | |
| |_) | |      | |_) | (_| | (__\__ \ (_| | (_| | ||  __/ (_| | |_| |  __/ |  | |_| |
| .__/|_|      | .__/ \__,_|\___|___/\__,_|\__,_|\__\___|\__, |\__,_|\___|_|   \__, |
| |            | |                                          | |                 __/ |
|_|            |_|                                          |_|                |___/
";

/// A ChRIS plugin that connects to a PACS and saves the results of queries.
///
/// For every input file, the study date encoded in its name is looked up in the PACS
/// and the matching studies are written to a JSON file of the same name.
#[derive(Debug, Parser)]
#[command(name = "pacsdatequery", version, about, long_about)]
struct Cli {
	/// Directory containing (read-only) input files
	inputdir: PathBuf,
	/// Directory where to write output files
	outputdir: PathBuf,
	/// Input file filter glob
	#[arg(short, long, default_value = "**/*.txt")]
	pattern: String,
	/// Configuration file layered over the built-in defaults [default: ./config.toml]
	#[arg(long)]
	config: Option<PathBuf>,
	/// Query backend
	#[arg(long, value_enum)]
	backend: Option<Backend>,
	/// Path of the findscu executable
	#[arg(long)]
	executable: Option<String>,
	/// Calling AE title
	#[arg(long)]
	aet: Option<String>,
	/// Called AE title
	#[arg(long)]
	aec: Option<String>,
	/// Host name or IP address of the PACS
	#[arg(long)]
	server_host: Option<String>,
	/// DICOM port of the PACS
	#[arg(long)]
	server_port: Option<u16>,
	/// Layout of the written reports
	#[arg(long, value_enum)]
	print_report: Option<ReportFormat>,
	/// What to do with the remaining files after a query failed
	#[arg(long, value_enum)]
	failure_policy: Option<FailurePolicy>,
}

impl Cli {
	fn overrides(&self) -> ConfigOverrides {
		ConfigOverrides {
			config_file: self.config.clone(),
			executable: self.executable.clone(),
			calling_aet: self.aet.clone(),
			called_aet: self.aec.clone(),
			server_host: self.server_host.clone(),
			server_port: self.server_port,
			backend: self.backend,
			print_report: self.print_report,
			failure_policy: self.failure_policy,
		}
	}
}

fn init_logger(level: LevelFilter) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_writer(std::io::stderr)
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(level.into())
				.from_env_lossy(),
		)
		.init();
}

fn main() -> anyhow::Result<ExitCode> {
	let cli = Cli::parse();
	let config = AppConfig::new(&cli.overrides())?;
	init_logger(config.logging.level_filter());

	println!("{DISPLAY_TITLE}");

	let success = tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()?
		.block_on(run(cli, config))?;

	Ok(if success {
		ExitCode::SUCCESS
	} else {
		ExitCode::FAILURE
	})
}

/// Processes every mapped input file. Returns whether all of them succeeded.
async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<bool> {
	let mapper = PathMapper::file_mapper(&cli.inputdir, &cli.outputdir, &cli.pattern, ".json")?;
	let pairs = mapper.pairs()?;
	if pairs.is_empty() {
		warn!(pattern = %cli.pattern, "No input files match the pattern");
	}

	info!(
		backend = config.pacs.backend.as_str(),
		pacs = format!(
			"{}@{}:{}",
			config.pacs.called_aet, config.pacs.server_host, config.pacs.server_port
		),
		files = pairs.len(),
		"Querying PACS"
	);

	let finder = query::find_service(&config.pacs);
	let pipeline = Pipeline::new(
		finder.as_ref(),
		QueryParameters::from(&config.pacs),
		QueryParameters::from(&config.output),
		config.run.failure_policy,
	);
	let summary = pipeline.run(pairs).await;

	for outcome in &summary.outcomes {
		if let FileOutcome::Failed { input, error } = outcome {
			error!(input = %input.display(), "{error}");
		}
	}

	info!(
		succeeded = summary.succeeded(),
		failed = summary.failed(),
		"Finished"
	);

	Ok(summary.is_success())
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;
	use std::ffi::OsStr;
	use std::os::unix::fs::PermissionsExt;
	use std::path::Path;
	use tempfile::tempdir;

	fn fake_findscu(dir: &Path, body: &str) -> PathBuf {
		let path = dir.join("findscu");
		std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
		path
	}

	async fn run_with(executable: &Path, dir: &Path) -> bool {
		let input = dir.join("in");
		std::fs::create_dir_all(&input).unwrap();
		std::fs::write(input.join("2020-07-01.txt"), "").unwrap();

		let cli = Cli::parse_from([
			OsStr::new("pacsdatequery"),
			input.as_os_str(),
			dir.join("out").as_os_str(),
			OsStr::new("--executable"),
			executable.as_os_str(),
		]);
		let config = AppConfig::new(&cli.overrides()).unwrap();
		run(cli, config).await.unwrap()
	}

	#[tokio::test]
	async fn successful_run() {
		let dir = tempdir().unwrap();
		let executable = fake_findscu(dir.path(), "exit 0");

		assert!(run_with(&executable, dir.path()).await);
		assert!(dir.path().join("out/2020-07-01.json").exists());
	}

	#[tokio::test]
	async fn failed_query_fails_the_run() {
		let dir = tempdir().unwrap();
		let executable = fake_findscu(dir.path(), "exit 1");

		assert!(!run_with(&executable, dir.path()).await);
		assert!(!dir.path().join("out/2020-07-01.json").exists());
	}
}
