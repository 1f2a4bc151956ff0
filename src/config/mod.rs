use crate::pipeline::FailurePolicy;
use crate::query::Backend;
use crate::report::ReportFormat;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub logging: LoggingConfig,
	pub pacs: PacsConfig,
	pub output: OutputConfig,
	pub run: RunConfig,
}

/// Values that take precedence over every other configuration source.
/// Usually collected from the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
	pub config_file: Option<PathBuf>,
	pub executable: Option<String>,
	pub calling_aet: Option<String>,
	pub called_aet: Option<String>,
	pub server_host: Option<String>,
	pub server_port: Option<u16>,
	pub backend: Option<Backend>,
	pub print_report: Option<ReportFormat>,
	pub failure_policy: Option<FailurePolicy>,
}

impl AppConfig {
	pub fn new(overrides: &ConfigOverrides) -> Result<Self, config::ConfigError> {
		use config::Config;
		let file = match &overrides.config_file {
			Some(path) => config::File::from(path.as_path()).required(true),
			None => config::File::with_name("config.toml").required(false),
		};

		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(file)
			.add_source(
				config::Environment::with_prefix("PACSDATEQUERY")
					.separator("__")
					.try_parsing(true),
			)
			.set_override_option("pacs.executable", overrides.executable.clone())?
			.set_override_option("pacs.calling_aet", overrides.calling_aet.clone())?
			.set_override_option("pacs.called_aet", overrides.called_aet.clone())?
			.set_override_option("pacs.server_host", overrides.server_host.clone())?
			.set_override_option("pacs.server_port", overrides.server_port.map(i64::from))?
			.set_override_option("pacs.backend", overrides.backend.map(|b| b.as_str()))?
			.set_override_option(
				"output.print_report",
				overrides.print_report.map(|f| f.as_str()),
			)?
			.set_override_option(
				"run.failure_policy",
				overrides.failure_policy.map(|p| p.as_str()),
			)?
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
	// Configurable logging level. Also configurable via env vars RUST_LOG and PACSDATEQUERY__LOGGING__LEVEL
	pub level: String,
}

impl LoggingConfig {
	/// The configured level, falling back to INFO if it cannot be parsed.
	pub fn level_filter(&self) -> LevelFilter {
		self.level.parse().unwrap_or(LevelFilter::INFO)
	}
}

/// Connection settings of the PACS that is queried.
#[derive(Debug, Clone, Deserialize)]
pub struct PacsConfig {
	pub backend: Backend,
	/// Path of the DCMTK findscu executable (only used by the findscu backend)
	pub executable: String,
	/// The application entity title of this plugin
	pub calling_aet: String,
	/// The application entity title of the PACS
	pub called_aet: String,
	pub server_host: String,
	pub server_port: u16,
	/// Timeout in seconds for every network exchange of the dimse backend
	pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
	pub print_report: ReportFormat,
	pub colorize: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
	pub failure_policy: FailurePolicy,
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn defaults() {
		let config = AppConfig::new(&ConfigOverrides::default()).unwrap();

		assert_eq!(config.pacs.backend, Backend::Findscu);
		assert_eq!(config.pacs.executable, "/usr/bin/findscu");
		assert_eq!(config.pacs.calling_aet, "CHIPS");
		assert_eq!(config.pacs.called_aet, "ORTHANC");
		assert_eq!(config.pacs.server_host, "127.0.0.1");
		assert_eq!(config.pacs.server_port, 4242);
		assert_eq!(config.output.print_report, ReportFormat::Json);
		assert_eq!(config.output.colorize, "dark");
		assert_eq!(config.run.failure_policy, FailurePolicy::Abort);
		assert_eq!(config.logging.level_filter(), LevelFilter::INFO);
	}

	#[test]
	fn overrides_take_precedence() {
		let overrides = ConfigOverrides {
			called_aet: Some(String::from("PACS")),
			server_port: Some(11112),
			backend: Some(Backend::Dimse),
			failure_policy: Some(FailurePolicy::Continue),
			..ConfigOverrides::default()
		};
		let config = AppConfig::new(&overrides).unwrap();

		assert_eq!(config.pacs.called_aet, "PACS");
		assert_eq!(config.pacs.server_port, 11112);
		assert_eq!(config.pacs.backend, Backend::Dimse);
		assert_eq!(config.run.failure_policy, FailurePolicy::Continue);
		// Untouched settings keep their defaults
		assert_eq!(config.pacs.calling_aet, "CHIPS");
	}

	#[test]
	fn config_file_is_layered_over_defaults() {
		let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		writeln!(file, "[pacs]\nserver_host = \"pacs.example.org\"\n").unwrap();

		let overrides = ConfigOverrides {
			config_file: Some(file.path().to_path_buf()),
			..ConfigOverrides::default()
		};
		let config = AppConfig::new(&overrides).unwrap();

		assert_eq!(config.pacs.server_host, "pacs.example.org");
		assert_eq!(config.pacs.server_port, 4242);
	}

	#[test]
	fn missing_config_file_is_an_error() {
		let overrides = ConfigOverrides {
			config_file: Some(PathBuf::from("/nonexistent/pacsdatequery.toml")),
			..ConfigOverrides::default()
		};
		assert!(AppConfig::new(&overrides).is_err());
	}
}
