//! The per-file loop of a plugin run.

use crate::date::date_get;
use crate::query::{study_date_filter, FindService, QueryError, QueryParameters};
use crate::report::{self, ReportError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// What happens to the remaining files once one of them failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
	/// Stop at the first failed file
	#[default]
	Abort,
	/// Process every file and report all failures at the end
	Continue,
}

impl FailurePolicy {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Abort => "abort",
			Self::Continue => "continue",
		}
	}
}

#[derive(Debug, Error)]
pub enum PipelineError {
	#[error(transparent)]
	Query(#[from] QueryError),
	#[error(transparent)]
	Report(#[from] ReportError),
	#[error("Failed to write {}: {source}", path.display())]
	Write {
		path: PathBuf,
		source: std::io::Error,
	},
}

#[derive(Debug)]
pub enum FileOutcome {
	Written {
		input: PathBuf,
		output: PathBuf,
		matches: usize,
	},
	Failed {
		input: PathBuf,
		error: PipelineError,
	},
}

#[derive(Debug, Default)]
pub struct RunSummary {
	pub outcomes: Vec<FileOutcome>,
}

impl RunSummary {
	pub fn succeeded(&self) -> usize {
		self.outcomes
			.iter()
			.filter(|outcome| matches!(outcome, FileOutcome::Written { .. }))
			.count()
	}

	pub fn failed(&self) -> usize {
		self.outcomes.len() - self.succeeded()
	}

	pub fn is_success(&self) -> bool {
		self.failed() == 0
	}
}

/// Queries the PACS once for every input file.
pub struct Pipeline<'a> {
	finder: &'a dyn FindService,
	/// Connection settings, merged before the date filter
	pacs: QueryParameters,
	/// Output settings, merged after the date filter
	output: QueryParameters,
	policy: FailurePolicy,
}

impl<'a> Pipeline<'a> {
	pub const fn new(
		finder: &'a dyn FindService,
		pacs: QueryParameters,
		output: QueryParameters,
		policy: FailurePolicy,
	) -> Self {
		Self {
			finder,
			pacs,
			output,
			policy,
		}
	}

	pub async fn run(&self, pairs: impl IntoIterator<Item = (PathBuf, PathBuf)>) -> RunSummary {
		let mut summary = RunSummary::default();

		for (input, output) in pairs {
			match self.process_file(&input, &output).await {
				Ok(matches) => {
					info!(
						input = %input.display(),
						output = %output.display(),
						matches,
						"Saved query results"
					);
					summary.outcomes.push(FileOutcome::Written {
						input,
						output,
						matches,
					});
				}
				Err(err) => {
					warn!(input = %input.display(), policy = self.policy.as_str(), "Query failed");
					summary.outcomes.push(FileOutcome::Failed { input, error: err });
					if self.policy == FailurePolicy::Abort {
						break;
					}
				}
			}
		}

		summary
	}

	#[instrument(skip_all, fields(input = %input.display()))]
	async fn process_file(&self, input: &Path, output: &Path) -> Result<usize, PipelineError> {
		let date = date_get(&input.to_string_lossy());
		let parameters = QueryParameters::merged([
			self.pacs.clone(),
			study_date_filter(&date),
			self.output.clone(),
		]);

		let result = self.finder.find(&parameters).await?;
		let report = report::render(&result, &parameters)?;
		let json = report::to_json_pretty(&report)?;

		if let Some(parent) = output.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.map_err(|source| PipelineError::Write {
					path: parent.to_path_buf(),
					source,
				})?;
		}
		tokio::fs::write(output, json)
			.await
			.map_err(|source| PipelineError::Write {
				path: output.to_path_buf(),
				source,
			})?;

		Ok(result.matches.len())
	}
}
