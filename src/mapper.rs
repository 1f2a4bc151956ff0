//! Pairs the input files of a plugin run with the output files written for them.

use globset::{GlobBuilder, GlobMatcher};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum MapperError {
	#[error("Invalid glob pattern '{pattern}': {source}")]
	Pattern {
		pattern: String,
		source: globset::Error,
	},
	#[error("Failed to list input directory: {0}")]
	Walk(#[from] walkdir::Error),
}

/// Maps every file of `input_dir` matching a glob to a file of the same relative path under
/// `output_dir`, with its extension replaced.
#[derive(Debug)]
pub struct PathMapper {
	input_dir: PathBuf,
	output_dir: PathBuf,
	matcher: GlobMatcher,
	extension: String,
}

impl PathMapper {
	pub fn file_mapper(
		input_dir: impl Into<PathBuf>,
		output_dir: impl Into<PathBuf>,
		pattern: &str,
		suffix: &str,
	) -> Result<Self, MapperError> {
		let matcher = GlobBuilder::new(pattern)
			.literal_separator(true)
			.build()
			.map_err(|source| MapperError::Pattern {
				pattern: pattern.to_owned(),
				source,
			})?
			.compile_matcher();

		Ok(Self {
			input_dir: input_dir.into(),
			output_dir: output_dir.into(),
			matcher,
			extension: suffix.trim_start_matches('.').to_owned(),
		})
	}

	/// The output path for a path relative to the input directory.
	pub fn output_path(&self, relative: &Path) -> PathBuf {
		self.output_dir.join(relative).with_extension(&self.extension)
	}

	/// All (input, output) pairs in depth-first order, siblings sorted by file name.
	pub fn pairs(&self) -> Result<Vec<(PathBuf, PathBuf)>, MapperError> {
		let mut pairs = Vec::new();
		for entry in WalkDir::new(&self.input_dir)
			.follow_links(true)
			.sort_by_file_name()
		{
			let entry = entry?;
			if !entry.file_type().is_file() {
				continue;
			}
			let Ok(relative) = entry.path().strip_prefix(&self.input_dir) else {
				continue;
			};
			if !self.matcher.is_match(relative) {
				trace!(path = %relative.display(), "Skipping file not matching pattern");
				continue;
			}
			let output = self.output_path(relative);
			pairs.push((entry.path().to_path_buf(), output));
		}

		debug!(
			input_dir = %self.input_dir.display(),
			files = pairs.len(),
			"Mapped input files"
		);
		Ok(pairs)
	}
}
