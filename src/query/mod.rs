//! Study queries against a PACS.
//!
//! Every query is described by a flat [`QueryParameters`] mapping that merges the connection
//! settings, the match keys and the output settings. A [`FindService`] turns such a mapping into
//! the matching data sets, either by running DCMTK's `findscu` ([`findscu`]) or by performing the
//! C-FIND itself ([`dimse`]).

pub mod dimse;
pub mod findscu;

use crate::config::{OutputConfig, PacsConfig};
use async_trait::async_trait;
use dicom::core::dictionary::DataDictionary;
use dicom::core::ops::{ApplyOp, AttributeAction, AttributeOp, AttributeSelector};
use dicom::core::{PrimitiveValue, Tag};
use dicom::dictionary_std::{tags, uids, StandardDataDictionary};
use dicom::object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub use dimse::DimseFindService;
pub use findscu::FindscuService;

/// Path of the query executable.
pub const EXECUTABLE: &str = "executable";
/// Calling application entity title.
pub const CALLING_AET: &str = "aet";
/// Called application entity title.
pub const CALLED_AET: &str = "aec";
pub const SERVER_IP: &str = "serverIP";
pub const SERVER_PORT: &str = "serverPort";
pub const STUDY_DATE: &str = "StudyDate";
pub const PRINT_REPORT: &str = "printReport";
pub const COLORIZE: &str = "colorize";

/// Keys that steer the query itself and never end up in the identifier.
const CONTROL_KEYS: &[&str] = &[
	EXECUTABLE,
	CALLING_AET,
	CALLED_AET,
	SERVER_IP,
	SERVER_PORT,
	PRINT_REPORT,
	COLORIZE,
];

/// Query/Retrieve Level (0008,0052) of every query.
const STUDY_LEVEL: &str = "STUDY";

/// Attributes requested for every matching study.
pub const STUDY_RETURN_TAGS: &[Tag] = &[
	tags::SPECIFIC_CHARACTER_SET,
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::ACCESSION_NUMBER,
	tags::MODALITIES_IN_STUDY,
	tags::REFERRING_PHYSICIAN_NAME,
	tags::STUDY_DESCRIPTION,
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
	tags::PATIENT_AGE,
	tags::STUDY_INSTANCE_UID,
	tags::STUDY_ID,
	tags::NUMBER_OF_STUDY_RELATED_SERIES,
	tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
];

/// SOP class of every C-FIND: the study root information model.
pub const STUDY_ROOT_FIND: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;

/// A flat mapping from parameter names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct QueryParameters(BTreeMap<String, String>);

impl QueryParameters {
	/// Merges all sources into a single parameter set.
	/// A key defined by more than one source takes the value of the last one.
	pub fn merged<I, K, V>(sources: impl IntoIterator<Item = I>) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		let mut parameters = BTreeMap::new();
		for source in sources {
			for (key, value) in source {
				parameters.insert(key.into(), value.into());
			}
		}
		Self(parameters)
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	/// Looks up a parameter that must be present.
	pub fn require(&self, key: &'static str) -> Result<&str, QueryError> {
		self.get(key).ok_or(QueryError::MissingParameter(key))
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// The match keys of this query: every non-control parameter named after a DICOM attribute.
	pub fn match_keys(&self) -> Vec<(Tag, &str)> {
		self.iter()
			.filter(|(key, _)| !CONTROL_KEYS.contains(key))
			.filter_map(|(key, value)| match StandardDataDictionary.parse_tag(key) {
				Some(tag) => Some((tag, value)),
				None => {
					warn!(key, "Ignoring parameter that is not a DICOM attribute");
					None
				}
			})
			.collect()
	}

	/// The study level identifier of the C-FIND request described by these parameters.
	pub fn identifier(&self) -> InMemDicomObject {
		let mut identifier = InMemDicomObject::new_empty();

		let mut attributes = Vec::with_capacity(STUDY_RETURN_TAGS.len() + 2);
		attributes.push((
			AttributeSelector::from(tags::QUERY_RETRIEVE_LEVEL),
			PrimitiveValue::from(STUDY_LEVEL),
		));
		for tag in STUDY_RETURN_TAGS {
			attributes.push((AttributeSelector::from(*tag), PrimitiveValue::Empty));
		}
		for (tag, value) in self.match_keys() {
			attributes.push((AttributeSelector::from(tag), PrimitiveValue::from(value)));
		}

		for (selector, value) in attributes {
			if let Err(err) =
				identifier.apply(AttributeOp::new(selector, AttributeAction::Set(value)))
			{
				warn!("Skipped attribute operation: {err}");
			}
		}
		identifier
	}
}

impl From<&PacsConfig> for QueryParameters {
	fn from(pacs: &PacsConfig) -> Self {
		Self::merged([[
			(EXECUTABLE, pacs.executable.clone()),
			(CALLED_AET, pacs.called_aet.clone()),
			(CALLING_AET, pacs.calling_aet.clone()),
			(SERVER_IP, pacs.server_host.clone()),
			(SERVER_PORT, pacs.server_port.to_string()),
		]])
	}
}

impl From<&OutputConfig> for QueryParameters {
	fn from(output: &OutputConfig) -> Self {
		Self::merged([[
			(PRINT_REPORT, output.print_report.as_str().to_owned()),
			(COLORIZE, output.colorize.clone()),
		]])
	}
}

impl IntoIterator for QueryParameters {
	type Item = (String, String);
	type IntoIter = std::collections::btree_map::IntoIter<String, String>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

/// The match keys of a single study date query.
pub fn study_date_filter(date: &str) -> QueryParameters {
	QueryParameters::merged([[(STUDY_DATE, date)]])
}

/// The outcome of a C-FIND.
#[derive(Debug)]
pub struct FindResult {
	/// A human readable description of how the query was carried out
	pub command: String,
	/// One data set per matching study
	pub matches: Vec<InMemDicomObject>,
}

/// Performs a study level C-FIND described by a parameter set.
#[async_trait]
pub trait FindService: Send + Sync {
	async fn find(&self, parameters: &QueryParameters) -> Result<FindResult, QueryError>;
}

/// Which implementation carries out the C-FIND.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
	/// Run DCMTK's findscu executable
	Findscu,
	/// Speak DIMSE to the PACS directly
	Dimse,
}

impl Backend {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Findscu => "findscu",
			Self::Dimse => "dimse",
		}
	}
}

/// Creates the find service selected by the configuration.
pub fn find_service(pacs: &PacsConfig) -> Box<dyn FindService> {
	match pacs.backend {
		Backend::Findscu => Box::new(FindscuService::new()),
		Backend::Dimse => Box::new(DimseFindService::new(Duration::from_secs(pacs.timeout))),
	}
}

#[derive(Debug, Error)]
pub enum QueryError {
	#[error("Query parameter '{0}' is missing")]
	MissingParameter(&'static str),
	#[error("Query parameter '{key}' has invalid value '{value}'")]
	InvalidParameter { key: &'static str, value: String },
	#[error("Failed to run '{executable}': {source}")]
	Spawn {
		executable: String,
		source: std::io::Error,
	},
	#[error("'{command}' exited with {status}: {stderr}")]
	Process {
		command: String,
		status: std::process::ExitStatus,
		stderr: String,
	},
	#[error(transparent)]
	Find(#[from] crate::dimse::cfind::FindError),
}
