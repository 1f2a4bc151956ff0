//! Rendering of query results into the JSON documents written for every input file.

use crate::query::{FindResult, QueryParameters, PRINT_REPORT};
use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::InMemDicomObject;
use dicom_json::DicomJson;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::str::FromStr;
use thiserror::Error;

/// Layout of the `data` array of a report.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
	/// Attributes keyed by their keyword, each with tag, value and label
	#[default]
	Json,
	/// The DICOM JSON model
	Dicomweb,
}

impl ReportFormat {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Json => "json",
			Self::Dicomweb => "dicomweb",
		}
	}
}

impl FromStr for ReportFormat {
	type Err = ReportError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"json" => Ok(Self::Json),
			"dicomweb" => Ok(Self::Dicomweb),
			other => Err(ReportError::UnknownFormat(other.to_owned())),
		}
	}
}

#[derive(Debug, Error)]
pub enum ReportError {
	#[error("Unknown report format '{0}'")]
	UnknownFormat(String),
	#[error("Failed to serialize report: {0}")]
	Serialize(#[from] serde_json::Error),
}

/// Builds the report of a query. The format is taken from the `printReport` parameter.
pub fn render(result: &FindResult, parameters: &QueryParameters) -> Result<Value, ReportError> {
	let format = parameters
		.get(PRINT_REPORT)
		.map(ReportFormat::from_str)
		.transpose()?
		.unwrap_or_default();

	let data = result
		.matches
		.iter()
		.map(|object| match format {
			ReportFormat::Json => Ok(labelled(object)),
			ReportFormat::Dicomweb => serde_json::to_value(DicomJson::from(object.clone())),
		})
		.collect::<Result<Vec<_>, _>>()?;

	Ok(json!({
		"status": "success",
		"command": result.command,
		"args": parameters,
		"data": data,
	}))
}

/// Maps each attribute keyword to its tag, value and label.
fn labelled(object: &InMemDicomObject) -> Value {
	let mut attributes = Map::new();
	for element in object {
		let tag = element.header().tag;
		let label = StandardDataDictionary
			.by_tag(tag)
			.map_or_else(|| format!("{:04X}{:04X}", tag.0, tag.1), |entry| {
				entry.alias().to_owned()
			});
		let value = element
			.to_str()
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
			.unwrap_or_default();

		attributes.insert(
			label.clone(),
			json!({
				"tag": format!("0x{:04X},0x{:04X}", tag.0, tag.1),
				"value": value,
				"label": label,
			}),
		);
	}
	Value::Object(attributes)
}

/// Serializes a report with an indentation of four spaces.
pub fn to_json_pretty<T: Serialize>(value: &T) -> Result<String, ReportError> {
	let mut buffer = Vec::new();
	let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
	let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
	value.serialize(&mut serializer)?;
	// serde_json only ever emits valid UTF-8
	Ok(String::from_utf8_lossy(&buffer).into_owned())
}
