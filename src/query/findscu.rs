//! C-FIND by way of DCMTK's `findscu` executable.
//!
//! `findscu` logs every response identifier as a data set dump, e.g.
//!
//! ```text
//! I: ---------------------------
//! I: Find Response: 1 (Pending)
//! I:
//! I: # Dicom-Data-Set
//! I: # Used TransferSyntax: Little Endian Explicit
//! I: (0008,0020) DA [20200701]                               #   8, 1 StudyDate
//! ```
//!
//! These dumps are turned back into data sets.

use crate::query::{
	FindResult, FindService, QueryError, QueryParameters, CALLED_AET, CALLING_AET, EXECUTABLE,
	SERVER_IP, SERVER_PORT,
};
use async_trait::async_trait;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::InMemDicomObject;
use regex::Regex;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, info, instrument, trace};

static RESPONSE_HEADER: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"Find Response:\s*\d+").expect("valid regex"));

static ELEMENT_LINE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(
		r"^\((?P<group>[0-9a-fA-F]{4}),(?P<element>[0-9a-fA-F]{4})\)\s+(?P<vr>[A-Z]{2})\s+(?P<value>.*?)\s+#\s*\d+,\s*\d+\s+\S+\s*$",
	)
	.expect("valid regex")
});

/// Runs the findscu executable named by the `executable` parameter.
#[derive(Debug, Default)]
pub struct FindscuService;

impl FindscuService {
	pub const fn new() -> Self {
		Self
	}

	/// Command line arguments (without the executable) for a query.
	pub fn arguments(&self, parameters: &QueryParameters) -> Result<Vec<String>, QueryError> {
		let port = parameters.require(SERVER_PORT)?;
		if port.parse::<u16>().is_err() {
			return Err(QueryError::InvalidParameter {
				key: SERVER_PORT,
				value: port.to_owned(),
			});
		}

		let mut arguments = vec![
			String::from("-v"),
			String::from("-xi"),
			// Study root information model
			String::from("-S"),
			String::from("-aet"),
			parameters.require(CALLING_AET)?.to_owned(),
			String::from("-aec"),
			parameters.require(CALLED_AET)?.to_owned(),
		];

		for element in &parameters.identifier() {
			let tag = element.header().tag;
			let value = element
				.to_str()
				.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
				.unwrap_or_default();
			arguments.push(String::from("-k"));
			if value.is_empty() {
				arguments.push(format!("{:04X},{:04X}", tag.0, tag.1));
			} else {
				arguments.push(format!("{:04X},{:04X}={value}", tag.0, tag.1));
			}
		}

		arguments.push(parameters.require(SERVER_IP)?.to_owned());
		arguments.push(port.to_owned());
		Ok(arguments)
	}
}

#[async_trait]
impl FindService for FindscuService {
	#[instrument(skip_all)]
	async fn find(&self, parameters: &QueryParameters) -> Result<FindResult, QueryError> {
		let executable = parameters.require(EXECUTABLE)?;
		let arguments = self.arguments(parameters)?;
		let command = std::iter::once(executable)
			.chain(arguments.iter().map(String::as_str))
			.collect::<Vec<_>>()
			.join(" ");
		debug!(command, "Running findscu");

		let output = Command::new(executable)
			.args(&arguments)
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.output()
			.await
			.map_err(|source| QueryError::Spawn {
				executable: executable.to_owned(),
				source,
			})?;

		let stdout = String::from_utf8_lossy(&output.stdout);
		let stderr = String::from_utf8_lossy(&output.stderr);
		if !output.status.success() {
			return Err(QueryError::Process {
				command,
				status: output.status,
				stderr: stderr.trim().to_owned(),
			});
		}

		// Depending on the DCMTK version the responses are logged to either stream.
		let mut matches = parse_responses(&stdout);
		matches.extend(parse_responses(&stderr));
		info!(matches = matches.len(), "findscu finished");

		Ok(FindResult { command, matches })
	}
}

/// Extracts one data set per `Find Response` block of a findscu log.
pub fn parse_responses(log: &str) -> Vec<InMemDicomObject> {
	let mut responses = Vec::new();
	let mut current: Option<InMemDicomObject> = None;

	for line in log.lines() {
		let line = strip_log_level(line);
		if RESPONSE_HEADER.is_match(line) {
			responses.extend(current.take());
			current = Some(InMemDicomObject::new_empty());
			continue;
		}
		let Some(object) = current.as_mut() else {
			continue;
		};
		if let Some(element) = parse_element(line) {
			object.put(element);
		}
	}
	responses.extend(current);
	responses
}

/// Removes the `X: ` log level prefix of a DCMTK log line.
fn strip_log_level(line: &str) -> &str {
	let bytes = line.as_bytes();
	if bytes.len() >= 2 && bytes[0].is_ascii_uppercase() && bytes[1] == b':' {
		line[2..].strip_prefix(' ').unwrap_or(&line[2..])
	} else {
		line
	}
}

/// Parses a top level element of a data set dump.
/// Nested (indented) elements and sequences are skipped.
fn parse_element(line: &str) -> Option<DataElement<InMemDicomObject>> {
	let captures = ELEMENT_LINE.captures(line)?;
	let group = u16::from_str_radix(&captures["group"], 16).ok()?;
	let element = u16::from_str_radix(&captures["element"], 16).ok()?;
	let vr: VR = captures["vr"].parse().ok()?;
	if vr == VR::SQ {
		trace!("Skipping sequence ({group:04X},{element:04X})");
		return None;
	}

	let raw = &captures["value"];
	let text = if raw == "(no value available)" {
		""
	} else if let Some(inner) = raw.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
		inner
	} else {
		raw
	};

	Some(DataElement::new(Tag(group, element), vr, primitive_value(vr, text)))
}

fn primitive_value(vr: VR, text: &str) -> PrimitiveValue {
	if text.is_empty() {
		return PrimitiveValue::Empty;
	}
	let values: Vec<&str> = text.split('\\').collect();

	let numbers = match vr {
		VR::US => values
			.iter()
			.map(|v| v.trim().parse::<u16>())
			.collect::<Result<Vec<_>, _>>()
			.ok()
			.map(|v| PrimitiveValue::U16(v.into())),
		VR::UL => values
			.iter()
			.map(|v| v.trim().parse::<u32>())
			.collect::<Result<Vec<_>, _>>()
			.ok()
			.map(|v| PrimitiveValue::U32(v.into())),
		_ => None,
	};

	numbers.unwrap_or_else(|| match values.as_slice() {
		[single] => PrimitiveValue::from(*single),
		_ => PrimitiveValue::Strs(values.into_iter().map(String::from).collect()),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::query::study_date_filter;
	use dicom::dictionary_std::tags;
	use dicom::object::mem::InMemElement;

	const LOG: &str = "\
I: Requesting Association
I: Association Accepted (Max Send PDV: 16372)
I: Sending Find Request (MsgID 1)
I: ---------------------------
I: Find Response: 1 (Pending)
I:
I: # Dicom-Data-Set
I: # Used TransferSyntax: Little Endian Explicit
I: (0008,0005) CS [ISO_IR 100]                             #  10, 1 SpecificCharacterSet
I: (0008,0020) DA [20200701]                               #   8, 1 StudyDate
I: (0008,0061) CS [CT\\MR]                                  #   6, 2 ModalitiesInStudy
I: (0008,1110) SQ (Sequence with explicit length #=1)      #  50, 1 ReferencedStudySequence
I:   (fffe,e000) na (Item with explicit length #=2)          #  42, 1 Item
I:     (0008,1150) UI =CTImageStorage                          #  26, 1 ReferencedSOPClassUID
I: (0010,0010) PN [DOE^JANE]                               #   8, 1 PatientName
I: (0010,0020) LO [1449c1d]                                #   8, 1 PatientID
I: (0020,1206) IS [3]                                      #   2, 1 NumberOfStudyRelatedSeries
I: (0032,1060) LO (no value available)                     #   0, 0 RequestedProcedureDescription
I:
I: ---------------------------
W: Find Response: 2 (Pending)
W:
W: # Dicom-Data-Set
W: (0008,0020) DA [20200701]                               #   8, 1 StudyDate
W: (0010,0020) LO [8675309]                                #   8, 1 PatientID
I: Received Final Find Response (Success)
I: Releasing Association
";

	fn text(object: &InMemDicomObject, tag: Tag) -> Option<String> {
		object
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.into_owned())
	}

	#[test]
	fn parses_one_data_set_per_response() {
		let responses = parse_responses(LOG);
		assert_eq!(responses.len(), 2);

		let first = &responses[0];
		assert_eq!(text(first, tags::STUDY_DATE).as_deref(), Some("20200701"));
		assert_eq!(text(first, tags::PATIENT_NAME).as_deref(), Some("DOE^JANE"));
		assert_eq!(text(first, tags::PATIENT_ID).as_deref(), Some("1449c1d"));
		assert_eq!(
			text(first, tags::MODALITIES_IN_STUDY).as_deref(),
			Some("CT\\MR")
		);
		assert_eq!(
			text(first, tags::REQUESTED_PROCEDURE_DESCRIPTION).as_deref(),
			Some("")
		);
		// Sequences and their nested items are not carried over
		assert!(first.get(tags::REFERENCED_STUDY_SEQUENCE).is_none());
		assert!(first.get(tags::REFERENCED_SOP_CLASS_UID).is_none());

		let second = &responses[1];
		assert_eq!(text(second, tags::PATIENT_ID).as_deref(), Some("8675309"));
		assert!(second.get(tags::PATIENT_NAME).is_none());
	}

	#[test]
	fn no_responses_without_matches() {
		let log = "I: Requesting Association\nI: Received Final Find Response (Success)\n";
		assert!(parse_responses(log).is_empty());
	}

	#[test]
	fn multi_valued_numbers() {
		let value = primitive_value(VR::US, "512\\256");
		assert_eq!(value, PrimitiveValue::U16([512, 256].as_slice().into()));
	}

	#[test]
	fn arguments_carry_connection_and_filter() {
		let parameters = QueryParameters::merged([
			QueryParameters::merged([[
				("aet", "CHIPS"),
				("aec", "ORTHANC"),
				("serverIP", "127.0.0.1"),
				("serverPort", "4242"),
			]]),
			study_date_filter("20200701"),
		]);
		let arguments = FindscuService::new().arguments(&parameters).unwrap();

		assert_eq!(&arguments[..7], ["-v", "-xi", "-S", "-aet", "CHIPS", "-aec", "ORTHANC"]);
		assert_eq!(&arguments[arguments.len() - 2..], ["127.0.0.1", "4242"]);
		assert!(arguments.contains(&String::from("0008,0052=STUDY")));
		assert!(arguments.contains(&String::from("0008,0020=20200701")));
		assert!(arguments.contains(&String::from("0010,0010")));
	}

	#[test]
	fn arguments_reject_invalid_port() {
		let parameters = QueryParameters::merged([[
			("aet", "CHIPS"),
			("aec", "ORTHANC"),
			("serverIP", "127.0.0.1"),
			("serverPort", "http"),
		]]);
		assert!(matches!(
			FindscuService::new().arguments(&parameters),
			Err(QueryError::InvalidParameter { key: SERVER_PORT, .. })
		));
	}

	/// Writes an executable shell script standing in for findscu.
	#[cfg(unix)]
	fn fake_findscu(dir: &std::path::Path, body: &str) -> String {
		use std::os::unix::fs::PermissionsExt;

		let path = dir.join("findscu");
		std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
		path.to_string_lossy().into_owned()
	}

	fn parameters_for(executable: &str) -> QueryParameters {
		QueryParameters::merged([
			QueryParameters::merged([[
				("executable", executable),
				("aet", "CHIPS"),
				("aec", "ORTHANC"),
				("serverIP", "127.0.0.1"),
				("serverPort", "4242"),
			]]),
			study_date_filter("20200701"),
		])
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn find_parses_responses_of_executable() {
		let dir = tempfile::tempdir().unwrap();
		let executable = fake_findscu(
			dir.path(),
			r#"echo "$@" > "$(dirname "$0")/arguments"
cat >&2 <<'EOF'
I: Find Response: 1 (Pending)
I: (0008,0020) DA [20200701]                               #   8, 1 StudyDate
I: (0010,0020) LO [1449c1d]                                #   8, 1 PatientID
I: Received Final Find Response (Success)
EOF"#,
		);

		let result = FindscuService::new()
			.find(&parameters_for(&executable))
			.await
			.unwrap();

		assert_eq!(result.matches.len(), 1);
		assert_eq!(
			text(&result.matches[0], tags::PATIENT_ID).as_deref(),
			Some("1449c1d")
		);
		assert!(result.command.starts_with(&format!("{executable} -v -xi -S")));

		let arguments = std::fs::read_to_string(dir.path().join("arguments")).unwrap();
		assert!(arguments.contains("-k 0008,0020=20200701"));
		assert!(arguments.trim_end().ends_with("127.0.0.1 4242"));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn non_zero_exit_is_a_process_error() {
		let dir = tempfile::tempdir().unwrap();
		let executable = fake_findscu(
			dir.path(),
			"echo 'E: Association Request Failed' >&2\nexit 1",
		);

		let result = FindscuService::new().find(&parameters_for(&executable)).await;

		match result {
			Err(QueryError::Process { status, stderr, .. }) => {
				assert_eq!(status.code(), Some(1));
				assert_eq!(stderr, "E: Association Request Failed");
			}
			other => panic!("expected a process error, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn missing_executable_is_a_spawn_error() {
		let parameters = QueryParameters::merged([[
			("executable", "/nonexistent/findscu"),
			("aet", "CHIPS"),
			("aec", "ORTHANC"),
			("serverIP", "127.0.0.1"),
			("serverPort", "4242"),
			("StudyDate", "20200701"),
		]]);
		let result = FindscuService::new().find(&parameters).await;
		assert!(matches!(result, Err(QueryError::Spawn { .. })));
	}
}
