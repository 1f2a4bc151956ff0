//! Study root C-FIND as a service class user.
//!
//! Every query gets its own association carrying a single request. The association is released
//! once the final response arrived, and aborted on any error or unsuccessful final status.

use super::association::{AcceptedContext, Association, AssociationError, ClientAssociation, Peer};
use crate::query::STUDY_ROOT_FIND;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::Pdu;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

const C_FIND_RQ: u16 = 0x0020;
const C_FIND_RSP: u16 = 0x8020;
/// Command Data Set Type (0000,0800) of a message without data set.
const NO_DATA_SET: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0001;
const PRIORITY_MEDIUM: u16 = 0x0000;
/// Each association carries exactly one request.
const MESSAGE_ID: u16 = 1;

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error("The PACS accepted no presentation context for {0}")]
	NotAccepted(&'static str),
	#[error("Unsupported transfer syntax '{0}'")]
	TransferSyntax(String),
	#[error("Failed to encode message: {0}")]
	Encode(#[from] dicom::object::WriteError),
	#[error("Failed to decode message: {0}")]
	Decode(#[from] dicom::object::ReadError),
	#[error("Expected P-DATA, received {0:?}")]
	UnexpectedPdu(Box<Pdu>),
	#[error("Expected a C-FIND-RSP, received command field {0:?}")]
	UnexpectedCommand(Option<u16>),
	#[error("Received a data set before its command set")]
	OutOfOrder,
	#[error("C-FIND-RSP carries no status")]
	MissingStatus,
	#[error("C-FIND failed with status 0x{0:04X}")]
	Status(u16),
}

/// Meaning of the status (0000,0900) of a C-FIND-RSP.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FindStatus {
	/// A match follows, more may come
	Pending,
	Success,
	Warning,
	Cancel,
	/// Refused, identifier mismatch, unable to process, or a code this plugin does not know
	Failure,
}

impl From<u16> for FindStatus {
	fn from(code: u16) -> Self {
		match code {
			0x0000 => Self::Success,
			0xFF00 | 0xFF01 => Self::Pending,
			0xFE00 => Self::Cancel,
			0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Self::Warning,
			_ => Self::Failure,
		}
	}
}

/// Runs C-FIND requests against one PACS.
pub struct FindServiceClassUser {
	peer: Peer,
}

impl FindServiceClassUser {
	pub const fn new(peer: Peer) -> Self {
		Self { peer }
	}

	/// Returns the identifiers of all matches.
	#[instrument(skip_all, fields(peer = %self.peer))]
	pub async fn find(
		&self,
		identifier: &InMemDicomObject,
	) -> Result<Vec<InMemDicomObject>, FindError> {
		let association = ClientAssociation::request(&self.peer, STUDY_ROOT_FIND).await?;
		run(association, STUDY_ROOT_FIND, identifier).await
	}
}

/// Performs the exchange on an established association and tears it down afterwards.
async fn run<A: Association>(
	mut association: A,
	sop_class: &'static str,
	identifier: &InMemDicomObject,
) -> Result<Vec<InMemDicomObject>, FindError> {
	match exchange(&mut association, sop_class, identifier).await {
		Ok(matches) => {
			if let Err(err) = association.release().await {
				warn!("Failed to release association: {err}");
			}
			Ok(matches)
		}
		Err(err) => {
			if let Err(abort_err) = association.abort().await {
				warn!("Failed to abort association: {abort_err}");
			}
			Err(err)
		}
	}
}

async fn exchange<A: Association>(
	association: &mut A,
	sop_class: &'static str,
	identifier: &InMemDicomObject,
) -> Result<Vec<InMemDicomObject>, FindError> {
	let context = association
		.accepted_context()
		.ok_or(FindError::NotAccepted(sop_class))?;

	for pdu in request_pdus(&context, sop_class, identifier)? {
		association.send(pdu).await?;
	}
	trace!("Sent C-FIND-RQ");

	let mut matches = Vec::new();
	loop {
		let (status, data) = receive_response(association, &context).await?;
		match FindStatus::from(status) {
			FindStatus::Pending => matches.extend(data),
			FindStatus::Success | FindStatus::Warning => {
				debug!(status, matches = matches.len(), "Received final C-FIND-RSP");
				return Ok(matches);
			}
			FindStatus::Failure | FindStatus::Cancel => return Err(FindError::Status(status)),
		}
	}
}

/// The C-FIND-RQ as a command PDU followed by the identifier PDU.
fn request_pdus(
	context: &AcceptedContext,
	sop_class: &str,
	identifier: &InMemDicomObject,
) -> Result<[Pdu; 2], FindError> {
	let command = InMemDicomObject::command_from_element_iter([
		DataElement::new(
			tags::AFFECTED_SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from(sop_class),
		),
		DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(C_FIND_RQ)),
		DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(MESSAGE_ID)),
		DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(PRIORITY_MEDIUM)),
		DataElement::new(
			tags::COMMAND_DATA_SET_TYPE,
			VR::US,
			PrimitiveValue::from(DATA_SET_PRESENT),
		),
	]);

	Ok([
		pdata(
			context.id,
			PDataValueType::Command,
			encode(&command, uids::IMPLICIT_VR_LITTLE_ENDIAN)?,
		),
		pdata(
			context.id,
			PDataValueType::Data,
			encode(identifier, &context.transfer_syntax)?,
		),
	])
}

fn pdata(presentation_context_id: u8, value_type: PDataValueType, data: Vec<u8>) -> Pdu {
	Pdu::PData {
		data: vec![PDataValue {
			presentation_context_id,
			value_type,
			is_last: true,
			data,
		}],
	}
}

/// Receives PDUs until a complete C-FIND-RSP was assembled.
/// Returns its status and, if present, its identifier.
async fn receive_response<A: Association>(
	association: &mut A,
	context: &AcceptedContext,
) -> Result<(u16, Option<InMemDicomObject>), FindError> {
	let mut command_bytes = Vec::new();
	let mut data_bytes = Vec::new();
	let mut status = None;

	loop {
		let values = match association.receive().await? {
			Pdu::PData { data } => data,
			other => return Err(FindError::UnexpectedPdu(Box::new(other))),
		};

		for mut value in values {
			match value.value_type {
				PDataValueType::Command => {
					command_bytes.append(&mut value.data);
					if !value.is_last {
						continue;
					}
					let command = decode(&command_bytes, uids::IMPLICIT_VR_LITTLE_ENDIAN)?;
					let command_field = command_value(&command, tags::COMMAND_FIELD);
					if command_field != Some(C_FIND_RSP) {
						return Err(FindError::UnexpectedCommand(command_field));
					}
					let code =
						command_value(&command, tags::STATUS).ok_or(FindError::MissingStatus)?;
					match command_value(&command, tags::COMMAND_DATA_SET_TYPE) {
						Some(kind) if kind != NO_DATA_SET => status = Some(code),
						_ => return Ok((code, None)),
					}
				}
				PDataValueType::Data => {
					data_bytes.append(&mut value.data);
					if !value.is_last {
						continue;
					}
					let code = status.ok_or(FindError::OutOfOrder)?;
					let data = decode(&data_bytes, &context.transfer_syntax)?;
					return Ok((code, Some(data)));
				}
			}
		}
	}
}

fn command_value(command: &InMemDicomObject, tag: Tag) -> Option<u16> {
	command
		.get(tag)
		.and_then(|element| element.to_int::<u16>().ok())
}

fn encode(object: &InMemDicomObject, transfer_syntax: &str) -> Result<Vec<u8>, FindError> {
	let ts = TransferSyntaxRegistry
		.get(transfer_syntax)
		.ok_or_else(|| FindError::TransferSyntax(transfer_syntax.to_owned()))?;
	let mut bytes = Vec::new();
	object.write_dataset_with_ts(&mut bytes, ts)?;
	Ok(bytes)
}

fn decode(bytes: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject, FindError> {
	let ts = TransferSyntaxRegistry
		.get(transfer_syntax)
		.ok_or_else(|| FindError::TransferSyntax(transfer_syntax.to_owned()))?;
	Ok(InMemDicomObject::read_dataset_with_ts(bytes, ts)?)
}
