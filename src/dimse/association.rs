use dicom_ul::association::client::AsyncClientAssociation;
use dicom_ul::pdu::PresentationContextResultReason;
use dicom_ul::{ClientAssociationOptions, Pdu};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error("Timed out after {0:?}")]
	Timeout(Duration),
	#[error(transparent)]
	Association(#[from] dicom_ul::association::Error),
}

/// The PACS an association is requested with, and the identity it is requested as.
#[derive(Debug, Clone)]
pub struct Peer {
	pub calling_aet: String,
	pub called_aet: String,
	/// host:port
	pub address: String,
	/// Bounds establishing the association and every PDU exchanged on it
	pub timeout: Duration,
}

impl Display for Peer {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}@{}", self.called_aet, self.address)
	}
}

/// The presentation context the PACS accepted for the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedContext {
	pub id: u8,
	pub transfer_syntax: String,
}

/// An established association, as far as a C-FIND needs one.
pub trait Association {
	fn accepted_context(&self) -> Option<AcceptedContext>;

	async fn send(&mut self, pdu: Pdu) -> Result<(), AssociationError>;

	async fn receive(&mut self) -> Result<Pdu, AssociationError>;

	/// Ends the association with an A-RELEASE.
	async fn release(self) -> Result<(), AssociationError>;

	/// Ends the association with an A-ABORT.
	async fn abort(self) -> Result<(), AssociationError>;
}

async fn bounded<T>(
	timeout: Duration,
	operation: impl Future<Output = Result<T, dicom_ul::association::Error>>,
) -> Result<T, AssociationError> {
	tokio::time::timeout(timeout, operation)
		.await
		.map_err(|_| AssociationError::Timeout(timeout))?
		.map_err(AssociationError::from)
}

/// An association over TCP, requested by this plugin.
pub struct ClientAssociation {
	inner: AsyncClientAssociation<TcpStream>,
	timeout: Duration,
}

impl ClientAssociation {
	/// Requests an association proposing `abstract_syntax` in explicit and implicit VR little endian.
	#[instrument(skip_all, fields(peer = %peer))]
	pub async fn request(peer: &Peer, abstract_syntax: &str) -> Result<Self, AssociationError> {
		let establish = ClientAssociationOptions::new()
			.calling_ae_title(peer.calling_aet.as_str())
			.called_ae_title(peer.called_aet.as_str())
			.with_presentation_context(
				abstract_syntax,
				vec![
					dicom::dictionary_std::uids::EXPLICIT_VR_LITTLE_ENDIAN,
					dicom::dictionary_std::uids::IMPLICIT_VR_LITTLE_ENDIAN,
				],
			)
			.establish_with_async(&peer.address);

		let inner = bounded(peer.timeout, establish).await?;
		debug!("Association established");
		Ok(Self {
			inner,
			timeout: peer.timeout,
		})
	}
}

impl Association for ClientAssociation {
	fn accepted_context(&self) -> Option<AcceptedContext> {
		self.inner
			.presentation_contexts()
			.iter()
			.find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
			.map(|pc| AcceptedContext {
				id: pc.id,
				transfer_syntax: pc.transfer_syntax.trim_end_matches('\0').to_owned(),
			})
	}

	async fn send(&mut self, pdu: Pdu) -> Result<(), AssociationError> {
		bounded(self.timeout, self.inner.send(&pdu)).await
	}

	async fn receive(&mut self) -> Result<Pdu, AssociationError> {
		bounded(self.timeout, self.inner.receive()).await
	}

	async fn release(self) -> Result<(), AssociationError> {
		bounded(self.timeout, self.inner.release()).await
	}

	async fn abort(self) -> Result<(), AssociationError> {
		bounded(self.timeout, self.inner.abort()).await
	}
}
