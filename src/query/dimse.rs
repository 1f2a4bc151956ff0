use crate::dimse::association::Peer;
use crate::dimse::cfind::FindServiceClassUser;
use crate::query::{
	FindResult, FindService, QueryError, QueryParameters, CALLED_AET, CALLING_AET, SERVER_IP,
	SERVER_PORT,
};
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use std::time::Duration;
use tracing::{info, instrument};

/// Performs the C-FIND without any external tool.
pub struct DimseFindService {
	timeout: Duration,
}

impl DimseFindService {
	pub const fn new(timeout: Duration) -> Self {
		Self { timeout }
	}

	fn peer(&self, parameters: &QueryParameters) -> Result<Peer, QueryError> {
		let port = parameters.require(SERVER_PORT)?;
		let port: u16 = port.parse().map_err(|_| QueryError::InvalidParameter {
			key: SERVER_PORT,
			value: port.to_owned(),
		})?;

		Ok(Peer {
			calling_aet: parameters.require(CALLING_AET)?.to_owned(),
			called_aet: parameters.require(CALLED_AET)?.to_owned(),
			address: format!("{}:{port}", parameters.require(SERVER_IP)?),
			timeout: self.timeout,
		})
	}
}

/// A findscu-like rendition of the C-FIND, e.g. `C-FIND CHIPS -> ORTHANC@127.0.0.1:4242 -k 0008,0020=20200701`.
fn describe(peer: &Peer, identifier: &InMemDicomObject) -> String {
	let mut command = format!("C-FIND {} -> {peer}", peer.calling_aet);
	for element in identifier {
		let Ok(value) = element.to_str() else {
			continue;
		};
		let value = value.trim_end_matches(['\0', ' ']);
		if !value.is_empty() {
			let tag = element.header().tag;
			command.push_str(&format!(" -k {:04X},{:04X}={value}", tag.0, tag.1));
		}
	}
	command
}

#[async_trait]
impl FindService for DimseFindService {
	#[instrument(skip_all)]
	async fn find(&self, parameters: &QueryParameters) -> Result<FindResult, QueryError> {
		let peer = self.peer(parameters)?;
		let identifier = parameters.identifier();
		let command = describe(&peer, &identifier);

		let matches = FindServiceClassUser::new(peer).find(&identifier).await?;
		info!(matches = matches.len(), "C-FIND finished");

		Ok(FindResult { command, matches })
	}
}
