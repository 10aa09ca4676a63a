use crate::protocol::{
    ClientCallbackData, NetworkError, NetworkRequest, PROTOCOL_VERSION, Receiver, RequestId,
    Sender, SequenceNo, ServerCallbackData, next_sequence_number,
};

use super::VERSION_REQUEST;

/// Version of this library as `major * 10000 + minor * 100 + patch`.
pub fn library_version() -> u32 {
    let part = |value: &str| value.parse::<u32>().unwrap_or(0);
    part(env!("CARGO_PKG_VERSION_MAJOR")) * 10_000
        + part(env!("CARGO_PKG_VERSION_MINOR")) * 100
        + part(env!("CARGO_PKG_VERSION_PATCH"))
}

/// Asks the server which library and protocol version it runs.
#[derive(Debug, Default)]
pub struct VersionRequest {
    sequence: SequenceNo,
    library_version: u32,
    protocol_version: u32,
}

impl VersionRequest {
    pub fn new() -> Self {
        Self {
            sequence: next_sequence_number(),
            ..Self::default()
        }
    }

    /// Library version of the server, once answered.
    pub fn library_version(&self) -> u32 {
        self.library_version
    }

    /// Protocol version of the server, once answered.
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}

impl NetworkRequest for VersionRequest {
    fn id(&self) -> RequestId {
        VERSION_REQUEST
    }

    fn name(&self) -> &'static str {
        "Version"
    }

    fn sequence_number(&self) -> SequenceNo {
        self.sequence
    }

    fn set_sequence_number(&mut self, sequence: SequenceNo) {
        self.sequence = sequence;
    }

    fn process_request(&mut self, _data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        self.library_version = library_version();
        self.protocol_version = PROTOCOL_VERSION;
        Ok(())
    }

    fn send_response_payload(
        &self,
        tx: &mut Sender<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        tx.put(self.library_version)?;
        tx.put(self.protocol_version)
    }

    fn receive_response_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        _data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        self.library_version = rx.get()?;
        self.protocol_version = rx.get()?;
        Ok(())
    }
}
