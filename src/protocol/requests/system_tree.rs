use crate::{
    protocol::{
        ClientCallbackData, NetworkError, NetworkRequest, Receiver, RequestId, Sender,
        SequenceNo, ServerCallbackData, next_sequence_number,
    },
    report::{Selection, Value},
};

use super::{
    SYSTEM_TREE_VALUES_REQUEST, receive_selections, receive_values, send_selections, send_values,
};

/// Values of every system resource, aggregated over a selection of metrics and
/// call-tree nodes.
#[derive(Debug, Default)]
pub struct SystemTreeValuesRequest {
    sequence: SequenceNo,
    metrics: Vec<Selection>,
    cnodes: Vec<Selection>,
    inclusive: Vec<Value>,
    exclusive: Vec<Value>,
}

impl SystemTreeValuesRequest {
    pub fn new(metrics: Vec<Selection>, cnodes: Vec<Selection>) -> Self {
        Self {
            sequence: next_sequence_number(),
            metrics,
            cnodes,
            ..Self::default()
        }
    }

    pub fn metric_selections(&self) -> &[Selection] {
        &self.metrics
    }

    pub fn cnode_selections(&self) -> &[Selection] {
        &self.cnodes
    }

    pub fn inclusive_values(&self) -> &[Value] {
        &self.inclusive
    }

    pub fn exclusive_values(&self) -> &[Value] {
        &self.exclusive
    }

    pub fn into_values(self) -> (Vec<Value>, Vec<Value>) {
        (self.inclusive, self.exclusive)
    }
}

impl NetworkRequest for SystemTreeValuesRequest {
    fn id(&self) -> RequestId {
        SYSTEM_TREE_VALUES_REQUEST
    }

    fn name(&self) -> &'static str {
        "SystemTreeValues"
    }

    fn sequence_number(&self) -> SequenceNo {
        self.sequence
    }

    fn set_sequence_number(&mut self, sequence: SequenceNo) {
        self.sequence = sequence;
    }

    fn send_request_payload(
        &self,
        tx: &mut Sender<'_>,
        _data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        send_selections(tx, &self.metrics)?;
        send_selections(tx, &self.cnodes)
    }

    fn receive_request_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        self.metrics = receive_selections(rx)?;
        self.cnodes = receive_selections(rx)?;
        Ok(())
    }

    fn process_request(&mut self, data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        let (inclusive, exclusive) = data
            .report()?
            .system_tree_values(&self.metrics, &self.cnodes)?;
        self.inclusive = inclusive;
        self.exclusive = exclusive;
        Ok(())
    }

    fn send_response_payload(
        &self,
        tx: &mut Sender<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        send_values(tx, &self.inclusive, &self.exclusive)
    }

    fn receive_response_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        _data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        (self.inclusive, self.exclusive) = receive_values(rx)?;
        Ok(())
    }
}
