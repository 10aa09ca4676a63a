use crate::{
    protocol::{
        ClientCallbackData, NetworkError, NetworkRequest, Receiver, RequestId, Sender,
        SequenceNo, ServerCallbackData, next_sequence_number,
    },
    report::{Selection, Value},
};

use super::{
    METRIC_TREE_VALUES_REQUEST, receive_selections, receive_values, send_selections, send_values,
};

/// Values of every metric, aggregated over a selection of call-tree nodes and system
/// resources.
#[derive(Debug, Default)]
pub struct MetricTreeValuesRequest {
    sequence: SequenceNo,
    cnodes: Vec<Selection>,
    sysres: Vec<Selection>,
    inclusive: Vec<Value>,
    exclusive: Vec<Value>,
}

impl MetricTreeValuesRequest {
    /// An empty selection list stands for the whole tree.
    pub fn new(cnodes: Vec<Selection>, sysres: Vec<Selection>) -> Self {
        Self {
            sequence: next_sequence_number(),
            cnodes,
            sysres,
            ..Self::default()
        }
    }

    /// A server-side request that already holds its result.
    #[cfg(test)]
    pub(crate) fn answered(inclusive: Vec<Value>, exclusive: Vec<Value>) -> Self {
        Self {
            inclusive,
            exclusive,
            ..Self::default()
        }
    }

    pub fn cnode_selections(&self) -> &[Selection] {
        &self.cnodes
    }

    pub fn sysres_selections(&self) -> &[Selection] {
        &self.sysres
    }

    /// One value per metric, indexed by metric id.
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

impl NetworkRequest for MetricTreeValuesRequest {
    fn id(&self) -> RequestId {
        METRIC_TREE_VALUES_REQUEST
    }

    fn name(&self) -> &'static str {
        "MetricTreeValues"
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
        send_selections(tx, &self.cnodes)?;
        send_selections(tx, &self.sysres)
    }

    fn receive_request_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        self.cnodes = receive_selections(rx)?;
        self.sysres = receive_selections(rx)?;
        Ok(())
    }

    fn process_request(&mut self, data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        let (inclusive, exclusive) = data
            .report()?
            .metric_tree_values(&self.cnodes, &self.sysres)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{CalculationFlavour, tests::sample_report};

    #[test]
    fn processing_needs_an_open_report() {
        let mut request = MetricTreeValuesRequest::new(vec![], vec![]);
        let mut data = ServerCallbackData::default();

        assert!(matches!(
            request.process_request(&mut data),
            Err(NetworkError::Recoverable(_))
        ));

        data.set_report(sample_report());
        request.process_request(&mut data).unwrap();
        assert_eq!(request.inclusive_values().len(), 2);
    }

    #[test]
    fn unknown_cnode_is_recoverable() {
        let mut request =
            MetricTreeValuesRequest::new(vec![(42, CalculationFlavour::Exclusive)], vec![]);
        let mut data = ServerCallbackData::default();
        data.set_report(sample_report());

        assert!(matches!(
            request.process_request(&mut data),
            Err(NetworkError::Recoverable(ref msg)) if msg.contains("cnode")
        ));
    }
}
