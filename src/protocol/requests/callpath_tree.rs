use crate::{
    protocol::{
        ClientCallbackData, NetworkError, NetworkRequest, Receiver, RequestId, Sender,
        SequenceNo, ServerCallbackData, next_sequence_number,
    },
    report::{Selection, Value},
};

use super::{
    CALLPATH_TREE_VALUES_REQUEST, receive_selections, receive_values, send_selections,
    send_values,
};

/// Values of every call-tree node, aggregated over a selection of metrics and system
/// resources.
#[derive(Debug, Default)]
pub struct CallpathTreeValuesRequest {
    sequence: SequenceNo,
    metrics: Vec<Selection>,
    sysres: Vec<Selection>,
    inclusive: Vec<Value>,
    exclusive: Vec<Value>,
}

impl CallpathTreeValuesRequest {
    pub fn new(metrics: Vec<Selection>, sysres: Vec<Selection>) -> Self {
        Self {
            sequence: next_sequence_number(),
            metrics,
            sysres,
            ..Self::default()
        }
    }

    pub fn metric_selections(&self) -> &[Selection] {
        &self.metrics
    }

    pub fn sysres_selections(&self) -> &[Selection] {
        &self.sysres
    }

    /// One value per cnode, indexed by cnode id.
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

impl NetworkRequest for CallpathTreeValuesRequest {
    fn id(&self) -> RequestId {
        CALLPATH_TREE_VALUES_REQUEST
    }

    fn name(&self) -> &'static str {
        "CallpathTreeValues"
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
        send_selections(tx, &self.sysres)
    }

    fn receive_request_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        self.metrics = receive_selections(rx)?;
        self.sysres = receive_selections(rx)?;
        Ok(())
    }

    fn process_request(&mut self, data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        let (inclusive, exclusive) = data
            .report()?
            .callpath_tree_values(&self.metrics, &self.sysres)?;
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
    fn one_value_pair_per_cnode() {
        let mut request = CallpathTreeValuesRequest::new(
            vec![(0, CalculationFlavour::Inclusive)],
            vec![(2, CalculationFlavour::Inclusive)],
        );
        let mut data = ServerCallbackData::default();
        data.set_report(sample_report());

        request.process_request(&mut data).unwrap();

        assert_eq!(request.inclusive_values().len(), 8);
        assert_eq!(request.exclusive_values().len(), 8);
    }

    #[test]
    fn unknown_metric_is_recoverable() {
        let mut request =
            CallpathTreeValuesRequest::new(vec![(9, CalculationFlavour::Exclusive)], vec![]);
        let mut data = ServerCallbackData::default();
        data.set_report(sample_report());

        assert!(matches!(
            request.process_request(&mut data),
            Err(NetworkError::Recoverable(ref msg)) if msg.contains("metric")
        ));
    }
}
