//! Correlation of responses with the client threads waiting for them.
//!
//! A client connection runs exactly one receive loop ([`receive_response_loop`]), which owns
//! the receive half of the connection for as long as it runs. Caller threads never read from
//! the socket. Instead they register in the connection's [`DispatchTable`] under the sequence
//! number of their request and block until the loop has read their response.
//!
//! For every response header the loop:
//!
//! 1. removes the waiter registered for the header's sequence number,
//! 2. reads the response payload into that waiter's request,
//! 3. and only then wakes the waiter.
//!
//! Since one socket carries all responses, a payload must be consumed completely before the
//! next header can be read. Waking the caller after the payload is in place means a caller
//! only ever observes a fully populated request.
//!
//! # Failures
//!
//! A recoverable error response fails the one waiter it names. A connection-fatal error is
//! stored in the table, every waiter still registered is released with it, and every later
//! call on the connection fails fast with the same error.
//!
//! [`DispatchTable::stop`] releases every waiter that the loop has not yet claimed. A waiter
//! whose response the loop is already reading always gets the outcome of that read.
use std::{
    collections::HashMap,
    mem,
    sync::{Arc, Condvar, Mutex},
    thread,
};

use log::{debug, error, trace, warn};

use super::{
    ClientCallbackData, ClientConnection, Connection, NetworkError, NetworkRequest, Receiver,
    ResponseStatus, SequenceNo, receive_response_data, receive_response_header,
};

type SharedRequest = Arc<Mutex<dyn NetworkRequest>>;

/// Single-use hand-off of a response outcome from the receive loop to a waiting caller.
#[derive(Default)]
struct ResponseSlot {
    outcome: Mutex<Option<Result<(), NetworkError>>>,
    ready: Condvar,
}

impl ResponseSlot {
    fn fulfill(&self, outcome: Result<(), NetworkError>) {
        match self.outcome.lock() {
            Ok(mut slot) => {
                if slot.is_none() {
                    *slot = Some(outcome);
                }
            }
            Err(_) => warn!("response slot poisoned, waiter released without an outcome"),
        }
        self.ready.notify_one();
    }

    fn wait(&self) -> Result<(), NetworkError> {
        let slot = self.outcome.lock()?;
        let mut slot = self.ready.wait_while(slot, |outcome| outcome.is_none())?;
        slot.take().unwrap_or(Err(NetworkError::LoopStopped))
    }
}

struct Waiter {
    request: SharedRequest,
    data: Arc<ClientCallbackData>,
    slot: Arc<ResponseSlot>,
}

#[derive(Default)]
struct TableState {
    waiters: HashMap<SequenceNo, Waiter>,
    failure: Option<NetworkError>,
    stopped: bool,
}

/// Pending requests of one client connection, keyed by sequence number, plus the
/// connection-fatal error once one has occurred.
#[derive(Default)]
pub struct DispatchTable {
    state: Mutex<TableState>,
}

/// Handle of a registered waiter.
pub struct PendingResponse {
    sequence: SequenceNo,
    slot: Arc<ResponseSlot>,
}

impl PendingResponse {
    pub fn sequence_number(&self) -> SequenceNo {
        self.sequence
    }

    /// Blocks until the receive loop has read the response or released the waiter.
    pub fn wait(self) -> Result<(), NetworkError> {
        self.slot.wait()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored connection failure, or [`NetworkError::LoopStopped`] once the
    /// receive loop has been stopped.
    pub fn check(&self) -> Result<(), NetworkError> {
        let state = self.state.lock()?;
        Self::ensure_running(&state)
    }

    fn ensure_running(state: &TableState) -> Result<(), NetworkError> {
        if let Some(failure) = &state.failure {
            return Err(failure.replicate());
        }
        if state.stopped {
            return Err(NetworkError::LoopStopped);
        }
        Ok(())
    }

    /// Registers `request` as waiting for its response.
    ///
    /// Register before sending the request: a response arriving for an unregistered
    /// sequence number is dropped.
    pub fn expect(
        &self,
        request: SharedRequest,
        data: Arc<ClientCallbackData>,
    ) -> Result<PendingResponse, NetworkError> {
        let sequence = request.lock()?.sequence_number();
        let slot = Arc::new(ResponseSlot::default());

        let mut state = self.state.lock()?;
        Self::ensure_running(&state)?;
        if state.waiters.contains_key(&sequence) {
            return Err(NetworkError::Unrecoverable(format!(
                "request #{sequence} is already waiting for a response"
            )));
        }
        state.waiters.insert(
            sequence,
            Waiter {
                request,
                data,
                slot: Arc::clone(&slot),
            },
        );
        trace!("waiting for response #{sequence}");

        Ok(PendingResponse { sequence, slot })
    }

    /// Drops the registration of a request that could not be sent.
    pub fn withdraw(&self, sequence: SequenceNo) {
        if let Ok(mut state) = self.state.lock() {
            state.waiters.remove(&sequence);
        }
    }

    /// Number of registered waiters not yet claimed by the receive loop.
    pub fn pending(&self) -> usize {
        self.state.lock().map(|state| state.waiters.len()).unwrap_or(0)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().map(|state| state.stopped).unwrap_or(true)
    }

    /// Stops dispatching and releases every waiter still registered.
    ///
    /// Released waiters receive the stored failure if there is one, and
    /// [`NetworkError::LoopStopped`] otherwise.
    pub fn stop(&self) {
        let (waiters, failure) = match self.state.lock() {
            Ok(mut state) => {
                state.stopped = true;
                let failure = state.failure.as_ref().map(NetworkError::replicate);
                (mem::take(&mut state.waiters), failure)
            }
            Err(_) => return,
        };

        if !waiters.is_empty() {
            debug!("releasing {} pending waiters", waiters.len());
        }
        for (_, waiter) in waiters {
            let outcome = match &failure {
                Some(err) => Err(err.replicate()),
                None => Err(NetworkError::LoopStopped),
            };
            release(waiter, outcome);
        }
    }

    /// Records a connection-fatal error unless the loop was already stopped on purpose.
    fn fail(&self, err: NetworkError) {
        if let Ok(mut state) = self.state.lock() {
            if !state.stopped && state.failure.is_none() {
                state.failure = Some(err);
            }
        }
    }

    fn claim(&self, sequence: SequenceNo) -> Result<Option<Waiter>, NetworkError> {
        Ok(self.state.lock()?.waiters.remove(&sequence))
    }
}

/// A waiter taken out of the table by the receive loop.
///
/// Dropped without [`Claimed::release`], for instance while a payload reader unwinds, it
/// still wakes its caller, with an error.
struct Claimed(Option<Waiter>);

impl Claimed {
    fn waiter(&self) -> Result<&Waiter, NetworkError> {
        self.0
            .as_ref()
            .ok_or_else(|| NetworkError::Unrecoverable("waiter already released".into()))
    }

    fn release(mut self, outcome: Result<(), NetworkError>) {
        if let Some(waiter) = self.0.take() {
            release(waiter, outcome);
        }
    }
}

impl Drop for Claimed {
    fn drop(&mut self) {
        if let Some(waiter) = self.0.take() {
            release(
                waiter,
                Err(NetworkError::Unrecoverable(
                    "response handler panicked".into(),
                )),
            );
        }
    }
}

/// Stops the table when the receive loop exits, however it exits.
struct LoopGuard<'a>(&'a DispatchTable);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("response loop panicked");
            self.0
                .fail(NetworkError::Unrecoverable("response loop panicked".into()));
        }
        self.0.stop();
    }
}

fn release(waiter: Waiter, outcome: Result<(), NetworkError>) {
    let Waiter {
        request,
        data,
        slot,
    } = waiter;
    // the caller takes the request back out of its Arc once woken
    drop(request);
    drop(data);
    slot.fulfill(outcome);
}

/// Registers `request` and blocks until its response has been read.
///
/// The request must be registered before its response can arrive, so callers that send
/// and wait separately should register through [`DispatchTable::expect`] first.
/// [`ClientConnection::execute`] does both in the right order.
pub fn receive_response(
    request: SharedRequest,
    connection: &ClientConnection,
) -> Result<(), NetworkError> {
    connection
        .dispatch()
        .expect(request, connection.shared_callback_data())?
        .wait()
}

/// Reads responses from `connection` and hands them to registered waiters until the table
/// is stopped, the connection is closed, or an unrecoverable error occurs.
///
/// On return no waiter is left blocked.
pub fn receive_response_loop(connection: &Connection, table: &DispatchTable) {
    let _guard = LoopGuard(table);
    let result = connection
        .receiver()
        .and_then(|mut rx| dispatch_responses(&mut rx, table));

    match result {
        Ok(()) => debug!("response loop for {} finished", connection.info_string()),
        Err(err) if table.is_stopped() => {
            debug!("response loop for {} stopped: {err}", connection.info_string())
        }
        Err(err) => {
            error!("response loop for {} failed: {err}", connection.info_string());
            table.fail(err);
        }
    }
}

fn dispatch_responses(rx: &mut Receiver<'_>, table: &DispatchTable) -> Result<(), NetworkError> {
    while !table.is_stopped() && rx.is_established() {
        match receive_response_header(rx)? {
            ResponseStatus::Ok(sequence) => {
                // without a waiter the payload cannot be parsed; a following frame will
                // then fail its marker check
                let Some(waiter) = table.claim(sequence)? else {
                    warn!("received response for unknown request #{sequence}");
                    continue;
                };
                let claimed = Claimed(Some(waiter));

                let outcome = {
                    let waiter = claimed.waiter()?;
                    match waiter.request.lock() {
                        Ok(mut request) => receive_response_data(&mut *request, rx, &waiter.data),
                        Err(poisoned) => Err(poisoned.into()),
                    }
                };

                match outcome {
                    Ok(()) => {
                        trace!("response #{sequence} delivered");
                        claimed.release(Ok(()));
                    }
                    Err(err) => {
                        claimed.release(Err(err.replicate()));
                        return Err(err);
                    }
                }
            }
            ResponseStatus::Failed { sequence, message } => match table.claim(sequence)? {
                Some(waiter) => {
                    debug!("request #{sequence} failed: {message}");
                    release(waiter, Err(NetworkError::Recoverable(message)));
                }
                None => warn!("received error for unknown request #{sequence}: {message}"),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::protocol::{
        RequestId, RequestRegistry, ResponseCode, Sender, ServerCallbackData, ServerConnection,
        create_from_stream, request::next_sequence_number, requests::OpenReportRequest,
        response::write_error_response, send_response, transport::testing::loopback,
    };

    const ECHO: RequestId = 100;

    /// Answers with ten times its own sequence number.
    #[derive(Debug, Default)]
    struct EchoRequest {
        sequence: SequenceNo,
        answer: Option<u64>,
    }

    impl EchoRequest {
        fn new() -> Self {
            Self {
                sequence: next_sequence_number(),
                answer: None,
            }
        }
    }

    impl NetworkRequest for EchoRequest {
        fn id(&self) -> RequestId {
            ECHO
        }

        fn name(&self) -> &'static str {
            "Echo"
        }

        fn sequence_number(&self) -> SequenceNo {
            self.sequence
        }

        fn set_sequence_number(&mut self, sequence: SequenceNo) {
            self.sequence = sequence;
        }

        fn send_response_payload(
            &self,
            tx: &mut Sender<'_>,
            _data: &ServerCallbackData,
        ) -> Result<(), NetworkError> {
            tx.put(u64::from(self.sequence) * 10)
        }

        fn receive_response_payload(
            &mut self,
            rx: &mut Receiver<'_>,
            _data: &ClientCallbackData,
        ) -> Result<(), NetworkError> {
            self.answer = Some(rx.get()?);
            Ok(())
        }
    }

    fn echo_factory() -> Box<dyn NetworkRequest> {
        Box::new(EchoRequest::default())
    }

    fn pair() -> (ClientConnection, ServerConnection) {
        let (client, server) = loopback();
        let mut registry = RequestRegistry::new();
        registry.register(echo_factory).unwrap();

        let client = ClientConnection::start(Connection::from_tcp(client).unwrap()).unwrap();
        let server = ServerConnection::new(
            Connection::from_tcp(server).unwrap(),
            Arc::new(registry),
        );
        (client, server)
    }

    fn read_requests(server: &ServerConnection, count: usize) -> Vec<Box<dyn NetworkRequest>> {
        let data = ServerCallbackData::default();
        (0..count)
            .map(|_| create_from_stream(server, &data).unwrap())
            .collect()
    }

    fn spawn_echoes(
        client: &Arc<ClientConnection>,
        count: usize,
    ) -> mpsc::Receiver<(SequenceNo, Result<EchoRequest, NetworkError>)> {
        let (done_tx, done_rx) = mpsc::channel();
        for _ in 0..count {
            let client = Arc::clone(client);
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                let request = EchoRequest::new();
                let sequence = request.sequence;
                let _ = done_tx.send((sequence, client.execute(request)));
            });
        }
        done_rx
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn scrambled_responses_reach_their_callers() {
        let (client, server) = pair();
        let client = Arc::new(client);
        let done = spawn_echoes(&client, 8);

        let mut requests = read_requests(&server, 8);
        requests.reverse();
        requests.swap(1, 5);
        for request in &requests {
            send_response(request.as_ref(), &server, &ServerCallbackData::default()).unwrap();
        }

        for _ in 0..8 {
            let (sequence, result) = done.recv_timeout(Duration::from_secs(5)).unwrap();
            let request = result.unwrap();
            assert_eq!(request.sequence, sequence);
            assert_eq!(request.answer, Some(u64::from(sequence) * 10));
        }
        assert_eq!(client.dispatch().pending(), 0);
    }

    #[test]
    fn stop_releases_every_waiter() {
        let (client, server) = pair();
        let client = Arc::new(client);
        let done = spawn_echoes(&client, 5);

        read_requests(&server, 5);
        wait_until("all waiters", || client.dispatch().pending() == 5);
        client.stop_loop();

        for _ in 0..5 {
            let (_, result) = done.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(matches!(result, Err(NetworkError::LoopStopped)));
        }
        assert!(matches!(
            client.execute(EchoRequest::new()),
            Err(NetworkError::LoopStopped)
        ));
    }

    #[test]
    fn unrecoverable_response_fails_every_waiter() {
        let (client, server) = pair();
        let client = Arc::new(client);
        let done = spawn_echoes(&client, 3);

        let requests = read_requests(&server, 3);
        write_error_response(
            &server,
            requests[0].sequence_number(),
            ResponseCode::UnrecoverableError,
            "report vanished",
        )
        .unwrap();

        for _ in 0..3 {
            let (_, result) = done.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(matches!(
                result,
                Err(NetworkError::Unrecoverable(ref msg)) if msg == "report vanished"
            ));
        }

        // later requests fail before anything is sent
        assert!(matches!(
            client.execute(EchoRequest::new()),
            Err(NetworkError::Unrecoverable(ref msg)) if msg == "report vanished"
        ));
    }

    #[test]
    fn recoverable_error_fails_only_its_request() {
        let (client, server) = pair();
        let client = Arc::new(client);
        let done = spawn_echoes(&client, 2);

        let requests = read_requests(&server, 2);
        let failed = requests[0].sequence_number();
        send_error_response_for(&server, failed, "no such metric");
        send_response(requests[1].as_ref(), &server, &ServerCallbackData::default()).unwrap();

        for _ in 0..2 {
            let (sequence, result) = done.recv_timeout(Duration::from_secs(5)).unwrap();
            if sequence == failed {
                assert!(matches!(
                    result,
                    Err(NetworkError::Recoverable(ref msg)) if msg == "no such metric"
                ));
            } else {
                assert_eq!(result.unwrap().answer, Some(u64::from(sequence) * 10));
            }
        }

        // connection is still usable
        let responder = thread::spawn(move || {
            let requests = read_requests(&server, 1);
            send_response(requests[0].as_ref(), &server, &ServerCallbackData::default())
                .unwrap();
        });
        let request = client.execute(EchoRequest::new()).unwrap();
        assert_eq!(request.answer, Some(u64::from(request.sequence) * 10));
        responder.join().unwrap();
    }

    fn send_error_response_for(server: &ServerConnection, sequence: SequenceNo, message: &str) {
        write_error_response(server, sequence, ResponseCode::RecoverableError, message).unwrap();
    }

    #[test]
    fn corrupted_response_header_kills_the_connection() {
        let (client, server) = pair();
        let client = Arc::new(client);
        let done = spawn_echoes(&client, 1);

        let requests = read_requests(&server, 1);
        let mut tx = server.connection().sender().unwrap();
        tx.put(crate::protocol::REQUEST_HEADER_START).unwrap();
        tx.put(u32::from(ResponseCode::Ok)).unwrap();
        tx.put(requests[0].sequence_number()).unwrap();
        tx.put(0xdead_beefu32).unwrap();
        tx.finish().unwrap();

        let (_, result) = done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            result,
            Err(NetworkError::Unrecoverable(ref msg)) if msg.contains("malformed")
        ));
        assert!(client.dispatch().check().is_err());
    }

    #[test]
    fn claimed_response_wins_over_stop() {
        let (client, server) = pair();
        let client = Arc::new(client);
        let done = spawn_echoes(&client, 1);

        let requests = read_requests(&server, 1);
        let sequence = requests[0].sequence_number();

        // header first, payload only after the loop has been stopped
        let mut tx = server.connection().sender().unwrap();
        tx.put(crate::protocol::REQUEST_HEADER_START).unwrap();
        tx.put(u32::from(ResponseCode::Ok)).unwrap();
        tx.put(sequence).unwrap();
        tx.put(crate::protocol::REQUEST_HEADER_END).unwrap();
        tx.finish().unwrap();

        wait_until("loop to claim the waiter", || client.dispatch().pending() == 0);
        client.stop_loop();

        let mut tx = server.connection().sender().unwrap();
        tx.put(u64::from(sequence) * 10).unwrap();
        tx.put(crate::protocol::REQUEST_PAYLOAD_END).unwrap();
        tx.finish().unwrap();

        let (_, result) = done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap().answer, Some(u64::from(sequence) * 10));
    }

    #[test]
    fn error_for_unknown_request_is_skipped() {
        let (client, server) = pair();
        send_error_response_for(&server, SequenceNo::MAX - 7, "nobody asked");

        let responder = thread::spawn(move || {
            let requests = read_requests(&server, 1);
            send_response(requests[0].as_ref(), &server, &ServerCallbackData::default())
                .unwrap();
            server
        });
        let request = client.execute(EchoRequest::new()).unwrap();
        assert_eq!(request.answer, Some(u64::from(request.sequence) * 10));

        let _server = responder.join().unwrap();
        assert!(client.dispatch().check().is_ok());
    }

    #[test]
    fn response_for_unknown_request_kills_the_connection() {
        let (client, server) = pair();
        let client = Arc::new(client);
        let done = spawn_echoes(&client, 1);
        read_requests(&server, 1);

        let mut stray = EchoRequest::default();
        stray.set_sequence_number(SequenceNo::MAX - 3);
        send_response(&stray, &server, &ServerCallbackData::default()).unwrap();

        // the stray payload is read as the next header
        let (_, result) = done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            result,
            Err(NetworkError::Unrecoverable(ref msg)) if msg.contains("malformed")
        ));
        assert!(client.dispatch().check().is_err());
    }

    /// Same opcode as [`EchoRequest`], but its client side cannot handle the answer.
    #[derive(Debug, Default)]
    struct PanickingRequest {
        sequence: SequenceNo,
    }

    impl NetworkRequest for PanickingRequest {
        fn id(&self) -> RequestId {
            ECHO
        }

        fn name(&self) -> &'static str {
            "Panicking"
        }

        fn sequence_number(&self) -> SequenceNo {
            self.sequence
        }

        fn set_sequence_number(&mut self, sequence: SequenceNo) {
            self.sequence = sequence;
        }

        fn receive_response_payload(
            &mut self,
            _rx: &mut Receiver<'_>,
            _data: &ClientCallbackData,
        ) -> Result<(), NetworkError> {
            panic!("cannot handle response #{}", self.sequence);
        }
    }

    #[test]
    fn panicking_payload_reader_releases_its_caller() {
        let (client, server) = pair();
        let client = Arc::new(client);

        let (done_tx, done_rx) = mpsc::channel();
        {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let request = PanickingRequest {
                    sequence: next_sequence_number(),
                };
                let _ = done_tx.send(client.execute(request).map(|_| ()));
            });
        }

        let requests = read_requests(&server, 1);
        send_response(requests[0].as_ref(), &server, &ServerCallbackData::default()).unwrap();

        let result = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            result,
            Err(NetworkError::Unrecoverable(ref msg)) if msg.contains("panicked")
        ));

        // the loop is gone, so later calls fail fast
        wait_until("loop to stop", || client.dispatch().is_stopped());
        assert!(matches!(
            client.execute(EchoRequest::new()),
            Err(NetworkError::Unrecoverable(ref msg)) if msg.contains("panicked")
        ));
    }

    #[test]
    fn oversized_response_payload_fails_the_caller() {
        let (client, server) = pair();
        let client = Arc::new(client);

        let request = OpenReportRequest::new("big.cubex");
        let sequence = request.sequence_number();
        let (done_tx, done_rx) = mpsc::channel();
        {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let _ = done_tx.send(client.execute(request).map(|_| ()));
            });
        }
        wait_until("the waiter", || client.dispatch().pending() == 1);

        let mut tx = server.connection().sender().unwrap();
        tx.put(crate::protocol::REQUEST_HEADER_START).unwrap();
        tx.put(u32::from(ResponseCode::Ok)).unwrap();
        tx.put(sequence).unwrap();
        tx.put(crate::protocol::REQUEST_HEADER_END).unwrap();
        tx.put(u64::MAX).unwrap();
        tx.finish().unwrap();

        let result = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(NetworkError::Unrecoverable(_))));
        assert!(client.dispatch().check().is_err());
    }

    #[test]
    fn peer_hangup_releases_waiters() {
        let (client, server) = pair();
        let client = Arc::new(client);
        let done = spawn_echoes(&client, 2);

        read_requests(&server, 2);
        server.connection().disconnect();

        for _ in 0..2 {
            let (_, result) = done.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(result.is_err());
        }
    }
}
