use std::{
    net::{TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use log::{info, warn};

use crate::report::ReportSummary;

use super::{
    Connection, DispatchTable, NetworkError, NetworkRequest, receive_response_loop,
    request::send_request, requests::DisconnectRequest,
};

/// Client-side context handed to every request of one connection.
///
/// Holds what the client knows about the report opened on the server.
#[derive(Debug, Default)]
pub struct ClientCallbackData {
    report: Mutex<Option<ReportSummary>>,
}

impl ClientCallbackData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Summary of the report currently open on the server, if any.
    pub fn report(&self) -> Option<ReportSummary> {
        self.report.lock().ok().and_then(|report| report.clone())
    }

    pub(crate) fn set_report(&self, summary: Option<ReportSummary>) -> Result<(), NetworkError> {
        *self.report.lock()? = summary;
        Ok(())
    }
}

/// Client end of a connection, with its background response loop.
///
/// Any number of threads may call [`ClientConnection::execute`] concurrently; requests are
/// written in the order their threads acquire the send half and each caller is woken with
/// its own response, whatever order the server answers in.
pub struct ClientConnection {
    connection: Arc<Connection>,
    dispatch: Arc<DispatchTable>,
    data: Arc<ClientCallbackData>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConnection {
    pub fn connect<A: ToSocketAddrs>(address: A) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect(address)?;
        let connection = Connection::from_tcp(stream)?;
        info!("connected to {}", connection.info_string());
        Self::start(connection)
    }

    /// Takes ownership of an established connection and starts its receive loop.
    pub fn start(connection: Connection) -> Result<Self, NetworkError> {
        let connection = Arc::new(connection);
        let dispatch = Arc::new(DispatchTable::new());

        let handle = {
            let connection = Arc::clone(&connection);
            let dispatch = Arc::clone(&dispatch);
            thread::Builder::new()
                .name("cube-response-loop".into())
                .spawn(move || receive_response_loop(&connection, &dispatch))?
        };

        Ok(Self {
            connection,
            dispatch,
            data: Arc::new(ClientCallbackData::new()),
            receiver: Mutex::new(Some(handle)),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn callback_data(&self) -> &ClientCallbackData {
        &self.data
    }

    pub(crate) fn shared_callback_data(&self) -> Arc<ClientCallbackData> {
        Arc::clone(&self.data)
    }

    /// Sends `request` and blocks until its response has been read into it.
    pub fn execute<R>(&self, request: R) -> Result<R, NetworkError>
    where
        R: NetworkRequest + 'static,
    {
        let request = Arc::new(Mutex::new(request));
        let shared: Arc<Mutex<dyn NetworkRequest>> = request.clone();
        let pending = self.dispatch.expect(shared, self.shared_callback_data())?;

        let sent = match request.lock() {
            Ok(guard) => send_request(&*guard, self),
            Err(poisoned) => Err(poisoned.into()),
        };
        if let Err(err) = sent {
            self.dispatch.withdraw(pending.sequence_number());
            return Err(err);
        }

        pending.wait()?;

        let request = Arc::try_unwrap(request).map_err(|_| {
            NetworkError::Unrecoverable("response delivered while still in use".into())
        })?;
        Ok(request.into_inner()?)
    }

    /// Stops dispatching responses and releases every waiting caller.
    ///
    /// The socket stays open; see [`ClientConnection::close`].
    pub fn stop_loop(&self) {
        self.dispatch.stop();
    }

    /// Asks the server to end the session, then closes the connection.
    pub fn shutdown(&self) -> Result<(), NetworkError> {
        let result = self.execute(DisconnectRequest::new()).map(|_| ());
        self.close();
        result
    }

    /// Stops the receive loop, closes the socket and waits for the loop thread to exit.
    pub fn close(&self) {
        self.dispatch.stop();
        self.connection.disconnect();

        let handle = match self.receiver.lock() {
            Ok(mut receiver) => receiver.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("response loop thread panicked");
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.close();
    }
}
