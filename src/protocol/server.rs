use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, error, info, warn};

use crate::report::{Report, ReportError};

use super::{
    Connection, NetworkError, NetworkRequest, RequestId, ResponseCode, SequenceNo, ThreadPool,
    create_from_stream, requests, response::write_error_response, send_error_response,
    send_response,
};

/// Builds an empty server-side request, ready to receive its payload.
pub type RequestFactory = fn() -> Box<dyn NetworkRequest>;

/// Mapping from request id to request type.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    factories: HashMap<RequestId, RequestFactory>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every request type of the Cube protocol.
    pub fn protocol() -> Result<Self, NetworkError> {
        let mut registry = Self::new();
        requests::register_all(&mut registry)?;
        Ok(registry)
    }

    /// Registers a request type under the id its instances report.
    pub fn register(&mut self, factory: RequestFactory) -> Result<RequestId, NetworkError> {
        let sample = factory();
        if !sample.is_registered() {
            return Err(NetworkError::Unrecoverable(format!(
                "{} request has no request id",
                sample.name()
            )));
        }

        let id = sample.id();
        if self.factories.contains_key(&id) {
            return Err(NetworkError::Unrecoverable(format!(
                "request id {id} registered twice ({})",
                sample.name()
            )));
        }

        self.factories.insert(id, factory);
        Ok(id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.factories.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn create(
        &self,
        id: RequestId,
        sequence: SequenceNo,
    ) -> Result<Box<dyn NetworkRequest>, NetworkError> {
        let factory = self
            .factories
            .get(&id)
            .ok_or(NetworkError::UnknownRequest(id))?;
        let mut request = factory();
        request.set_sequence_number(sequence);
        Ok(request)
    }
}

/// Server-side context of one connection: where reports live and which one is open.
#[derive(Debug)]
pub struct ServerCallbackData {
    root: PathBuf,
    report: Option<Report>,
}

impl Default for ServerCallbackData {
    fn default() -> Self {
        Self::new(PathBuf::from("."))
    }
}

impl ServerCallbackData {
    pub fn new(root: PathBuf) -> Self {
        Self { root, report: None }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The open report; requests on a connection without one fail recoverably.
    pub fn report(&self) -> Result<&Report, NetworkError> {
        self.report
            .as_ref()
            .ok_or_else(|| NetworkError::Recoverable("no report is open".into()))
    }

    /// Opens the report at `path`, relative to the report root, replacing any open one.
    pub fn open_report(&mut self, path: &str) -> Result<&Report, ReportError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ReportError::OutsideRoot(relative.to_path_buf()));
        }

        let report = Report::open(&self.root.join(relative))?;
        info!("opened report '{}' from {path}", report.name());
        Ok(self.report.insert(report))
    }

    /// Replaces the open report, for reports built in memory.
    pub fn set_report(&mut self, report: Report) {
        self.report = Some(report);
    }

    pub fn close_report(&mut self) -> Option<Report> {
        self.report.take()
    }
}

/// Server end of a connection; builds request objects for incoming frames.
pub struct ServerConnection {
    connection: Connection,
    registry: Arc<RequestRegistry>,
}

impl ServerConnection {
    pub fn new(connection: Connection, registry: Arc<RequestRegistry>) -> Self {
        Self {
            connection,
            registry,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn create_request(
        &self,
        id: RequestId,
        sequence: SequenceNo,
    ) -> Result<Box<dyn NetworkRequest>, NetworkError> {
        self.registry.create(id, sequence)
    }

    /// Serves requests one at a time until the client hangs up or the connection fails.
    pub fn serve(&self, data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        while self.connection.is_established() {
            // end of stream is only a clean hangup between frames
            match self.connection.receiver().and_then(|mut rx| rx.is_at_eof()) {
                Ok(false) => {}
                Ok(true) => {
                    info!("client {} disconnected", self.connection.info_string());
                    return Ok(());
                }
                Err(err) if is_hangup(&err) => {
                    info!("client {} hung up: {err}", self.connection.info_string());
                    return Ok(());
                }
                Err(err) => {
                    error!("cannot read from {}: {err}", self.connection.info_string());
                    self.connection.disconnect();
                    return Err(err);
                }
            }

            let mut request = match create_from_stream(self, data) {
                Ok(request) => request,
                Err(err) => {
                    error!("unreadable request from {}: {err}", self.connection.info_string());
                    let _ = write_error_response(
                        self,
                        0,
                        ResponseCode::UnrecoverableError,
                        &err.to_string(),
                    );
                    self.connection.disconnect();
                    return Err(err);
                }
            };
            info!(
                "received {} request #{}",
                request.name(),
                request.sequence_number()
            );

            match request.process_request(data) {
                Ok(()) => send_response(request.as_ref(), self, data)?,
                Err(NetworkError::Recoverable(message)) => {
                    warn!("{} request failed: {message}", request.name());
                    send_error_response(
                        request.as_ref(),
                        self,
                        ResponseCode::RecoverableError,
                        &message,
                    )?;
                }
                Err(err) => {
                    error!("{} request failed fatally: {err}", request.name());
                    let _ = send_error_response(
                        request.as_ref(),
                        self,
                        ResponseCode::UnrecoverableError,
                        &err.to_string(),
                    );
                    self.connection.disconnect();
                    return Err(err);
                }
            }
        }

        debug!("connection {} closed", self.connection.info_string());
        Ok(())
    }
}

/// A peer that went away while no frame was in flight.
fn is_hangup(err: &NetworkError) -> bool {
    match err {
        NetworkError::Io(err) => matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
        ),
        _ => false,
    }
}

/// Accepts clients and serves each connection on a worker thread.
pub struct CubeServer {
    listener: TcpListener,
    address: SocketAddr,
    root: PathBuf,
    registry: Arc<RequestRegistry>,
    pool: ThreadPool,
    running: Arc<AtomicBool>,
}

/// Stops a running [`CubeServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    address: SocketAddr,
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Stops accepting connections. Connections already being served run to completion.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            // wake the accept loop
            let _ = TcpStream::connect(self.address);
        }
    }
}

impl CubeServer {
    pub fn bind(address: SocketAddr, root: PathBuf, workers: usize) -> Result<Self, NetworkError> {
        if !root.is_dir() {
            return Err(NetworkError::Unrecoverable(format!(
                "'{}' is not a directory",
                root.display()
            )));
        }

        let listener = TcpListener::bind(address)?;
        let address = listener.local_addr()?;

        Ok(Self {
            listener,
            address,
            root,
            registry: Arc::new(RequestRegistry::protocol()?),
            pool: ThreadPool::new(workers),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            address: self.address,
            running: Arc::clone(&self.running),
        }
    }

    /// Runs the accept loop until a [`ShutdownHandle`] stops it, then waits for open
    /// connections to finish.
    pub fn listen(self) -> Result<(), NetworkError> {
        info!(
            "listening at {} with {} workers, serving {}",
            self.address,
            self.pool.size(),
            self.root.display()
        );

        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            match stream {
                Ok(stream) => {
                    let registry = Arc::clone(&self.registry);
                    let root = self.root.clone();
                    self.pool.execute(move || {
                        if let Err(err) = handle_connection(stream, registry, root) {
                            warn!("connection ended with error: {err}");
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("server at {} stopped accepting connections", self.address);
        Ok(())
    }
}

fn handle_connection(
    stream: TcpStream,
    registry: Arc<RequestRegistry>,
    root: PathBuf,
) -> Result<(), NetworkError> {
    let connection = ServerConnection::new(Connection::from_tcp(stream)?, registry);
    info!("client connected: {}", connection.connection().info_string());

    let mut data = ServerCallbackData::new(root);
    connection.serve(&mut data)
}
