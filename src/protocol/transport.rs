use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_std_read, encode_into_std_write,
};
use log::{debug, trace};

use super::NetworkError;

/// Upper bound on the bytes a single decoded value may claim.
///
/// Length prefixes come from the peer; anything above this fails to decode instead of
/// being allocated.
pub const MAX_VALUE_BYTES: usize = 64 * 1024 * 1024;

pub(crate) type WireConfig = Configuration<BigEndian, Fixint, Limit<MAX_VALUE_BYTES>>;

type ReadHalf = BufReader<Box<dyn Read + Send>>;
type WriteHalf = Box<dyn Write + Send>;

/// Byte order and integer width shared by client and server.
pub(crate) fn wire_config() -> WireConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_VALUE_BYTES>()
}

/// A duplex channel with independently locked send and receive halves.
///
/// Holding a [`Sender`] locks the send half for one whole frame, holding a
/// [`Receiver`] locks the receive half. A request being written never waits on
/// a response being read, but two writers (or two readers) serialize.
pub struct Connection {
    reader: Mutex<ReadHalf>,
    writer: Mutex<WriteHalf>,
    socket: Option<TcpStream>,
    established: AtomicBool,
    info: String,
    config: WireConfig,
}

impl Connection {
    pub fn from_tcp(stream: TcpStream) -> Result<Self, NetworkError> {
        stream.set_nodelay(true)?;
        let info = match stream.peer_addr() {
            Ok(addr) => format!("tcp://{addr}"),
            Err(_) => "tcp://<unknown>".to_string(),
        };
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;

        Ok(Self::build(
            Box::new(reader),
            Box::new(writer),
            Some(stream),
            info,
        ))
    }

    /// Builds a connection over arbitrary byte streams (pipes, in-memory buffers).
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::build(Box::new(reader), Box::new(writer), None, "stream".into())
    }

    fn build(
        reader: Box<dyn Read + Send>,
        writer: WriteHalf,
        socket: Option<TcpStream>,
        info: String,
    ) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            socket,
            established: AtomicBool::new(true),
            info,
            config: wire_config(),
        }
    }

    /// Locks the send half until the returned frame is finished or dropped.
    pub fn sender(&self) -> Result<Sender<'_>, NetworkError> {
        let stream = self.writer.lock()?;
        Ok(Sender {
            stream,
            frame: Vec::new(),
            connection: self,
        })
    }

    /// Locks the receive half until the returned guard is dropped.
    pub fn receiver(&self) -> Result<Receiver<'_>, NetworkError> {
        let stream = self.reader.lock()?;
        Ok(Receiver {
            stream,
            connection: self,
        })
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    /// Marks the connection closed and shuts the socket down, waking any blocked reader.
    ///
    /// Does not take either lock, so it may be called while a frame is in flight.
    pub fn disconnect(&self) {
        if self.established.swap(false, Ordering::SeqCst) {
            debug!("disconnecting {}", self.info);
            if let Some(socket) = &self.socket {
                // already closed by the peer is fine
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
    }

    pub fn info_string(&self) -> &str {
        &self.info
    }
}

/// Exclusive access to the send half for one frame.
///
/// Fields are encoded into a frame buffer and written in a single piece by
/// [`Sender::finish`]. Dropping an unfinished sender discards the frame, so an
/// error half-way through never leaves partial bytes on the wire.
pub struct Sender<'a> {
    stream: MutexGuard<'a, WriteHalf>,
    frame: Vec<u8>,
    connection: &'a Connection,
}

impl Sender<'_> {
    pub fn put<T: Encode>(&mut self, value: T) -> Result<(), NetworkError> {
        encode_into_std_write(value, &mut self.frame, self.connection.config)?;
        Ok(())
    }

    /// Sends a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) -> Result<(), NetworkError> {
        self.put(value)
    }

    pub fn is_established(&self) -> bool {
        self.connection.is_established()
    }

    /// Flushes what has been framed so far, then closes the connection.
    pub fn disconnect(&mut self) -> Result<(), NetworkError> {
        self.flush_frame()?;
        self.connection.disconnect();
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), NetworkError> {
        self.flush_frame()
    }

    fn flush_frame(&mut self) -> Result<(), NetworkError> {
        if self.frame.is_empty() {
            return Ok(());
        }

        trace!("writing {} byte frame to {}", self.frame.len(), self.connection.info);
        self.stream.write_all(&self.frame)?;
        self.stream.flush()?;
        self.frame.clear();
        Ok(())
    }
}

/// Exclusive access to the receive half.
pub struct Receiver<'a> {
    stream: MutexGuard<'a, ReadHalf>,
    connection: &'a Connection,
}

impl Receiver<'_> {
    pub fn get<T: Decode<()>>(&mut self) -> Result<T, NetworkError> {
        let value = decode_from_std_read(&mut *self.stream, self.connection.config)?;
        Ok(value)
    }

    pub fn get_string(&mut self) -> Result<String, NetworkError> {
        self.get()
    }

    /// Waits for the next byte and reports whether the peer closed the stream instead.
    ///
    /// Consumes nothing.
    pub fn is_at_eof(&mut self) -> Result<bool, NetworkError> {
        Ok(self.stream.fill_buf()?.is_empty())
    }

    pub fn is_established(&self) -> bool {
        self.connection.is_established()
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{SharedBuffer, loopback};
    use super::*;

    #[test]
    fn scalars_are_big_endian_fixed_width() {
        let buffer = SharedBuffer::default();
        let connection = Connection::from_parts(buffer.clone(), buffer.clone());

        let mut tx = connection.sender().unwrap();
        tx.put(0x0102_0304u32).unwrap();
        tx.put(7u8).unwrap();
        tx.finish().unwrap();

        assert_eq!(buffer.contents(), vec![1, 2, 3, 4, 7]);
    }

    #[test]
    fn strings_are_length_prefixed() {
        let buffer = SharedBuffer::default();
        let connection = Connection::from_parts(buffer.clone(), buffer.clone());

        let mut tx = connection.sender().unwrap();
        tx.put_str("cube").unwrap();
        tx.finish().unwrap();

        let mut expected = 4u64.to_be_bytes().to_vec();
        expected.extend_from_slice(b"cube");
        assert_eq!(buffer.contents(), expected);

        let mut rx = connection.receiver().unwrap();
        assert_eq!(rx.get_string().unwrap(), "cube");
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn abandoned_frame_is_discarded() {
        let buffer = SharedBuffer::default();
        let connection = Connection::from_parts(buffer.clone(), buffer.clone());

        {
            let mut tx = connection.sender().unwrap();
            tx.put(1u64).unwrap();
        }
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn short_read_is_an_error() {
        let buffer = SharedBuffer::default();
        buffer.replace(&[0, 1]);
        let connection = Connection::from_parts(buffer.clone(), buffer);

        let mut rx = connection.receiver().unwrap();
        assert!(matches!(
            rx.get::<u32>(),
            Err(NetworkError::Deserialize(_))
        ));
    }

    #[test]
    fn oversized_length_prefix_is_refused() {
        let buffer = SharedBuffer::default();
        buffer.replace(&u64::MAX.to_be_bytes());
        let connection = Connection::from_parts(buffer.clone(), buffer);

        let mut rx = connection.receiver().unwrap();
        assert!(matches!(
            rx.get_string(),
            Err(NetworkError::Deserialize(
                bincode::error::DecodeError::LimitExceeded
            ))
        ));
    }

    #[test]
    fn end_of_stream_is_seen_without_consuming() {
        let buffer = SharedBuffer::default();
        buffer.replace(&[0, 0, 0, 9]);
        let connection = Connection::from_parts(buffer.clone(), buffer);

        let mut rx = connection.receiver().unwrap();
        assert!(!rx.is_at_eof().unwrap());
        assert_eq!(rx.get::<u32>().unwrap(), 9);
        assert!(rx.is_at_eof().unwrap());
    }

    #[test]
    fn disconnect_unblocks_reader() {
        let (client, _server) = loopback();
        let connection = std::sync::Arc::new(Connection::from_tcp(client).unwrap());
        assert!(connection.is_established());

        let reader = std::sync::Arc::clone(&connection);
        let handle = std::thread::spawn(move || {
            let mut rx = reader.receiver().unwrap();
            rx.get::<u32>()
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        connection.disconnect();
        assert!(!connection.is_established());
        assert!(handle.join().unwrap().is_err());
    }
}
