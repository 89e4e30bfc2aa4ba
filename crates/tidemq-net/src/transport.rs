//! Plain and TLS byte transports behind one interface.

use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::net::TcpStream;

use crate::tls::{HandshakeStatus, TlsStream};

/// Transport layer abstraction for plain TCP and TLS connections.
pub enum Transport {
    /// Plain TCP connection.
    Plain(TcpStream),
    /// TLS-encrypted connection.
    Tls(Box<TlsStream>),
}

impl Transport {
    pub fn plain(stream: TcpStream) -> Self {
        Transport::Plain(stream)
    }

    pub fn tls(stream: TlsStream) -> Self {
        Transport::Tls(Box::new(stream))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Get the underlying TCP stream (for mio registration).
    pub fn tcp_stream(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => s.get_ref(),
        }
    }

    pub fn tcp_stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => s.get_mut(),
        }
    }

    /// Step the TLS handshake; plain transports have none.
    pub fn handshake(&mut self) -> io::Result<HandshakeStatus> {
        match self {
            Transport::Plain(_) => Ok(HandshakeStatus::Complete),
            Transport::Tls(s) => s.handshake(),
        }
    }

    /// Bytes accepted by the transport but not yet on the wire.
    pub fn wants_write(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(s) => s.wants_write(),
        }
    }

    /// Close the connection in both directions.
    pub fn shutdown(&mut self) {
        if let Transport::Tls(s) = self {
            s.close();
        }
        let _ = self.tcp_stream().shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.recv(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.send(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush_records(),
        }
    }
}
