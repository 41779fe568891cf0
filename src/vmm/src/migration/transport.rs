// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! TCP transport for live migration (spec.md §4.H, §4.G). The original
//! system's migration fabric is pluggable (TCP sockets or an
//! RDMA/ibverbs path); only the TCP backend is carried here, as no
//! ibverbs crate appears anywhere else in this dependency stack.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to migration target {0}: {1}")]
    Connect(String, std::io::Error),
    #[error("failed to bind migration listener on port {0}: {1}")]
    Bind(u16, std::io::Error),
    #[error("failed to accept a migration connection: {0}")]
    Accept(std::io::Error),
    #[error("short transfer over migration socket: {0}")]
    ShortTransfer(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A connected migration channel. Every send/receive either moves the
/// full buffer or fails outright; there is no partial-transfer state
/// for a caller to recover from.
pub struct Channel {
    stream: TcpStream,
}

impl Channel {
    /// Connects to a migration responder listening at `ip:port`
    /// (spec.md §4.H "initiator... connects").
    pub fn connect(ip: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((ip, port))
            .map_err(|e| Error::Connect(format!("{}:{}", ip, port), e))?;
        Ok(Channel { stream })
    }

    /// Listens on `port` and accepts a single migration connection
    /// (spec.md §4.H "responder... listens").
    pub fn accept(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| Error::Bind(port, e))?;
        let (stream, _) = listener.accept().map_err(Error::Accept)?;
        Ok(Channel { stream })
    }

    pub fn send_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).map_err(Error::ShortTransfer)
    }

    pub fn recv_all(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(Error::ShortTransfer)
    }

    pub fn send_u64(&mut self, value: u64) -> Result<()> {
        self.send_all(&value.to_le_bytes())
    }

    pub fn recv_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.recv_all(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Sends a length-prefixed blob (used for the bincode-serialized
    /// vCPU states and manifest bytes exchanged during a round).
    pub fn send_blob(&mut self, blob: &[u8]) -> Result<()> {
        self.send_u64(blob.len() as u64)?;
        self.send_all(blob)
    }

    pub fn recv_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.recv_u64()? as usize;
        let mut buf = vec![0u8; len];
        self.recv_all(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn blob_round_trips_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut channel = Channel { stream };
            let blob = channel.recv_blob().unwrap();
            channel.send_blob(&blob).unwrap();
        });

        let mut client = Channel::connect("127.0.0.1", port).unwrap();
        client.send_blob(b"checkpoint-payload").unwrap();
        let echoed = client.recv_blob().unwrap();
        assert_eq!(echoed, b"checkpoint-payload");

        server.join().unwrap();
    }
}
