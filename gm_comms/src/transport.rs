// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The transport contract and its two stock implementations.
//!
//! A transport is any ordered, reliable, message-framed, bidirectional byte
//! channel with close semantics. The mesh assumes framing but not
//! confidentiality; control messages carry their own signatures. The
//! in-process [`MemoryTransport`] exists so tests can assemble whole meshes
//! without sockets.

use super::error::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::net::SocketAddr;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{timeout, Duration},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// How long a transport connect may take before we give up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The writing half of a transport.
#[async_trait]
pub trait TransportTx: Send {
    /// Write one frame.
    async fn send(&mut self, frame: Bytes) -> Result<()>;
    /// Flush and close the channel. Idempotent.
    async fn close(&mut self);
}

/// The reading half of a transport.
#[async_trait]
pub trait TransportRx: Send {
    /// Read the next frame; `None` once the channel is closed.
    async fn recv(&mut self) -> Option<Bytes>;
}

/// A connected, framed, bidirectional byte channel.
pub trait Transport: Send {
    /// Split into independently owned halves, one per I/O task.
    fn split(self: Box<Self>) -> (Box<dyn TransportTx>, Box<dyn TransportRx>);
}

// -- TCP --

/// TCP under a length-delimited codec.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wrap an already-connected stream (e.g. from [`TcpAcceptor`]).
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Connect to `addr`, observing [`CONNECT_TIMEOUT`].
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout(addr.to_string()))??;
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportTx>, Box<dyn TransportRx>) {
        let framed = Framed::new(self.stream, LengthDelimitedCodec::new());
        let (sink, stream) = framed.split();
        (Box::new(TcpTx { sink }), Box::new(TcpRx { stream }))
    }
}

struct TcpTx {
    sink: SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
}

#[async_trait]
impl TransportTx for TcpTx {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sink.send(frame).await.map_err(Error::Io)
    }

    async fn close(&mut self) {
        if let Err(err) = self.sink.close().await {
            trace!("Error closing tcp transport: {err}");
        }
    }
}

struct TcpRx {
    stream: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
}

#[async_trait]
impl TransportRx for TcpRx {
    async fn recv(&mut self) -> Option<Bytes> {
        match self.stream.next().await? {
            Ok(frame) => Some(frame.freeze()),
            Err(err) => {
                trace!("Error reading tcp frame: {err}");
                None
            }
        }
    }
}

/// Accepts inbound TCP transports.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to `addr`.
    pub async fn bind(addr: &str) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> Result<(TcpTransport, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((TcpTransport::new(stream), addr))
    }
}

// -- in-memory --

/// An in-process transport built from two bounded channels.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl MemoryTransport {
    /// Two connected ends; frames written to one come out of the other.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

impl Transport for MemoryTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportTx>, Box<dyn TransportRx>) {
        (
            Box::new(MemoryTx { tx: Some(self.tx) }),
            Box::new(MemoryRx { rx: self.rx }),
        )
    }
}

struct MemoryTx {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl TransportTx for MemoryTx {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::ConnectionClosed("memory transport".to_string()))?;
        tx.send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed("memory transport".to_string()))
    }

    async fn close(&mut self) {
        // dropping our sender lets the remote's recv() see end-of-stream
        let _tx = self.tx.take();
    }
}

struct MemoryRx {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl TransportRx for MemoryRx {
    async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[tokio::test]
    async fn memory_pair_delivers_frames_in_order() -> Result<()> {
        let (a, b) = MemoryTransport::pair(8);
        let (mut a_tx, _a_rx) = Box::new(a).split();
        let (_b_tx, mut b_rx) = Box::new(b).split();

        a_tx.send(Bytes::from_static(b"one")).await?;
        a_tx.send(Bytes::from_static(b"two")).await?;

        assert_eq!(b_rx.recv().await, Some(Bytes::from_static(b"one")));
        assert_eq!(b_rx.recv().await, Some(Bytes::from_static(b"two")));

        a_tx.close().await;
        assert_eq!(b_rx.recv().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn tcp_roundtrip_via_acceptor() -> Result<()> {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await?;
        let addr = acceptor.local_addr()?;

        let client = tokio::spawn(async move {
            let transport = TcpTransport::connect(&addr.to_string()).await?;
            let (mut tx, _rx) = Box::new(transport).split();
            tx.send(Bytes::from_static(b"over tcp")).await?;
            tx.close().await;
            Ok::<_, eyre::Report>(())
        });

        let (transport, _peer_addr) = acceptor.accept().await?;
        let (_tx, mut rx) = Box::new(transport).split();
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"over tcp")));

        client.await??;
        Ok(())
    }
}
