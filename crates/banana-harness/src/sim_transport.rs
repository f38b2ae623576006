//! Turmoil-based Transport implementation using TCP streams.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use banana_core::transport::Transport;
use tokio::io::{ReadHalf, WriteHalf};
use turmoil::net::{TcpListener, TcpStream};

/// Simulation transport over turmoil's deterministic TCP.
///
/// Turmoil controls packet ordering and timing and can inject partitions
/// and delays, so connection-level protocol behavior is reproducible.
pub struct SimTransport {
    listener: TcpListener,
}

impl SimTransport {
    /// Bind a listener inside the simulation.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the address is in use or invalid.
    pub async fn bind(address: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    /// Dial a remote host by simulation name.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the host is unreachable or refuses.
    pub async fn connect_to(address: &str) -> io::Result<TcpStream> {
        TcpStream::connect(address).await
    }
}

#[async_trait]
impl Transport for SimTransport {
    type SendStream = WriteHalf<TcpStream>;
    type RecvStream = ReadHalf<TcpStream>;

    async fn accept(&self) -> io::Result<(Self::SendStream, Self::RecvStream)> {
        let (stream, _addr) = self.listener.accept().await?;
        let (recv, send) = tokio::io::split(stream);
        Ok((send, recv))
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<(Self::SendStream, Self::RecvStream)> {
        let stream = TcpStream::connect(addr).await?;
        let (recv, send) = tokio::io::split(stream);
        Ok((send, recv))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn sim_transport_echo() {
        let mut sim = turmoil::Builder::new().build();

        sim.host("server", || async {
            let transport = SimTransport::bind("0.0.0.0:443").await?;
            let (mut send, mut recv) = transport.accept().await?;
            let mut buf = [0u8; 128];
            let n = recv.read(&mut buf).await?;
            send.write_all(&buf[..n]).await?;
            Ok(())
        });

        sim.client("client", async {
            let stream = SimTransport::connect_to("server:443").await?;
            let (mut recv, mut send) = tokio::io::split(stream);
            let message = b"hello, banana";
            send.write_all(message).await?;
            let mut buf = vec![0u8; message.len()];
            recv.read_exact(&mut buf).await?;
            assert_eq!(&buf, message);
            Ok(())
        });

        sim.run().expect("simulation failed");
    }
}
