//! Null-byte-framed transport for the Virtuozzo agent socket.
//!
//! The agent speaks strictly sequential request/response over one TCP
//! connection: every message is terminated by a single null byte, and each
//! API call opens a fresh connection for a login/command exchange. The
//! connection is never shared or pipelined.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::{Error, Result};

/// One completed login/command exchange.
pub struct Exchange {
    /// The agent's answer to the login envelope.
    pub login_ack: String,
    /// The answer to the command envelope.
    pub response: String,
}

pub struct SocketClient {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SocketClient {
    pub fn new(host: impl Into<String>, port: u16, io_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            io_timeout,
        }
    }

    /// Run one call: connect, send the login envelope, skip the agent's
    /// banner, read the login ack, send the command, read its response.
    pub async fn exchange(&self, login: &str, command: &str) -> Result<Exchange> {
        let address = format!("{}:{}", self.host, self.port);

        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::Connect {
                message: format!("connection to {address} timed out"),
            })?
            .map_err(|e| Error::Connect {
                message: format!("can't connect to {address}: {e}"),
            })?;

        let (read_half, mut write_half) = stream.split();
        let mut reader = BufReader::new(read_half);

        self.write_message(&mut write_half, login).await?;

        // the agent greets every connection before answering the login
        self.read_message(&mut reader).await?;
        let login_ack = self.read_message(&mut reader).await?;

        self.write_message(&mut write_half, command).await?;
        let response = self.read_message(&mut reader).await?;

        Ok(Exchange {
            login_ack,
            response,
        })
    }

    async fn read_message<R>(&self, reader: &mut R) -> Result<String>
    where
        R: AsyncBufReadExt + Unpin,
    {
        let mut buf = Vec::new();

        timeout(self.io_timeout, reader.read_until(0, &mut buf))
            .await
            .map_err(|_| Error::Connect {
                message: "agent read timed out".into(),
            })??;

        if buf.last() == Some(&0) {
            buf.pop();
        }

        if buf.is_empty() {
            return Err(Error::Empty);
        }

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn write_message<W>(&self, writer: &mut W, message: &str) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        timeout(self.io_timeout, async {
            writer.write_all(message.as_bytes()).await?;
            writer.write_all(&[0]).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| Error::Connect {
            message: "agent write timed out".into(),
        })??;

        Ok(())
    }
}
