//! Minimal RESP client used for peer-to-peer traffic.
//!
//! One connection per peer worker; reconnects lazily on the next
//! request after any failure. All requests are strictly
//! request-response, so a single read buffer per connection suffices.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use quarkdb_core::resp::{decode_value, encode_request, RespValue};
use quarkdb_core::{RaftServer, RedisRequest};

use crate::RaftError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PeerClient {
    target: RaftServer,
    stream: Option<TcpStream>,
    buffer: BytesMut,
}

impl PeerClient {
    pub fn new(target: RaftServer) -> Self {
        PeerClient {
            target,
            stream: None,
            buffer: BytesMut::with_capacity(16 * 1024),
        }
    }

    pub fn target(&self) -> &RaftServer {
        &self.target
    }

    async fn connected(&mut self) -> Result<&mut TcpStream, RaftError> {
        if self.stream.is_none() {
            let address = format!("{}:{}", self.target.host, self.target.port);
            let stream = tokio::time::timeout(REQUEST_TIMEOUT, TcpStream::connect(&address))
                .await
                .map_err(|_| RaftError::Network(format!("connect to {address} timed out")))?
                .map_err(|err| RaftError::Network(format!("connect to {address}: {err}")))?;
            stream
                .set_nodelay(true)
                .map_err(|err| RaftError::Network(err.to_string()))?;
            self.buffer.clear();
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("just connected"))
    }

    /// Issue one request and await one reply. Any failure tears the
    /// connection down; the next call reconnects.
    pub async fn request(&mut self, request: &RedisRequest) -> Result<RespValue, RaftError> {
        match tokio::time::timeout(REQUEST_TIMEOUT, self.exchange(request)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                self.stream = None;
                Err(err)
            }
            Err(_) => {
                self.stream = None;
                Err(RaftError::Network(format!(
                    "request to {} timed out",
                    self.target
                )))
            }
        }
    }

    async fn exchange(&mut self, request: &RedisRequest) -> Result<RespValue, RaftError> {
        let mut wire = BytesMut::new();
        encode_request(request.args(), &mut wire);

        let stream = self.connected().await?;
        stream
            .write_all(&wire)
            .await
            .map_err(|err| RaftError::Network(err.to_string()))?;

        loop {
            if let Some(value) =
                decode_value(&mut self.buffer).map_err(|err| RaftError::Protocol(err.to_string()))?
            {
                return Ok(value);
            }
            let stream = self.stream.as_mut().expect("stream present during exchange");
            let read = tokio::io::AsyncReadExt::read_buf(stream, &mut self.buffer)
                .await
                .map_err(|err| RaftError::Network(err.to_string()))?;
            if read == 0 {
                return Err(RaftError::Network(format!(
                    "{} closed the connection",
                    self.target
                )));
            }
        }
    }
}
