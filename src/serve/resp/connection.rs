//! One session per connection.
//!
//! The session drains whatever frames the socket already buffered and
//! processes them as one batch: consecutive writes collapse into a
//! single journal entry (a phantom transaction), reads run after every
//! write ahead of them has applied, and replies leave in exactly the
//! order the requests came in.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::FutureExt;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use quarkdb_core::resp::{formatter, RespValue};
use quarkdb_core::{CommandType, RedisCommand, RedisRequest};

use crate::auth::{Authenticator, ValidationStatus};
use crate::node::QuarkDbNode;
use crate::prelude::Error;
use crate::serve::resp::RespCodec;

/// Upper bound on how many buffered frames one batch may drain.
const MAX_BATCH: usize = 128;

struct Session {
    node: Arc<QuarkDbNode>,
    client_id: i64,
    authenticator: Option<Authenticator>,
    authenticated: bool,
}

pub async fn handle_session(
    node: Arc<QuarkDbNode>,
    stream: TcpStream,
    exit: CancellationToken,
) -> Result<(), Error> {
    let mut framed = Framed::new(stream, RespCodec);
    let mut session = Session {
        client_id: node.next_client_id(),
        authenticator: node.password().map(Authenticator::new),
        authenticated: node.password().is_none(),
        node,
    };

    loop {
        let first = tokio::select! {
            _ = exit.cancelled() => return Ok(()),
            frame = framed.next() => frame,
        };
        let mut batch = match first {
            None => return Ok(()),
            Some(Err(err)) => {
                let _ = framed
                    .send(formatter::err(format!("protocol error: {err}")))
                    .await;
                return Ok(());
            }
            Some(Ok(value)) => vec![value],
        };

        // drain the rest of the burst without blocking
        while batch.len() < MAX_BATCH {
            match framed.next().now_or_never() {
                Some(Some(Ok(value))) => batch.push(value),
                Some(Some(Err(err))) => {
                    let _ = framed
                        .send(formatter::err(format!("protocol error: {err}")))
                        .await;
                    return Ok(());
                }
                Some(None) | None => break,
            }
        }

        let Some(_guard) = session.node.in_flight().acquire() else {
            let _ = framed
                .send(formatter::unavailable("node is shutting down"))
                .await;
            return Ok(());
        };

        let requests: Vec<RedisRequest> = batch.into_iter().map(to_request).collect();
        for reply in session.process_batch(requests).await {
            framed.feed(reply).await.map_err(Error::server)?;
        }
        framed.flush().await.map_err(Error::server)?;
    }
}

/// Client frames must be arrays of bulk strings.
fn to_request(value: RespValue) -> RedisRequest {
    let RespValue::Array(items) = value else {
        return RedisRequest::new(Vec::new());
    };
    let args: Vec<Bytes> = items
        .into_iter()
        .map(|item| match item {
            RespValue::Bulk(payload) => payload,
            RespValue::Simple(text) => Bytes::from(text.into_bytes()),
            RespValue::Integer(number) => Bytes::from(number.to_string().into_bytes()),
            _ => Bytes::new(),
        })
        .collect();
    RedisRequest::new(args)
}

impl Session {
    async fn process_batch(&mut self, requests: Vec<RedisRequest>) -> Vec<RespValue> {
        let mut replies = Vec::with_capacity(requests.len());
        let mut position = 0;

        while position < requests.len() {
            let request = &requests[position];

            // batch consecutive plain writes into one journal entry
            if self.wants_write_batching(request) {
                let mut group = vec![requests[position].clone()];
                while position + 1 < requests.len()
                    && self.wants_write_batching(&requests[position + 1])
                {
                    position += 1;
                    group.push(requests[position].clone());
                }
                replies.extend(self.node.execute_writes(group).await);
                position += 1;
                continue;
            }

            replies.push(self.process_one(request).await);
            position += 1;
        }
        replies
    }

    fn wants_write_batching(&self, request: &RedisRequest) -> bool {
        self.authenticated
            && request.command_type() == Some(CommandType::Write)
            && !request
                .command()
                .map(|command| command.is_internal())
                .unwrap_or(true)
    }

    async fn process_one(&mut self, request: &RedisRequest) -> RespValue {
        if request.is_empty() {
            return formatter::err("protocol error: expected an array of bulk strings");
        }

        let Some(command) = request.command() else {
            if !self.authenticated {
                return formatter::noauth();
            }
            return formatter::err(format!(
                "unknown command '{}'",
                String::from_utf8_lossy(request.arg(0))
            ));
        };

        let kind = request
            .command_type()
            .expect("parsed commands always carry a type");

        if kind == CommandType::Authentication {
            return self.authenticate(command, request);
        }
        if !self.authenticated {
            return formatter::noauth();
        }

        // internal commands never come in from the outside
        if command.is_internal() {
            return formatter::err(format!(
                "command '{command}' is internal and cannot be called directly"
            ));
        }

        match kind {
            CommandType::Read => {
                let mut replies = self.node.serve_read(request);
                replies.pop().unwrap_or_else(|| {
                    formatter::err("read produced no reply")
                })
            }
            // every authenticated, non-internal write satisfies
            // wants_write_batching and is grouped in process_batch
            CommandType::Write => unreachable!("writes are grouped in process_batch"),
            CommandType::Control => self.node.execute_control(self.client_id, request),
            CommandType::Raft => self.node.execute_raft(request).await,
            CommandType::Authentication => unreachable!("handled above"),
        }
    }

    fn authenticate(&mut self, command: RedisCommand, request: &RedisRequest) -> RespValue {
        let Some(authenticator) = self.authenticator.as_mut() else {
            return formatter::err("authentication is not enabled on this node");
        };

        match command {
            RedisCommand::Auth => {
                if request.len() != 2 {
                    return formatter::err_args("auth");
                }
                if authenticator.check_password(request.arg(1)) {
                    self.authenticated = true;
                    formatter::ok()
                } else {
                    formatter::err("invalid password")
                }
            }
            RedisCommand::HmacAuthGenerateChallenge => {
                if request.len() != 2 {
                    return formatter::err_args("hmac_auth_generate_challenge");
                }
                match authenticator.generate_challenge(request.arg(1)) {
                    Ok(challenge) => formatter::string(challenge),
                    Err(err) => formatter::err(err),
                }
            }
            RedisCommand::HmacAuthValidateChallenge => {
                if request.len() != 2 {
                    return formatter::err_args("hmac_auth_validate_challenge");
                }
                match authenticator.validate_signature(request.arg(1)) {
                    ValidationStatus::Ok => {
                        self.authenticated = true;
                        formatter::ok()
                    }
                    ValidationStatus::InvalidSignature => formatter::err("invalid signature"),
                    ValidationStatus::DeadlinePassed => {
                        formatter::err("challenge deadline passed")
                    }
                    ValidationStatus::NoChallengeInFlight => {
                        formatter::err("no challenge in flight")
                    }
                }
            }
            _ => formatter::err("unexpected authentication command"),
        }
    }
}
