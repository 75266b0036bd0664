//! The RESP listener and per-connection sessions.

mod codec;
mod connection;

pub use codec::{CodecError, RespCodec};

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::node::QuarkDbNode;
use crate::prelude::Error;

pub struct Driver;

impl Driver {
    #[instrument(skip_all, fields(listen = %listen))]
    pub async fn run(
        listen: String,
        node: Arc<QuarkDbNode>,
        exit: CancellationToken,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(&listen).await.map_err(Error::server)?;
        info!("resp listening");

        loop {
            tokio::select! {
                _ = exit.cancelled() => {
                    info!("resp driver exiting");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let node = node.clone();
                            let exit = exit.clone();
                            tokio::spawn(async move {
                                if let Err(err) =
                                    connection::handle_session(node, stream, exit).await
                                {
                                    warn!(peer = %peer, error = %err, "session ended with error");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    }
                }
            }
        }
    }
}
