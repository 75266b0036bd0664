//! Leader-side resilvering: one-shot transfer of a consistent
//! snapshot of the whole shard to a lagging or brand-new peer.
//!
//! The owner checkpoints both stores into a staging directory (with
//! journal trimming frozen), then this module walks the checkpoint and
//! streams every file in bounded chunks:
//!
//! ```text
//! RESILVERING_START  <id>
//! RESILVERING_COPY   <id> <relative-path> <offset> <bytes>
//! RESILVERING_FINISH <id>
//! ```
//!
//! Any error cancels the transfer on both sides.

use std::path::Path;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use quarkdb_core::resp::RespValue;
use quarkdb_core::{RaftServer, RedisRequest};
use quarkdb_fjall::walk_files;

use crate::client::PeerClient;
use crate::RaftError;

/// Upper bound per RESILVERING_COPY payload.
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Stream a finished checkpoint directory to `target`.
pub async fn transfer(
    target: &RaftServer,
    resilvering_id: &str,
    checkpoint: &Path,
) -> Result<(), RaftError> {
    let mut client = PeerClient::new(target.clone());

    let outcome = run_transfer(&mut client, resilvering_id, checkpoint).await;
    if outcome.is_err() {
        // best-effort cancel so the target can clear its arena
        let cancel = RedisRequest::from_parts(vec![
            b"resilvering_cancel".to_vec(),
            resilvering_id.as_bytes().to_vec(),
        ]);
        if let Err(err) = client.request(&cancel).await {
            warn!(target = %target, error = %err, "resilvering cancel failed");
        }
    }
    outcome
}

async fn run_transfer(
    client: &mut PeerClient,
    resilvering_id: &str,
    checkpoint: &Path,
) -> Result<(), RaftError> {
    let id = Bytes::copy_from_slice(resilvering_id.as_bytes());

    expect_ok(
        client
            .request(&RedisRequest::new(vec![
                Bytes::from_static(b"resilvering_start"),
                id.clone(),
            ]))
            .await?,
    )?;

    let files = walk_files(checkpoint)?;
    info!(id = resilvering_id, files = files.len(), "resilvering transfer starting");

    for relative in &files {
        let mut file = tokio::fs::File::open(checkpoint.join(relative)).await?;
        let mut offset = 0u64;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 && offset > 0 {
                break;
            }

            let request = RedisRequest::new(vec![
                Bytes::from_static(b"resilvering_copy"),
                id.clone(),
                Bytes::copy_from_slice(relative.to_string_lossy().as_bytes()),
                Bytes::from(offset.to_string()),
                Bytes::copy_from_slice(&buffer[..read]),
            ]);
            expect_ok(client.request(&request).await?)?;

            offset += read as u64;
            if read < CHUNK_SIZE {
                break;
            }
        }
    }

    expect_ok(
        client
            .request(&RedisRequest::new(vec![
                Bytes::from_static(b"resilvering_finish"),
                id.clone(),
            ]))
            .await?,
    )?;

    info!(id = resilvering_id, "resilvering transfer complete");
    Ok(())
}

fn expect_ok(reply: RespValue) -> Result<(), RaftError> {
    match reply {
        RespValue::Simple(text) if text == "OK" => Ok(()),
        other => Err(RaftError::Protocol(format!(
            "resilvering step rejected: {other:?}"
        ))),
    }
}
