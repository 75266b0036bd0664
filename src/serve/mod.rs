//! Serving drivers. RESP over TCP is the only surface: clients, peers
//! and resilvering transfers all ride the same listener.

use std::sync::Arc;

use futures_util::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::node::QuarkDbNode;
use crate::prelude::Error;

pub mod resp;

pub fn load_drivers(
    all_drivers: &FuturesUnordered<tokio::task::JoinHandle<Result<(), Error>>>,
    node: Arc<QuarkDbNode>,
    exit: CancellationToken,
) {
    info!(listen = %node.config().listen, "starting resp driver");

    let driver = resp::Driver::run(node.config().listen.clone(), node, exit);
    all_drivers.push(tokio::spawn(driver));
}
