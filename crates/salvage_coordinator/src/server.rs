//! TCP accept loop for worker connections.

use crate::connection::{run_connection, ConnectionContext};
use crate::metrics::METRICS;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::warn;

/// Accept workers forever, one handler task per socket, capped by a
/// connection-count semaphore. Sockets over the cap are dropped.
pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    max_connections: usize,
) {
    let permits = Arc::new(Semaphore::new(max_connections));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        let Ok(permit) = permits.clone().try_acquire_owned() else {
            METRICS.inc_connections_refused();
            warn!("connection limit reached, refusing {peer}");
            drop(stream);
            continue;
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            run_connection(ctx, stream, peer).await;
            drop(permit);
        });
    }
}
