//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;

use querierd_utils::ibus::{IbusMsg, IbusSender};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tracing::warn;

// Serves the read-only state snapshot over a UNIX socket. Each connection
// receives the JSON-serialized view of all interfaces and their group
// memberships.
pub(crate) async fn serve(listener: Arc<UnixListener>, ibus_tx: IbusSender) {
    loop {
        let mut stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(error) => {
                warn!(%error, "failed to accept IPC connection");
                return;
            }
        };

        // Fetch a snapshot from the instance.
        let (responder, reply) = oneshot::channel();
        if ibus_tx
            .send(IbusMsg::StateRequest(Some(responder)))
            .is_err()
        {
            return;
        }
        let Ok(snapshot) = reply.await else {
            continue;
        };

        let mut output = snapshot.to_string();
        output.push('\n');
        let _ = stream.write_all(output.as_bytes()).await;
    }
}
