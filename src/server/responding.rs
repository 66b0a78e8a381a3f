use tokio::{io::AsyncWriteExt, sync::mpsc::Receiver, task::JoinHandle};

use crate::server::{models::Outbound, reading::Sockets};

pub fn respond(sockets: Sockets, mut res_rx: Receiver<Outbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = res_rx.recv().await {
            let Some(socket) = sockets.get(&msg.connection_id).map(|s| s.value().clone()) else {
                tracing::debug!("Connection {} gone, response dropped", msg.connection_id);
                continue;
            };

            let message = format!("{}\n", msg.line);
            let result = {
                let mut stream = socket.lock().await;
                match stream.write_all(message.as_bytes()).await {
                    Ok(()) => stream.flush().await,
                    Err(err) => Err(err),
                }
            };

            if let Err(err) = result {
                tracing::warn!(
                    "Failed to write to connection {}: {}",
                    msg.connection_id,
                    err
                );
                sockets.remove(&msg.connection_id);
            }
        }
    })
}
