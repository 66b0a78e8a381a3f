use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc::Sender, watch},
    task::JoinHandle,
};

use crate::constants::READ_TX_ERR;

/// Hands accepted connections to the reader stage until shutdown.
pub fn accept_connections(
    listener: TcpListener,
    read_tx: Sender<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.wait_for(|stop| *stop) => {
                    tracing::info!("Listener stopped");
                    break;
                }
            };

            match accepted {
                Ok((socket, addr)) => {
                    tracing::debug!("Accepted connection from {}", addr);
                    if read_tx.send(socket).await.is_err() {
                        tracing::error!("{}", READ_TX_ERR);
                        break;
                    }
                }
                Err(err) => tracing::warn!("Failed to accept connection: {}", err),
            }
        }
    })
}
