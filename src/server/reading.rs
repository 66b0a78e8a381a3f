use std::sync::Arc;

use dashmap::DashMap;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::{
        Mutex,
        mpsc::{Receiver, Sender},
    },
    task::JoinHandle,
};
use tokio_stream::{StreamExt, wrappers::LinesStream};
use uuid::Uuid;

use crate::constants::HANDLE_TX_ERR;
use crate::server::models::Inbound;

pub type Sockets = Arc<DashMap<Uuid, Arc<Mutex<OwnedWriteHalf>>>>;

/// Splits every connection, registers its write half and forwards each
/// non-empty line to the handler stage. Responses still pending when the
/// client closes its side are dropped.
pub fn read_sockets(
    sockets: Sockets,
    mut read_rx: Receiver<TcpStream>,
    msg_handle_tx: Sender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(socket) = read_rx.recv().await {
            let connection_id = Uuid::new_v4();
            let (read_half, write_half) = socket.into_split();
            sockets.insert(connection_id, Arc::new(Mutex::new(write_half)));

            let sockets = sockets.clone();
            let msg_handle_tx = msg_handle_tx.clone();
            tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(read_half).lines());
                while let Some(line) = lines.next().await {
                    let line = match line {
                        Ok(line) => line,
                        Err(err) => {
                            tracing::warn!("Connection {} read failed: {}", connection_id, err);
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if msg_handle_tx
                        .send(Inbound::new(connection_id, &line))
                        .await
                        .is_err()
                    {
                        tracing::error!("{}", HANDLE_TX_ERR);
                        break;
                    }
                }

                sockets.remove(&connection_id);
                tracing::debug!("Connection {} closed", connection_id);
            });
        }
    })
}
