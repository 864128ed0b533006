use common::{DataFrame, OpenAck};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelManager, InboundEvent};

/// Servidor del plano de datos: acepta conexiones de productores remotos
/// y vuelca los batches en la cola de entrada del canal.
pub async fn serve_data(
    listener: TcpListener,
    manager: Arc<ChannelManager>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("plano de datos escuchando en {}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = listener.accept() => r,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("conexión de datos desde {}", peer);
                let manager = Arc::clone(&manager);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = handle_connection(stream, manager) => {}
                    }
                });
            }
            Err(e) => warn!("accept falló en el plano de datos: {}", e),
        }
    }

    debug!("plano de datos detenido");
}

async fn handle_connection(stream: TcpStream, manager: Arc<ChannelManager>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // 1) el primer frame dice a qué canal va el stream
    let channel = match lines.next_line().await {
        Ok(Some(line)) => match DataFrame::from_line(&line) {
            Ok(DataFrame::Open { channel }) => channel,
            Ok(other) => {
                warn!("se esperaba frame open, vino {:?}", other);
                return;
            }
            Err(e) => {
                warn!("frame inválido: {}", e);
                return;
            }
        },
        _ => return,
    };

    // 2) ack
    let sender = manager.input_sender(&channel);
    let ack = match &sender {
        Some(_) => OpenAck {
            ok: true,
            error: None,
        },
        None => OpenAck {
            ok: false,
            error: Some(format!("canal {} no registrado en este worker", channel)),
        },
    };
    let mut ack_line = match serde_json::to_vec(&ack) {
        Ok(v) => v,
        Err(_) => return,
    };
    ack_line.push(b'\n');
    if write_half.write_all(&ack_line).await.is_err() {
        return;
    }
    let Some(sender) = sender else {
        return;
    };

    // 3) batches hasta `end`; si se corta antes, el canal queda roto
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let bytes = line.len() + 1;
                match DataFrame::from_line(&line) {
                    Ok(DataFrame::Batch { records }) => {
                        manager.count_received(records.len(), bytes);
                        if sender.send(InboundEvent::Batch(records)).await.is_err() {
                            debug!("el consumidor del canal {} ya no está", channel);
                            return;
                        }
                    }
                    Ok(DataFrame::End) => {
                        let _ = sender.send(InboundEvent::End).await;
                        return;
                    }
                    Ok(DataFrame::Open { .. }) | Err(_) => {
                        let _ = sender
                            .send(InboundEvent::Broken(format!(
                                "frame inesperado en el canal {}",
                                channel
                            )))
                            .await;
                        return;
                    }
                }
            }
            Ok(None) | Err(_) => {
                let _ = sender
                    .send(InboundEvent::Broken(format!(
                        "la conexión del canal {} se cortó antes del fin",
                        channel
                    )))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager, tdd};
    use super::*;
    use common::{ChannelId, Record};
    use serde_json::json;

    async fn start() -> (Arc<ChannelManager>, std::net::SocketAddr, CancellationToken) {
        let (cm, _) = manager(0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_data(listener, cm.clone(), shutdown.clone()));
        (cm, addr, shutdown)
    }

    async fn open(addr: std::net::SocketAddr, channel: &str) -> (TcpStream, OpenAck) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let open = DataFrame::Open {
            channel: ChannelId::from(channel),
        };
        stream.write_all(&open.to_line().unwrap()).await.unwrap();
        let mut line = String::new();
        BufReader::new(&mut stream).read_line(&mut line).await.unwrap();
        (stream, serde_json::from_str(line.trim_end()).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_batches_reach_the_input_queue() {
        let (cm, addr, shutdown) = start().await;
        let consumer = tdd(&["remote-c"], &[]);
        let mut gates = cm.register(&consumer);

        let (mut stream, ack) = open(addr, "remote-c").await;
        assert!(ack.ok);

        let records: Vec<Record> = vec![json!(1), json!(2)];
        let batch = DataFrame::Batch {
            records: records.clone(),
        };
        stream.write_all(&batch.to_line().unwrap()).await.unwrap();
        stream.write_all(&DataFrame::End.to_line().unwrap()).await.unwrap();

        let gate = &mut gates[0];
        assert_eq!(
            gate_recv(gate).await,
            Some(InboundEvent::Batch(records))
        );
        assert_eq!(gate_recv(gate).await, Some(InboundEvent::End));
        assert_eq!(cm.utilization().records_received, 2);

        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_channel_is_refused() {
        let (_cm, addr, shutdown) = start().await;
        let (_stream, ack) = open(addr, "nobody").await;
        assert!(!ack.ok);
        assert!(ack.error.unwrap().contains("nobody"));
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cut_connection_marks_the_channel_broken() {
        let (cm, addr, shutdown) = start().await;
        let consumer = tdd(&["cut"], &[]);
        let mut gates = cm.register(&consumer);

        let (stream, ack) = open(addr, "cut").await;
        assert!(ack.ok);
        drop(stream);

        assert!(matches!(
            gate_recv(&mut gates[0]).await,
            Some(InboundEvent::Broken(_))
        ));
        shutdown.cancel();
    }

    async fn gate_recv(gate: &mut super::super::InputGate) -> Option<InboundEvent> {
        gate.recv_for_test().await
    }
}
