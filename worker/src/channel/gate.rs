use common::{ChannelId, DataFrame, OpenAck, Record};
use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ChannelManager;
use crate::error::TaskError;

/// Lo que llega por un canal de entrada.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Batch(Vec<Record>),
    End,
    /// El productor se fue sin cerrar el canal.
    Broken(String),
}

/* ---------------- entrada ---------------- */

pub struct InputGate {
    channel_id: ChannelId,
    receiver: mpsc::Receiver<InboundEvent>,
    ended: bool,
}

impl InputGate {
    pub(crate) fn new(channel_id: ChannelId, receiver: mpsc::Receiver<InboundEvent>) -> Self {
        Self {
            channel_id,
            receiver,
            ended: false,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    #[cfg(test)]
    pub(crate) async fn recv_for_test(&mut self) -> Option<InboundEvent> {
        self.receiver.recv().await
    }
}

/// Lee de varios gates a la vez: devuelve el primer batch disponible en
/// cualquiera de ellos, `None` cuando todos terminaron.
pub(crate) fn next_batch(
    gates: &mut [InputGate],
    cursor: &mut usize,
    cancel: &CancellationToken,
    handle: &Handle,
) -> Result<Option<Vec<Record>>, TaskError> {
    loop {
        if gates.iter().all(|g| g.ended) {
            return Ok(None);
        }

        let n = gates.len();
        let start = *cursor % n;
        let polled = handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => None,
                ev = poll_fn(|cx| {
                    for k in 0..n {
                        let i = (start + k) % n;
                        let gate = &mut gates[i];
                        if gate.ended {
                            continue;
                        }
                        if let Poll::Ready(ev) = gate.receiver.poll_recv(cx) {
                            return Poll::Ready((i, ev));
                        }
                    }
                    Poll::Pending
                }) => Some(ev),
            }
        });

        let Some((i, ev)) = polled else {
            return Err(TaskError::Cancelled);
        };
        *cursor = i + 1;

        match ev {
            Some(InboundEvent::Batch(records)) => return Ok(Some(records)),
            Some(InboundEvent::End) => {
                debug!("canal {} terminado", gates[i].channel_id);
                gates[i].ended = true;
            }
            Some(InboundEvent::Broken(reason)) => {
                return Err(TaskError::Execution(format!(
                    "canal {} roto: {}",
                    gates[i].channel_id, reason
                )));
            }
            None => {
                return Err(TaskError::Execution(format!(
                    "canal {} cerrado sin fin de datos",
                    gates[i].channel_id
                )));
            }
        }
    }
}

/* ---------------- salida ---------------- */

enum Sink {
    Local(mpsc::Sender<InboundEvent>),
    Remote(TcpStream),
}

/// Extremo de escritura de un canal. Junta registros en batches de
/// `buffer_size` y los manda al consumidor, local o remoto.
pub struct OutputGate {
    channel_id: ChannelId,
    manager: Arc<ChannelManager>,
    cancel: CancellationToken,
    handle: Handle,
    buffer: Vec<Record>,
    sink: Option<Sink>,
    closed: bool,
}

impl OutputGate {
    pub(crate) fn new(
        channel_id: ChannelId,
        manager: Arc<ChannelManager>,
        cancel: CancellationToken,
        handle: Handle,
    ) -> Self {
        let cap = manager.buffer_size();
        Self {
            channel_id,
            manager,
            cancel,
            handle,
            buffer: Vec::with_capacity(cap),
            sink: None,
            closed: false,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn emit(&mut self, record: Record) -> Result<(), TaskError> {
        if self.closed {
            return Err(TaskError::Execution(format!(
                "canal {} ya cerrado",
                self.channel_id
            )));
        }
        self.buffer.push(record);
        if self.buffer.len() >= self.manager.buffer_size() {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TaskError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.buffer);
        self.send(InboundEvent::Batch(records))
    }

    /// Manda lo pendiente y el fin de datos. Idempotente.
    pub fn close(&mut self) -> Result<(), TaskError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.send(InboundEvent::End)?;
        self.closed = true;
        Ok(())
    }

    fn send(&mut self, event: InboundEvent) -> Result<(), TaskError> {
        if self.sink.is_none() {
            let sink = self.connect()?;
            self.sink = Some(sink);
        }

        let records = match &event {
            InboundEvent::Batch(r) => r.len(),
            _ => 0,
        };

        let cancel = self.cancel.clone();
        let manager = Arc::clone(&self.manager);
        let channel_id = self.channel_id.clone();
        let handle = self.handle.clone();

        match self.sink.as_mut() {
            Some(Sink::Local(tx)) => handle.block_on(async {
                tokio::select! {
                    _ = cancel.cancelled() => Err(TaskError::Cancelled),
                    r = tx.send(event) => r.map_err(|_| TaskError::Execution(format!(
                        "el consumidor del canal {} ya no existe", channel_id
                    ))),
                }
            })?,
            Some(Sink::Remote(stream)) => {
                let frame = match event {
                    InboundEvent::Batch(records) => DataFrame::Batch { records },
                    InboundEvent::End => DataFrame::End,
                    InboundEvent::Broken(_) => return Ok(()),
                };
                let line = frame
                    .to_line()
                    .map_err(|e| TaskError::Execution(e.to_string()))?;
                handle.block_on(async {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(TaskError::Cancelled),
                        r = stream.write_all(&line) => r.map_err(|e| TaskError::Execution(format!(
                            "error escribiendo en el canal {}: {}", channel_id, e
                        ))),
                    }
                })?;
                manager.count_sent(0, line.len());
            }
            None => {}
        }

        manager.count_sent(records, 0);
        if matches!(self.sink, Some(Sink::Local(_))) {
            manager.count_received(records, 0);
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<Sink, TaskError> {
        let manager = Arc::clone(&self.manager);
        let cancel = self.cancel.clone();
        let channel_id = self.channel_id.clone();

        let target = self
            .handle
            .block_on(manager.resolve(&channel_id, &cancel))?;

        if &target == manager.local() {
            debug!("canal {} local", channel_id);
            return manager
                .input_sender(&channel_id)
                .map(Sink::Local)
                .ok_or_else(|| {
                    TaskError::Execution(format!(
                        "el consumidor del canal {} no está registrado en este worker",
                        channel_id
                    ))
                });
        }

        debug!("canal {} remoto en {}", channel_id, target.data_addr());
        self.handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Err(TaskError::Cancelled),
                r = open_remote(&channel_id, target.data_addr()) => r,
            }
        })
    }
}

async fn open_remote(
    channel_id: &ChannelId,
    addr: std::net::SocketAddr,
) -> Result<Sink, TaskError> {
    let io_err = |e: std::io::Error| {
        TaskError::Execution(format!("canal {} hacia {}: {}", channel_id, addr, e))
    };

    let mut stream = TcpStream::connect(addr).await.map_err(io_err)?;
    stream.set_nodelay(true).map_err(io_err)?;

    let open = DataFrame::Open {
        channel: channel_id.clone(),
    }
    .to_line()
    .map_err(|e| TaskError::Execution(e.to_string()))?;
    stream.write_all(&open).await.map_err(io_err)?;

    let mut line = String::new();
    BufReader::new(&mut stream)
        .read_line(&mut line)
        .await
        .map_err(io_err)?;

    let ack: OpenAck = serde_json::from_str(line.trim_end()).map_err(|e| {
        TaskError::Execution(format!("respuesta inválida del canal {}: {}", channel_id, e))
    })?;
    if !ack.ok {
        return Err(TaskError::Execution(ack.error.unwrap_or_else(|| {
            format!("el worker remoto rechazó el canal {}", channel_id)
        })));
    }

    Ok(Sink::Remote(stream))
}

impl Drop for OutputGate {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // un stream remoto que se cierra sin `end` ya cuenta como roto
        if let Some(Sink::Local(tx)) = &self.sink {
            let _ = tx.try_send(InboundEvent::Broken(format!(
                "el productor del canal {} terminó sin cerrarlo",
                self.channel_id
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{manager, tdd};
    use super::*;
    use serde_json::json;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn local_records_arrive_in_batches_then_end() {
        let rt = runtime();
        let (cm, _) = manager(1);
        let consumer = tdd(&["c"], &[]);
        let producer = tdd(&[], &["c"]);

        let mut inputs = cm.register(&consumer);
        cm.register(&producer);

        let cancel = CancellationToken::new();
        let mut outputs = cm.output_gates(&producer, &cancel, rt.handle());
        assert_eq!(outputs.len(), 1);

        let writer = std::thread::spawn(move || {
            let out = &mut outputs[0];
            for i in 0..5 {
                out.emit(json!(i)).unwrap();
            }
            out.close().unwrap();
        });

        let mut seen = Vec::new();
        let mut cursor = 0;
        while let Some(batch) = next_batch(&mut inputs, &mut cursor, &cancel, rt.handle()).unwrap()
        {
            assert!(batch.len() <= 2);
            seen.extend(batch);
        }
        writer.join().unwrap();

        assert_eq!(seen, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
        assert!(inputs[0].is_ended());

        let u = cm.utilization();
        assert_eq!(u.records_sent, 5);
        assert_eq!(u.records_received, 5);
    }

    #[test]
    fn dropping_an_unclosed_gate_breaks_the_channel() {
        let rt = runtime();
        let (cm, _) = manager(0);
        let consumer = tdd(&["c"], &[]);
        let producer = tdd(&[], &["c"]);

        let mut inputs = cm.register(&consumer);
        let cancel = CancellationToken::new();
        let mut outputs = cm.output_gates(&producer, &cancel, rt.handle());

        outputs[0].emit(json!("a")).unwrap();
        outputs[0].flush().unwrap();
        drop(outputs);

        let mut cursor = 0;
        let first = next_batch(&mut inputs, &mut cursor, &cancel, rt.handle()).unwrap();
        assert_eq!(first, Some(vec![json!("a")]));

        let err = next_batch(&mut inputs, &mut cursor, &cancel, rt.handle()).unwrap_err();
        assert!(matches!(err, TaskError::Execution(msg) if msg.contains("roto")));
    }

    #[test]
    fn blocked_reader_observes_cancellation() {
        let rt = runtime();
        let (cm, _) = manager(0);
        let consumer = tdd(&["c"], &[]);
        let mut inputs = cm.register(&consumer);

        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        rt.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            c2.cancel();
        });

        let mut cursor = 0;
        let err = next_batch(&mut inputs, &mut cursor, &cancel, rt.handle()).unwrap_err();
        assert_eq!(err, TaskError::Cancelled);
    }

    #[test]
    fn no_inputs_means_immediately_exhausted() {
        let rt = runtime();
        let cancel = CancellationToken::new();
        let mut cursor = 0;
        assert_eq!(
            next_batch(&mut [], &mut cursor, &cancel, rt.handle()).unwrap(),
            None
        );
    }
}
