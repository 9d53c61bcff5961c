//! One client connection: a reader thread that dispatches requests and a writer thread that owns
//! the outbound half of the socket.
//!
//! Replies and notifications for a client share one unbounded outbound queue, so the writer sends
//! them in the order they were produced. `SendCommand` runs on its own thread because it blocks
//! until the engine answers; the other operations are answered inline.
//!
//! Shutdown:
//! - the client closes or faults: the reader exits, unsubscribes and stops the writer;
//! - the writer fails: it shuts the socket down, which wakes the reader;
//! - the server closes: each writer flushes its queue, shuts the socket down and confirms on its
//!   `done` channel. Connections that do not confirm in time are aborted.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use log::{debug, error, info, warn};
use mtbridge_common::net::Stream;
use mtbridge_common::wire::{
    FrameReader, Operation, Reply, RequestFrame, RequestId, ServerFrame, write_frame,
};
use mtbridge_common::{BridgeError, Result};

use crate::hub::{CallbackChannel, SubscriberId};
use crate::service::Service;

struct LiveConnection {
    stream: Stream,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
}

/// Connections accepted by the listeners of one server.
#[derive(Default)]
pub struct ConnectionSet {
    next_id: AtomicU64,
    live: Mutex<HashMap<SubscriberId, LiveConnection>>,
}

impl ConnectionSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open connections.
    pub fn len(&self) -> Result<usize> {
        Ok(self.live.lock()?.len())
    }

    /// Whether no connection is open.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Asks every writer to flush and close, waiting at most `budget` in total.
    pub fn close_all(&self, budget: Duration) -> Result<()> {
        let pending: Vec<(SubscriberId, Receiver<()>)> = {
            let live = self.live.lock()?;
            live.iter()
                .map(|(id, c)| {
                    if c.stop_tx.send(()).is_err() {
                        debug!("Connection {} already stopping", id);
                    }
                    (*id, c.done_rx.clone())
                })
                .collect()
        };
        let deadline = Instant::now() + budget;
        let mut stuck = Vec::new();
        for (id, done_rx) in pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if done_rx.recv_timeout(remaining).is_err() {
                stuck.push(id);
            }
        }
        if stuck.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::Connection(format!(
                "connections {:?} did not close within {:?}",
                stuck, budget
            )))
        }
    }

    /// Shuts every socket down without waiting.
    pub fn abort_all(&self) -> Result<()> {
        let drained: Vec<(SubscriberId, LiveConnection)> = self.live.lock()?.drain().collect();
        for (id, connection) in drained {
            if let Err(e) = connection.stream.shutdown() {
                debug!("Abort of connection {}: {}", id, e);
            }
        }
        Ok(())
    }

    fn insert(&self, id: SubscriberId, connection: LiveConnection) -> Result<()> {
        self.live.lock()?.insert(id, connection);
        Ok(())
    }

    fn remove(&self, id: SubscriberId) {
        match self.live.lock() {
            Ok(mut live) => {
                live.remove(&id);
            }
            Err(e) => error!("Connection set poisoned while removing {}: {}", id, e),
        }
    }
}

/// Starts serving an accepted stream on its own threads.
pub fn spawn_connection(
    stream: Stream,
    service: Arc<Service>,
    connections: Arc<ConnectionSet>,
    io_timeout: Duration,
) -> Result<()> {
    stream.set_timeouts(Some(io_timeout))?;
    let id = connections.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let peer = stream.peer_label();
    let writer_stream = stream.try_clone()?;
    let control = stream.try_clone()?;

    let (out_tx, out_rx) = unbounded::<ServerFrame>();
    let (stop_tx, stop_rx) = unbounded::<()>();
    let (done_tx, done_rx) = bounded::<()>(1);
    connections.insert(
        id,
        LiveConnection {
            stream: control,
            stop_tx: stop_tx.clone(),
            done_rx,
        },
    )?;

    thread::Builder::new()
        .name(format!("conn-{id}-writer"))
        .spawn(move || write_loop(id, writer_stream, out_rx, stop_rx, done_tx))?;

    thread::Builder::new()
        .name(format!("conn-{id}-reader"))
        .spawn(move || {
            info!("Client {} connected from {}", id, peer);
            read_loop(id, stream, &service, &out_tx);
            if let Err(e) = service.disconnect(id) {
                warn!("Cleanup of client {} failed: {}", id, e);
            }
            connections.remove(id);
            if stop_tx.send(()).is_err() {
                debug!("Writer of client {} already gone", id);
            }
            info!("Client {} ({}) disconnected", id, peer);
        })?;
    Ok(())
}

fn read_loop(id: SubscriberId, stream: Stream, service: &Arc<Service>, out_tx: &Sender<ServerFrame>) {
    let channel: Arc<dyn CallbackChannel> = Arc::new(out_tx.clone());
    let mut reader = FrameReader::new(stream);
    loop {
        match reader.read::<RequestFrame>() {
            Ok(Some(frame)) => dispatch_frame(id, frame, service, &channel, out_tx),
            Ok(None) => break,
            // Already logged with its size; the next frame may be fine.
            Err(e) if e.is_protocol() => continue,
            Err(e) => {
                debug!("Client {} read ended: {}", id, e);
                break;
            }
        }
    }
}

fn dispatch_frame(
    id: SubscriberId,
    frame: RequestFrame,
    service: &Arc<Service>,
    channel: &Arc<dyn CallbackChannel>,
    out_tx: &Sender<ServerFrame>,
) {
    let RequestFrame { id: request_id, op } = frame;
    if let Operation::SendCommand(_) = op {
        let service = Arc::clone(service);
        let channel = Arc::clone(channel);
        let task_tx = out_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("conn-{id}-call-{request_id}"))
            .spawn(move || {
                if let Some(reply) = service.dispatch(id, channel, op) {
                    send_reply(id, request_id, reply, &task_tx);
                }
            });
        if let Err(e) = spawned {
            error!("Client {}: cannot start call {}: {}", id, request_id, e);
            let fault = Reply::from_result(Err(e.into()));
            send_reply(id, request_id, fault, out_tx);
        }
        return;
    }
    if let Some(reply) = service.dispatch(id, Arc::clone(channel), op) {
        send_reply(id, request_id, reply, out_tx);
    }
}

fn send_reply(
    id: SubscriberId,
    request_id: RequestId,
    reply: Reply,
    out_tx: &Sender<ServerFrame>,
) {
    if out_tx
        .send(ServerFrame::Reply {
            id: request_id,
            reply,
        })
        .is_err()
    {
        warn!("Client {} left before reply {} was sent", id, request_id);
    }
}

fn write_loop(
    id: SubscriberId,
    mut stream: Stream,
    out_rx: Receiver<ServerFrame>,
    stop_rx: Receiver<()>,
    done_tx: Sender<()>,
) {
    loop {
        select! {
            recv(out_rx) -> msg => match msg {
                Ok(frame) => {
                    if let Err(e) = write_frame(&mut stream, &frame) {
                        warn!("Client {}: write failed: {}", id, e);
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(stop_rx) -> _ => {
                for frame in out_rx.try_iter() {
                    if let Err(e) = write_frame(&mut stream, &frame) {
                        debug!("Client {}: flush on close failed: {}", id, e);
                        break;
                    }
                }
                break;
            }
        }
    }
    if let Err(e) = stream.shutdown() {
        debug!("Client {}: shutdown: {}", id, e);
    }
    if done_tx.send(()).is_err() {
        debug!("Client {}: nobody waits for close confirmation", id);
    }
}
