use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout};

use crate::protocol::{AdbError, Command, Packet};
use crate::session::{Session, SessionInner};

/// What the device answered to an OPEN.
pub(crate) enum OpenOutcome {
    Accepted,
    Rejected,
}

/// Per-stream state owned by the session's streams table. Closed
/// entries are kept (with their buffers) until the session ends, so a
/// collect after close still sees the data.
pub(crate) struct StreamState {
    /// 0 until the device confirms the OPEN.
    pub(crate) remote_id: u32,
    /// Received payload bytes, in arrival order. Collecting does not
    /// drain it.
    pub(crate) buffer: Vec<u8>,
    pub(crate) closed: bool,
    /// One-shot signal resolving the open in flight.
    pub(crate) ready: Option<oneshot::Sender<OpenOutcome>>,
    /// Close broadcast; every collect and send observes it.
    pub(crate) closed_tx: watch::Sender<bool>,
}

impl StreamState {
    /// Session teardown: mark closed and wake every observer. Dropping
    /// the ready sender fails an open still in flight.
    pub(crate) fn close_for_teardown(mut self) {
        self.closed = true;
        self.ready.take();
        self.closed_tx.send_replace(true);
    }
}

impl SessionInner {
    /// OKAY(remote, local): the first one confirms an OPEN and carries
    /// the device-side stream id; later ones are flow-control credits
    /// for data we sent and carry no state.
    pub(crate) fn handle_okay(&self, packet: &Packet) {
        let mut streams = self.streams.lock();
        match streams.get_mut(&packet.arg1) {
            Some(stream) if stream.remote_id == 0 => {
                stream.remote_id = packet.arg0;
                if let Some(tx) = stream.ready.take() {
                    let _ = tx.send(OpenOutcome::Accepted);
                }
            }
            Some(_) => {}
            None => debug!("OKAY for unknown stream {}", packet.arg1),
        }
    }

    /// WRTE(remote, local): buffer the payload and acknowledge at
    /// once. The device sends nothing further on the stream until the
    /// OKAY goes out; that single credit is the only flow control.
    pub(crate) async fn handle_wrte(&self, packet: Packet) {
        let local_id = packet.arg1;
        let known = {
            let mut streams = self.streams.lock();
            match streams.get_mut(&local_id) {
                Some(stream) => {
                    stream.buffer.extend_from_slice(&packet.payload);
                    true
                }
                None => false,
            }
        };

        if !known {
            debug!(
                "WRTE for unknown stream {local_id}, dropping {} bytes",
                packet.payload.len()
            );
            return;
        }

        if let Err(e) = self
            .send_packet(Packet::new(Command::Okay, local_id, packet.arg0, Vec::new()))
            .await
        {
            warn!("failed to acknowledge WRTE on stream {local_id}: {e}");
        }
    }

    /// CLSE(remote, local): an unconfirmed stream was rejected by the
    /// device (no reply is owed); an established one is closed and the
    /// close echoed back.
    pub(crate) async fn handle_clse(&self, packet: &Packet) {
        let local_id = packet.arg1;
        let reply_remote = {
            let mut streams = self.streams.lock();
            match streams.get_mut(&local_id) {
                Some(stream) if !stream.closed => {
                    stream.closed = true;
                    stream.closed_tx.send_replace(true);
                    if stream.remote_id == 0 {
                        if let Some(tx) = stream.ready.take() {
                            let _ = tx.send(OpenOutcome::Rejected);
                        }
                        None
                    } else {
                        Some(stream.remote_id)
                    }
                }
                _ => None,
            }
        };

        if let Some(remote_id) = reply_remote {
            let _ = self
                .send_packet(Packet::new(Command::Clse, local_id, remote_id, Vec::new()))
                .await;
        }
    }
}

impl Session {
    /// Open a service stream, e.g. `shell:echo hi`. The OPEN payload
    /// is the service string plus a NUL terminator.
    ///
    /// Fails with [`AdbError::Rejected`] when the device closes the
    /// stream before confirming it, or [`AdbError::Timeout`] when it
    /// does not answer within the open deadline.
    pub async fn open(&self, service: &str) -> Result<Stream, AdbError> {
        let inner = &self.inner;
        if !inner.is_running() {
            return Err(AdbError::Disconnected);
        }

        let local_id = inner.alloc_local_id();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        inner.streams.lock().insert(
            local_id,
            StreamState {
                remote_id: 0,
                buffer: Vec::new(),
                closed: false,
                ready: Some(ready_tx),
                closed_tx,
            },
        );

        let mut payload = service.as_bytes().to_vec();
        payload.push(0);
        if let Err(e) = inner
            .send_packet(Packet::new(Command::Open, local_id, 0, payload))
            .await
        {
            inner.streams.lock().remove(&local_id);
            return Err(e);
        }

        match timeout(inner.config.open_timeout, ready_rx).await {
            Ok(Ok(OpenOutcome::Accepted)) => Ok(Stream {
                inner: inner.clone(),
                local_id,
                closed_rx,
            }),
            Ok(Ok(OpenOutcome::Rejected)) => {
                inner.streams.lock().remove(&local_id);
                Err(AdbError::Rejected)
            }
            Ok(Err(_)) => Err(AdbError::Disconnected),
            Err(_) => {
                inner.streams.lock().remove(&local_id);
                Err(AdbError::Timeout)
            }
        }
    }
}

/// Handle to one open stream. The stream state itself lives in the
/// session's table; the handle is the id plus a close observer.
pub struct Stream {
    inner: Arc<SessionInner>,
    local_id: u32,
    closed_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Everything received so far, without draining the buffer.
    pub fn received(&self) -> Vec<u8> {
        self.inner
            .streams
            .lock()
            .get(&self.local_id)
            .map(|s| s.buffer.clone())
            .unwrap_or_default()
    }

    /// Wait until the stream closes or `deadline` passes, then return
    /// the bytes received so far. Never fails.
    pub async fn collect_bytes(&self, deadline: Duration) -> Vec<u8> {
        let mut closed_rx = self.closed_rx.clone();
        let _ = timeout(deadline, closed_rx.wait_for(|closed| *closed)).await;
        self.received()
    }

    /// [`collect_bytes`](Self::collect_bytes), decoded as UTF-8 (lossy).
    pub async fn collect(&self, deadline: Duration) -> String {
        String::from_utf8_lossy(&self.collect_bytes(deadline).await).into_owned()
    }

    /// Send a payload on the stream and wait for the device's
    /// flow-control acknowledgement.
    pub async fn send(&self, data: &[u8]) -> Result<(), AdbError> {
        if !self.inner.is_running() {
            return Err(AdbError::Disconnected);
        }
        let remote_id = {
            let streams = self.inner.streams.lock();
            let stream = streams.get(&self.local_id).ok_or(AdbError::Closed)?;
            if stream.closed {
                return Err(AdbError::Closed);
            }
            stream.remote_id
        };

        let local_id = self.local_id;
        let (waiter_id, ack_rx) = self
            .inner
            .add_waiter(move |p| p.command == Command::Okay && p.arg1 == local_id);

        if let Err(e) = self
            .inner
            .send_packet(Packet::new(Command::Wrte, local_id, remote_id, data.to_vec()))
            .await
        {
            self.inner.remove_waiter(waiter_id);
            return Err(e);
        }

        let mut closed_rx = self.closed_rx.clone();
        tokio::select! {
            ack = ack_rx => match ack {
                Ok(_) => Ok(()),
                Err(_) => Err(AdbError::Disconnected),
            },
            _ = closed_rx.wait_for(|closed| *closed) => {
                self.inner.remove_waiter(waiter_id);
                Err(AdbError::Closed)
            }
            _ = sleep(self.inner.config.write_timeout) => {
                self.inner.remove_waiter(waiter_id);
                Err(AdbError::Timeout)
            }
        }
    }

    /// Close the stream, telling the device when it knows about it.
    pub async fn close(&self) {
        let reply_remote = {
            let mut streams = self.inner.streams.lock();
            match streams.get_mut(&self.local_id) {
                Some(stream) if !stream.closed => {
                    stream.closed = true;
                    stream.closed_tx.send_replace(true);
                    Some(stream.remote_id)
                }
                _ => None,
            }
        };

        if let Some(remote_id) = reply_remote {
            if remote_id != 0 && self.inner.is_running() {
                let _ = self
                    .inner
                    .send_packet(Packet::new(Command::Clse, self.local_id, remote_id, Vec::new()))
                    .await;
            }
        }
    }
}
