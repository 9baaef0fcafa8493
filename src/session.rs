use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

use crate::auth::AdbKeyPair;
use crate::diagnostics::{Diagnostics, PacketDirection, PacketLog};
use crate::parsers;
use crate::protocol::{AdbError, AuthType, Command, Packet, ADB_VERSION, DEFAULT_MAX_PAYLOAD};
use crate::stream::StreamState;
use crate::transport::{Transport, UsbDevice};

/// Feature list advertised in the host banner. Kept to the services
/// this client actually speaks; broader sets would invite protocol
/// variants (shell v2, sendrecv v2) we do not implement.
const HOST_FEATURES: &str = "cmd,stat_v2,ls_v2,fixed_push_mkdir";

/// Pause between receiving the device CNXN and starting the read loop;
/// some devices drop frames sent immediately after the handshake.
const CNXN_SETTLE: Duration = Duration::from_millis(50);

/// Consecutive transient transfer failures tolerated by the read loop.
const READ_RETRY_BUDGET: u32 = 3;
const READ_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// Session tuning knobs. The defaults are safe for real devices.
#[derive(Debug, Clone)]
pub struct Config {
    /// Payload limit advertised in the host CNXN frame. The device's
    /// own limit replaces it once the handshake completes.
    pub max_payload: u32,
    /// Deadline for the whole connect handshake, including the user
    /// confirming a new key on the device.
    pub connect_timeout: Duration,
    /// Deadline for the device to answer an OPEN.
    pub open_timeout: Duration,
    /// Deadline for the flow-control acknowledgement of a WRTE.
    pub write_timeout: Duration,
    /// Collect deadline used by the shell helpers.
    pub shell_timeout: Duration,
    /// Identifier appended to the transmitted public key.
    pub key_comment: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            connect_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            shell_timeout: Duration::from_secs(30),
            key_comment: "adb@webusb".to_string(),
        }
    }
}

/// Identity properties parsed from the device CNXN banner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub serial: String,
    pub product: String,
    pub model: String,
}

/// A failed connect, with the packet traffic leading up to it. The
/// session is fully torn down by the time this is returned.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ConnectFailure {
    pub error: AdbError,
    pub diagnostics: Diagnostics,
}

type Predicate = Box<dyn Fn(&Packet) -> bool + Send>;

struct Waiter {
    id: u64,
    predicate: Predicate,
    tx: oneshot::Sender<Packet>,
}

#[derive(Default)]
struct WaiterRegistry {
    next_id: u64,
    entries: Vec<Waiter>,
}

/// Shared state behind every stream handle and background task.
pub(crate) struct SessionInner {
    pub(crate) transport: Transport,
    key: Arc<AdbKeyPair>,
    pub(crate) config: Config,
    running: AtomicBool,
    max_payload: AtomicU32,
    next_local_id: AtomicU32,
    pub(crate) streams: Mutex<HashMap<u32, StreamState>>,
    waiters: Mutex<WaiterRegistry>,
    log: Mutex<PacketLog>,
    identity: OnceLock<DeviceIdentity>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Next stream id from the monotone counter; never reused within
    /// the session.
    pub(crate) fn alloc_local_id(&self) -> u32 {
        self.next_local_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn send_packet(&self, packet: Packet) -> Result<(), AdbError> {
        self.log.lock().record(PacketDirection::Out, &packet);
        let limit = self.max_payload.load(Ordering::Relaxed) as usize;
        self.transport.send_packet(&packet, limit).await
    }

    pub(crate) fn add_waiter<F>(&self, predicate: F) -> (u64, oneshot::Receiver<Packet>)
    where
        F: Fn(&Packet) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut registry = self.waiters.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push(Waiter {
            id,
            predicate: Box::new(predicate),
            tx,
        });
        (id, rx)
    }

    pub(crate) fn remove_waiter(&self, id: u64) {
        self.waiters.lock().entries.retain(|w| w.id != id);
    }

    /// First waiter (in insertion order) whose predicate accepts the
    /// frame, removed from the registry.
    fn take_matching_waiter(&self, packet: &Packet) -> Option<oneshot::Sender<Packet>> {
        let mut registry = self.waiters.lock();
        let position = registry.entries.iter().position(|w| (w.predicate)(packet))?;
        Some(registry.entries.remove(position).tx)
    }

    /// Route one inbound frame: waiters first, then the stream
    /// multiplexer; anything else is dropped.
    pub(crate) async fn dispatch(&self, packet: Packet) {
        if let Some(tx) = self.take_matching_waiter(&packet) {
            let _ = tx.send(packet);
            return;
        }
        match packet.command {
            Command::Okay => self.handle_okay(&packet),
            Command::Wrte => self.handle_wrte(packet).await,
            Command::Clse => self.handle_clse(&packet).await,
            other => debug!("dropping unexpected {other} frame"),
        }
    }

    /// Await a frame matching `predicate`, pumping the transport
    /// inline. Used while the handshake runs, before the read loop
    /// owns the receive side; every pumped frame goes through the same
    /// dispatch path the loop uses.
    async fn wait_packet_pumping<F>(&self, predicate: F, deadline: Instant) -> Result<Packet, AdbError>
    where
        F: Fn(&Packet) -> bool + Send + 'static,
    {
        let (id, mut rx) = self.add_waiter(predicate);
        let mut failures = 0u32;
        loop {
            match rx.try_recv() {
                Ok(packet) => return Ok(packet),
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => return Err(AdbError::Disconnected),
            }
            if Instant::now() >= deadline {
                self.remove_waiter(id);
                return Err(AdbError::Timeout);
            }
            match timeout_at(deadline, self.transport.recv_packet()).await {
                Ok(Ok(packet)) => {
                    failures = 0;
                    self.log.lock().record(PacketDirection::In, &packet);
                    self.dispatch(packet).await;
                }
                Ok(Err(AdbError::TransportTransient(reason))) => {
                    failures += 1;
                    if failures > READ_RETRY_BUDGET {
                        self.remove_waiter(id);
                        return Err(AdbError::Disconnected);
                    }
                    warn!("transient transport failure during handshake: {reason}");
                    sleep(READ_RETRY_PAUSE).await;
                }
                Ok(Err(e)) => {
                    self.remove_waiter(id);
                    return Err(e);
                }
                Err(_) => {
                    self.remove_waiter(id);
                    return Err(AdbError::Timeout);
                }
            }
        }
    }

    /// Drive the connect handshake: send the host banner, then answer
    /// AUTH challenges, first with a token signature, then with the
    /// public key, until the device answers CNXN or gives up.
    async fn handshake(&self) -> Result<(), AdbError> {
        let banner = format!("host::features={HOST_FEATURES}");
        self.send_packet(Packet::new(
            Command::Cnxn,
            ADB_VERSION,
            self.config.max_payload,
            banner.into_bytes(),
        ))
        .await?;

        let deadline = Instant::now() + self.config.connect_timeout;
        let mut signature_sent = false;
        let mut pubkey_sent = false;

        loop {
            let packet = self
                .wait_packet_pumping(
                    |p| matches!(p.command, Command::Cnxn | Command::Auth),
                    deadline,
                )
                .await?;

            match packet.command {
                Command::Cnxn => {
                    self.apply_banner(&packet);
                    return Ok(());
                }
                Command::Auth => {
                    if packet.arg0 != AuthType::Token as u32 {
                        debug!("ignoring AUTH frame of type {}", packet.arg0);
                        continue;
                    }
                    if !signature_sent {
                        debug!("signing auth token ({} bytes)", packet.payload.len());
                        let signature = self.key.sign_token(&packet.payload)?;
                        self.send_packet(Packet::new(
                            Command::Auth,
                            AuthType::Signature as u32,
                            0,
                            signature,
                        ))
                        .await?;
                        signature_sent = true;
                    } else if !pubkey_sent {
                        info!("signature not accepted, offering public key (confirm on the device)");
                        let payload = self.key.public_key_payload(&self.config.key_comment);
                        self.send_packet(Packet::new(
                            Command::Auth,
                            AuthType::RsaPublicKey as u32,
                            0,
                            payload,
                        ))
                        .await?;
                        pubkey_sent = true;
                    } else {
                        return Err(AdbError::AuthRejected);
                    }
                }
                _ => {}
            }
        }
    }

    fn apply_banner(&self, packet: &Packet) {
        self.max_payload.store(packet.arg1, Ordering::Relaxed);

        let (kind, properties) = parsers::parse_banner(&packet.payload);
        debug!("{kind} banner with {} properties", properties.len());

        let identity = DeviceIdentity {
            serial: properties.get("ro.serialno").cloned().unwrap_or_default(),
            product: properties.get("ro.product.name").cloned().unwrap_or_default(),
            model: properties.get("ro.product.model").cloned().unwrap_or_default(),
        };
        info!(
            "connected to {} ({}, {}), max payload {:#x}",
            identity.serial, identity.product, identity.model, packet.arg1
        );
        let _ = self.identity.set(identity);
    }

    /// Stop everything: fail pending waiters, close all streams,
    /// release the USB interface, and cancel the background tasks.
    /// Idempotent; release and close errors are swallowed.
    pub(crate) async fn teardown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("tearing down session");

        // Dropping the senders fails every pending wait with a
        // disconnect.
        let drained = {
            let mut registry = self.waiters.lock();
            std::mem::take(&mut registry.entries)
        };
        drop(drained);

        let streams = std::mem::take(&mut *self.streams.lock());
        for stream in streams.into_values() {
            stream.close_for_teardown();
        }

        self.transport.release().await;

        // Cancel the tasks last: aborting the task we are running on
        // only takes effect at its next await point.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub(crate) fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            connected: self.is_running(),
            identity: self.identity.get().cloned(),
            max_payload: self.max_payload.load(Ordering::Relaxed),
            active_streams: self.streams.lock().values().filter(|s| !s.closed).count(),
            pending_waiters: self.waiters.lock().entries.len(),
            packets: self.log.lock().tail(),
        }
    }
}

/// One connected device: the packet channel, the stream table, and the
/// background read loop.
///
/// Cheap to clone; all clones share the same session. Created by
/// [`Session::connect`], destroyed by [`Session::disconnect`] or any
/// fatal transport error; after that every operation fails with
/// [`AdbError::Disconnected`] and the caller must reconnect.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Claim the ADB interface on `device`, run the CNXN/AUTH
    /// handshake, and start the read loop.
    pub async fn connect(
        device: Box<dyn UsbDevice>,
        key: Arc<AdbKeyPair>,
        config: Config,
    ) -> Result<Self, ConnectFailure> {
        let transport = Transport::claim(device, config.max_payload as usize)
            .await
            .map_err(|error| ConnectFailure {
                error,
                diagnostics: Diagnostics::default(),
            })?;

        let inner = Arc::new(SessionInner {
            transport,
            key,
            max_payload: AtomicU32::new(config.max_payload),
            config,
            running: AtomicBool::new(true),
            next_local_id: AtomicU32::new(1),
            streams: Mutex::new(HashMap::new()),
            waiters: Mutex::new(WaiterRegistry::default()),
            log: Mutex::new(PacketLog::default()),
            identity: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
        });

        if let Err(error) = inner.handshake().await {
            inner.teardown().await;
            return Err(ConnectFailure {
                error,
                diagnostics: inner.diagnostics(),
            });
        }

        sleep(CNXN_SETTLE).await;

        let read_inner = inner.clone();
        let read_task = tokio::spawn(read_loop(read_inner));

        let watch_inner = inner.clone();
        let watch_task = tokio::spawn(async move {
            watch_inner.transport.wait_disconnected().await;
            info!("device disappeared from the bus");
            watch_inner.teardown().await;
        });

        inner.tasks.lock().extend([read_task, watch_task]);
        if !inner.is_running() {
            // Torn down between the handshake and task registration;
            // the teardown that ran could not see the handles yet.
            for task in inner.tasks.lock().drain(..) {
                task.abort();
            }
        }

        Ok(Self { inner })
    }

    /// Identity parsed from the device banner.
    pub fn identity(&self) -> DeviceIdentity {
        self.inner.identity.get().cloned().unwrap_or_default()
    }

    /// The payload limit negotiated with the device.
    pub fn max_payload(&self) -> u32 {
        self.inner.max_payload.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_running()
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.inner.teardown().await;
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.inner.diagnostics()
    }
}

/// The per-session read loop: receive, log, dispatch, forever.
/// Tolerates a short burst of transient transfer failures; anything
/// worse tears the session down.
async fn read_loop(inner: Arc<SessionInner>) {
    let mut failures = 0u32;
    while inner.is_running() {
        match inner.transport.recv_packet().await {
            Ok(packet) => {
                failures = 0;
                inner.log.lock().record(PacketDirection::In, &packet);
                inner.dispatch(packet).await;
            }
            Err(AdbError::TransportTransient(reason)) => {
                failures += 1;
                if failures > READ_RETRY_BUDGET {
                    warn!("stopping after {failures} consecutive transport failures");
                    inner.teardown().await;
                    break;
                }
                warn!("transient transport failure in read loop: {reason}");
                sleep(READ_RETRY_PAUSE).await;
            }
            Err(e) => {
                if inner.is_running() {
                    info!("read loop stopping: {e}");
                }
                inner.teardown().await;
                break;
            }
        }
    }
}
