//! Scripted mock USB device used by the integration tests. Outbound
//! transfers are recorded and reassembled into packets; a responder
//! closure scripts what the "device" sends back.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use usbadb::auth::{AdbKeyPair, MemoryKeyStore};
use usbadb::protocol::{Command, Header, Packet, ADB_VERSION};
use usbadb::transport::{
    AlternateInfo, ConfigurationInfo, Direction, EndpointInfo, EndpointKind, InterfaceInfo,
    UsbDevice, UsbError,
};

/// One host key pair per test binary; RSA generation is slow.
pub static HOST_KEY: LazyLock<Arc<AdbKeyPair>> =
    LazyLock::new(|| Arc::new(AdbKeyPair::generate().expect("key generation")));

/// A key store pre-seeded with [`HOST_KEY`].
pub fn seeded_keystore() -> MemoryKeyStore {
    let (private_jwk, public_jwk) = HOST_KEY.to_jwk().expect("JWK export");
    MemoryKeyStore::with_key(private_jwk, public_jwk)
}

/// The CNXN frame a device answers with once it is satisfied.
pub fn device_cnxn() -> Packet {
    Packet::new(
        Command::Cnxn,
        ADB_VERSION,
        0x40000,
        b"device::ro.product.name=x;ro.product.model=y;ro.serialno=Z\0".to_vec(),
    )
}

type Responder = Box<dyn FnMut(&Packet) -> Vec<Packet> + Send>;

pub struct MockState {
    configurations: Vec<ConfigurationInfo>,
    active: Mutex<Option<u8>>,
    pub claim_busy: AtomicBool,
    pub opened: AtomicBool,
    pub closed: AtomicBool,
    pub released: AtomicBool,
    pub gone: AtomicBool,
    pub fail_next_out: AtomicBool,
    pub cleared_halts: Mutex<Vec<(Direction, u8)>>,
    outbound: Mutex<Vec<Vec<u8>>>,
    pending_out: Mutex<Option<Header>>,
    responder: Mutex<Option<Responder>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MockState {
    /// Queue a raw IN transfer.
    pub fn push_chunk(&self, chunk: Vec<u8>) {
        if let Some(tx) = &*self.inbound_tx.lock() {
            let _ = tx.send(chunk);
        }
    }

    /// Queue a packet as the device would send it: a header transfer,
    /// then a payload transfer when there is a payload.
    pub fn push_packet(&self, packet: &Packet) {
        self.push_chunk(packet.encode_header(usize::MAX).expect("encode").to_vec());
        if !packet.payload.is_empty() {
            self.push_chunk(packet.payload.clone());
        }
    }

    /// Unplug the device: every further transfer fails with NotFound.
    pub fn unplug(&self) {
        self.gone.store(true, Ordering::SeqCst);
        *self.inbound_tx.lock() = None;
    }

    /// Raw OUT transfers in order, zero-length packets included.
    pub fn raw_out(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().clone()
    }

    pub fn clear_out(&self) {
        self.outbound.lock().clear();
    }

    /// OUT transfers reassembled into packets (ZLPs skipped).
    pub fn sent_packets(&self) -> Vec<Packet> {
        let transfers = self.raw_out();
        let mut packets = Vec::new();
        let mut pending: Option<Header> = None;
        for transfer in transfers {
            match pending.take() {
                Some(header) => {
                    if transfer.is_empty() {
                        pending = Some(header);
                    } else {
                        packets.push(Packet::new(
                            header.command,
                            header.arg0,
                            header.arg1,
                            transfer,
                        ));
                    }
                }
                None => {
                    if transfer.len() == 24 {
                        if let Some(header) = Header::decode(&transfer) {
                            if header.payload_len == 0 {
                                packets.push(Packet::new(
                                    header.command,
                                    header.arg0,
                                    header.arg1,
                                    Vec::new(),
                                ));
                            } else {
                                pending = Some(header);
                            }
                        }
                    }
                }
            }
        }
        packets
    }

    fn feed_out(&self, data: &[u8]) {
        let complete = {
            let mut pending = self.pending_out.lock();
            match pending.take() {
                Some(header) => {
                    if data.is_empty() {
                        *pending = Some(header);
                        None
                    } else {
                        Some(Packet::new(
                            header.command,
                            header.arg0,
                            header.arg1,
                            data.to_vec(),
                        ))
                    }
                }
                None => match Header::decode(data) {
                    Some(header) if data.len() == 24 => {
                        if header.payload_len == 0 {
                            Some(Packet::new(header.command, header.arg0, header.arg1, Vec::new()))
                        } else {
                            *pending = Some(header);
                            None
                        }
                    }
                    _ => None,
                },
            }
        };

        if let Some(packet) = complete {
            let replies = {
                let mut responder = self.responder.lock();
                responder.as_mut().map(|f| f(&packet)).unwrap_or_default()
            };
            for reply in &replies {
                self.push_packet(reply);
            }
        }
    }
}

pub struct MockDevice {
    state: Arc<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_out_packet_size(512)
    }

    pub fn with_out_packet_size(out_packet_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            configurations: vec![adb_configuration(out_packet_size)],
            active: Mutex::new(Some(1)),
            claim_busy: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            fail_next_out: AtomicBool::new(false),
            cleared_halts: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            pending_out: Mutex::new(None),
            responder: Mutex::new(None),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
        });
        Self { state }
    }

    /// A device exposing only a mass-storage interface, no ADB.
    pub fn without_adb_interface() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            configurations: vec![ConfigurationInfo {
                value: 1,
                interfaces: vec![InterfaceInfo {
                    number: 0,
                    alternates: vec![AlternateInfo {
                        setting: 0,
                        class: 0x08,
                        subclass: 0x06,
                        protocol: 0x50,
                        endpoints: Vec::new(),
                    }],
                }],
            }],
            active: Mutex::new(Some(1)),
            claim_busy: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            fail_next_out: AtomicBool::new(false),
            cleared_halts: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            pending_out: Mutex::new(None),
            responder: Mutex::new(None),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
        });
        Self { state }
    }

    /// Shared handle for assertions after the device moves into the
    /// session.
    pub fn state(&self) -> Arc<MockState> {
        self.state.clone()
    }

    pub fn set_responder(&self, responder: impl FnMut(&Packet) -> Vec<Packet> + Send + 'static) {
        *self.state.responder.lock() = Some(Box::new(responder));
    }
}

#[async_trait]
impl UsbDevice for MockDevice {
    fn configurations(&self) -> Vec<ConfigurationInfo> {
        self.state.configurations.clone()
    }

    fn active_configuration(&self) -> Option<u8> {
        *self.state.active.lock()
    }

    async fn open(&self) -> Result<(), UsbError> {
        self.state.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), UsbError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn select_configuration(&self, value: u8) -> Result<(), UsbError> {
        *self.state.active.lock() = Some(value);
        Ok(())
    }

    async fn claim_interface(&self, _number: u8) -> Result<(), UsbError> {
        if self.state.claim_busy.load(Ordering::SeqCst) {
            return Err(UsbError::Busy);
        }
        Ok(())
    }

    async fn release_interface(&self, _number: u8) -> Result<(), UsbError> {
        self.state.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn select_alternate(&self, _interface: u8, _setting: u8) -> Result<(), UsbError> {
        Ok(())
    }

    async fn clear_halt(&self, direction: Direction, endpoint: u8) -> Result<(), UsbError> {
        self.state.cleared_halts.lock().push((direction, endpoint));
        Ok(())
    }

    async fn transfer_in(&self, _endpoint: u8, _length: usize) -> Result<Vec<u8>, UsbError> {
        if self.state.gone.load(Ordering::SeqCst) {
            return Err(UsbError::NotFound);
        }
        let mut rx = self.state.inbound_rx.lock().await;
        match rx.recv().await {
            Some(chunk) => Ok(chunk),
            None => Err(UsbError::NotFound),
        }
    }

    async fn transfer_out(&self, _endpoint: u8, data: &[u8]) -> Result<usize, UsbError> {
        if self.state.gone.load(Ordering::SeqCst) {
            return Err(UsbError::NotFound);
        }
        if self.state.fail_next_out.swap(false, Ordering::SeqCst) {
            return Err(UsbError::Transfer("injected failure".into()));
        }
        self.state.outbound.lock().push(data.to_vec());
        self.state.feed_out(data);
        Ok(data.len())
    }
}

fn adb_configuration(out_packet_size: usize) -> ConfigurationInfo {
    ConfigurationInfo {
        value: 1,
        interfaces: vec![InterfaceInfo {
            number: 1,
            alternates: vec![AlternateInfo {
                setting: 0,
                class: 0xff,
                subclass: 0x42,
                protocol: 0x01,
                endpoints: vec![
                    EndpointInfo {
                        number: 1,
                        direction: Direction::In,
                        kind: EndpointKind::Bulk,
                        packet_size: 512,
                    },
                    EndpointInfo {
                        number: 2,
                        direction: Direction::Out,
                        kind: EndpointKind::Bulk,
                        packet_size: out_packet_size,
                    },
                ],
            }],
        }],
    }
}
