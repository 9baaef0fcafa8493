use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;

use crate::protocol::{AdbError, Header, Packet, HEADER_LEN};

/// ADB USB interface class/subclass/protocol
const ADB_CLASS: u8 = 0xff;
const ADB_SUBCLASS: u8 = 0x42;
const ADB_PROTOCOL: u8 = 0x01;

/// Delay after selecting an alternate setting, so the device firmware
/// can settle before the first bulk transfer.
const ALT_SETTLE: Duration = Duration::from_millis(100);

/// Transfer direction, relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// One endpoint of an alternate interface setting.
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub number: u8,
    pub direction: Direction,
    pub kind: EndpointKind,
    /// Max packet size in bytes.
    pub packet_size: usize,
}

/// One alternate setting of an interface.
#[derive(Debug, Clone)]
pub struct AlternateInfo {
    pub setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

/// One interface of a configuration.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alternates: Vec<AlternateInfo>,
}

/// One device configuration.
#[derive(Debug, Clone)]
pub struct ConfigurationInfo {
    pub value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

/// Errors reported by the USB host collaborator.
#[derive(Debug, Clone, Error)]
pub enum UsbError {
    /// The device is gone (unplugged or closed).
    #[error("device not found")]
    NotFound,

    /// The interface is held by another process.
    #[error("interface busy")]
    Busy,

    /// The endpoint stalled.
    #[error("endpoint stalled")]
    Stall,

    /// Any other transfer failure.
    #[error("transfer failed: {0}")]
    Transfer(String),
}

/// The USB host collaborator: an already-picked, not-yet-open device.
///
/// Device selection (the picker dialog) lives outside this crate; the
/// caller hands a `UsbDevice` to [`crate::client::Adb::connect`].
#[async_trait]
pub trait UsbDevice: Send + Sync {
    /// All configurations, with their interfaces, alternate settings
    /// and endpoints.
    fn configurations(&self) -> Vec<ConfigurationInfo>;

    /// The value of the currently active configuration, if any.
    fn active_configuration(&self) -> Option<u8>;

    async fn open(&self) -> Result<(), UsbError>;
    async fn close(&self) -> Result<(), UsbError>;
    async fn select_configuration(&self, value: u8) -> Result<(), UsbError>;
    async fn claim_interface(&self, number: u8) -> Result<(), UsbError>;
    async fn release_interface(&self, number: u8) -> Result<(), UsbError>;
    async fn select_alternate(&self, interface: u8, setting: u8) -> Result<(), UsbError>;
    async fn clear_halt(&self, direction: Direction, endpoint: u8) -> Result<(), UsbError>;

    /// Read up to `length` bytes from an IN endpoint.
    async fn transfer_in(&self, endpoint: u8, length: usize) -> Result<Vec<u8>, UsbError>;

    /// Write `data` to an OUT endpoint. An empty `data` is a
    /// zero-length packet.
    async fn transfer_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, UsbError>;

    /// Resolves when the device disappears from the bus. Used only to
    /// trigger a disconnect; the default never resolves.
    async fn wait_disconnected(&self) {
        std::future::pending::<()>().await
    }
}

/// Where the ADB function lives on a device: configuration value,
/// interface number, alternate setting, and the two bulk endpoints.
struct AdbInterface {
    configuration: u8,
    interface: u8,
    alternate: u8,
    ep_in: EndpointInfo,
    ep_out: EndpointInfo,
}

fn find_adb_interface(configurations: &[ConfigurationInfo]) -> Option<AdbInterface> {
    for config in configurations {
        for interface in &config.interfaces {
            for alt in &interface.alternates {
                if alt.class != ADB_CLASS || alt.subclass != ADB_SUBCLASS || alt.protocol != ADB_PROTOCOL {
                    continue;
                }
                let bulk = |dir: Direction| {
                    alt.endpoints
                        .iter()
                        .find(|e| e.kind == EndpointKind::Bulk && e.direction == dir)
                        .cloned()
                };
                let (Some(ep_in), Some(ep_out)) = (bulk(Direction::In), bulk(Direction::Out)) else {
                    continue;
                };
                return Some(AdbInterface {
                    configuration: config.value,
                    interface: interface.number,
                    alternate: alt.setting,
                    ep_in,
                    ep_out,
                });
            }
        }
    }
    None
}

/// Packet-oriented duplex over the claimed ADB interface.
///
/// Sending a packet is atomic: the header and payload transfers of one
/// packet are never interleaved with another packet's transfers.
pub struct Transport {
    device: Box<dyn UsbDevice>,
    interface: u8,
    ep_in: u8,
    ep_out: u8,
    in_packet_size: usize,
    out_packet_size: usize,
    /// Inbound payloads larger than this are treated as corrupt frames.
    max_inbound: usize,
    send_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("interface", &self.interface)
            .field("ep_in", &self.ep_in)
            .field("ep_out", &self.ep_out)
            .field("in_packet_size", &self.in_packet_size)
            .field("out_packet_size", &self.out_packet_size)
            .field("max_inbound", &self.max_inbound)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Locate and claim the ADB interface on `device`.
    ///
    /// Steps, in order: open the device; find the unique alternate with
    /// class 0xff / subclass 0x42 / protocol 0x01 and one bulk endpoint
    /// in each direction; select its configuration if not already
    /// active; claim the interface; select the alternate (with a settle
    /// pause) if it is not the default; and finally clear-halt both
    /// endpoints, ignoring errors.
    pub async fn claim(device: Box<dyn UsbDevice>, max_inbound: usize) -> Result<Self, AdbError> {
        device.open().await.map_err(open_error)?;

        let Some(adb) = find_adb_interface(&device.configurations()) else {
            let _ = device.close().await;
            return Err(AdbError::NoAdbInterface);
        };

        let claimed = async {
            if device.active_configuration() != Some(adb.configuration) {
                device
                    .select_configuration(adb.configuration)
                    .await
                    .map_err(control_error)?;
            }

            device.claim_interface(adb.interface).await.map_err(claim_error)?;

            if adb.alternate != 0 {
                device
                    .select_alternate(adb.interface, adb.alternate)
                    .await
                    .map_err(control_error)?;
                tokio::time::sleep(ALT_SETTLE).await;
            }
            Ok(())
        }
        .await;

        if let Err(e) = claimed {
            let _ = device.close().await;
            return Err(e);
        }

        // Best effort; some stacks reject clear-halt on a fresh claim.
        let _ = device.clear_halt(Direction::In, adb.ep_in.number).await;
        let _ = device.clear_halt(Direction::Out, adb.ep_out.number).await;

        debug!(
            "claimed ADB interface {} (alt {}), ep_in {:#x}/{} ep_out {:#x}/{}",
            adb.interface,
            adb.alternate,
            adb.ep_in.number,
            adb.ep_in.packet_size,
            adb.ep_out.number,
            adb.ep_out.packet_size
        );

        Ok(Self {
            device,
            interface: adb.interface,
            ep_in: adb.ep_in.number,
            ep_out: adb.ep_out.number,
            in_packet_size: adb.ep_in.packet_size.max(HEADER_LEN),
            out_packet_size: adb.ep_out.packet_size,
            max_inbound,
            send_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Send one packet: header transfer, then payload transfer, each
    /// followed by a zero-length packet when its length is a positive
    /// multiple of the OUT endpoint's packet size. On a transient
    /// failure the OUT endpoint is cleared and the whole packet is
    /// retried once.
    pub async fn send_packet(&self, packet: &Packet, max_payload: usize) -> Result<(), AdbError> {
        let header = packet.encode_header(max_payload)?;
        let _guard = self.send_lock.lock().await;

        match self.write_frames(&header, &packet.payload).await {
            Ok(()) => Ok(()),
            Err(UsbError::NotFound) => Err(AdbError::Disconnected),
            Err(e) => {
                warn!("outbound transfer failed ({e}), clearing OUT endpoint and retrying");
                let _ = self.device.clear_halt(Direction::Out, self.ep_out).await;
                match self.write_frames(&header, &packet.payload).await {
                    Ok(()) => Ok(()),
                    Err(UsbError::NotFound) => Err(AdbError::Disconnected),
                    Err(e) => Err(AdbError::TransportTransient(e.to_string())),
                }
            }
        }
    }

    async fn write_frames(&self, header: &[u8], payload: &[u8]) -> Result<(), UsbError> {
        self.write_with_terminator(header).await?;
        if !payload.is_empty() {
            self.write_with_terminator(payload).await?;
        }
        Ok(())
    }

    /// The ZLP rule: a transfer whose length is a positive exact
    /// multiple of the endpoint packet size must be followed by an
    /// empty transfer, or the device waits for more data forever.
    async fn write_with_terminator(&self, data: &[u8]) -> Result<(), UsbError> {
        self.device.transfer_out(self.ep_out, data).await?;
        if !data.is_empty() && data.len() % self.out_packet_size == 0 {
            self.device.transfer_out(self.ep_out, &[]).await?;
        }
        Ok(())
    }

    /// Receive the next valid packet.
    ///
    /// Header reads request the IN endpoint's packet size; a read that
    /// is not exactly 24 bytes, fails the magic check, or declares an
    /// absurd payload length is dropped and the read restarted. The
    /// payload is then read to the declared length.
    pub async fn recv_packet(&self) -> Result<Packet, AdbError> {
        loop {
            let bytes = self
                .device
                .transfer_in(self.ep_in, self.in_packet_size)
                .await
                .map_err(transfer_error)?;

            if bytes.len() != HEADER_LEN {
                debug!("dropping {}-byte read while expecting a header", bytes.len());
                continue;
            }
            let Some(header) = Header::decode(&bytes) else {
                debug!("dropping frame with bad magic");
                continue;
            };
            if header.payload_len as usize > self.max_inbound {
                debug!("dropping frame declaring {} payload bytes", header.payload_len);
                continue;
            }

            let payload = self.read_payload(header.payload_len as usize).await?;
            return Ok(Packet::new(header.command, header.arg0, header.arg1, payload));
        }
    }

    async fn read_payload(&self, len: usize) -> Result<Vec<u8>, AdbError> {
        let mut payload = Vec::with_capacity(len);
        while payload.len() < len {
            let chunk = self
                .device
                .transfer_in(self.ep_in, len - payload.len())
                .await
                .map_err(transfer_error)?;
            if chunk.is_empty() {
                return Err(AdbError::TransportTransient("empty read inside a payload".into()));
            }
            payload.extend_from_slice(&chunk);
        }
        payload.truncate(len);
        Ok(payload)
    }

    /// Resolves when the device disappears from the bus.
    pub async fn wait_disconnected(&self) {
        self.device.wait_disconnected().await;
    }

    /// Release the interface and close the device, swallowing errors.
    pub async fn release(&self) {
        if let Err(e) = self.device.release_interface(self.interface).await {
            debug!("release_interface failed: {e}");
        }
        if let Err(e) = self.device.close().await {
            debug!("device close failed: {e}");
        }
    }
}

fn transfer_error(e: UsbError) -> AdbError {
    match e {
        UsbError::NotFound => AdbError::Disconnected,
        other => AdbError::TransportTransient(other.to_string()),
    }
}

fn claim_error(e: UsbError) -> AdbError {
    match e {
        UsbError::Busy => AdbError::Busy,
        UsbError::NotFound => AdbError::Disconnected,
        other => AdbError::Internal(format!("claim failed: {other}")),
    }
}

fn control_error(e: UsbError) -> AdbError {
    match e {
        UsbError::NotFound => AdbError::Disconnected,
        other => AdbError::Internal(format!("device setup failed: {other}")),
    }
}

fn open_error(e: UsbError) -> AdbError {
    match e {
        UsbError::Busy => AdbError::Busy,
        UsbError::NotFound => AdbError::Disconnected,
        other => AdbError::Internal(format!("device open failed: {other}")),
    }
}
