//! Host-side ADB (Android Debug Bridge) client over a USB bulk
//! endpoint pair.
//!
//! The crate speaks the ADB wire protocol directly: the 24-byte
//! little-endian packet framing, the RSA authentication handshake with
//! Android's own public-key encoding, and a concurrent stream
//! multiplexer that shares one ordered USB channel between any number
//! of logical streams.
//!
//! Two collaborators are left to the caller: a [`UsbDevice`] (the
//! already-picked USB device; WebUSB, libusb, whatever the host
//! offers) and a [`KeyStore`] that persists the host key pair between
//! runs.
//!
//! # Example
//!
//! ```no_run
//! use usbadb::{Adb, MemoryKeyStore, UsbDevice};
//!
//! async fn demo(device: Box<dyn UsbDevice>) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut adb = Adb::new(Box::new(MemoryKeyStore::new()));
//!
//!     let identity = adb.connect(device).await?;
//!     println!("connected to {} ({})", identity.serial, identity.model);
//!
//!     let output = adb.run_shell("echo hi").await?;
//!     println!("{output}");
//!
//!     for package in adb.list_packages().await? {
//!         println!("{package}");
//!     }
//!
//!     adb.disconnect().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod auth;
pub mod client;
pub mod diagnostics;
pub mod parsers;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;

// Re-export main types
pub use auth::{AdbKeyPair, KeyStore, MemoryKeyStore};
pub use client::{Adb, ErrorReport};
pub use diagnostics::{Diagnostics, PacketDirection, PacketRecord};
pub use protocol::{AdbError, AuthType, Command, Packet};
pub use session::{Config, ConnectFailure, DeviceIdentity, Session};
pub use stream::Stream;
pub use transport::{
    AlternateInfo, ConfigurationInfo, Direction, EndpointInfo, EndpointKind, InterfaceInfo,
    UsbDevice, UsbError,
};
