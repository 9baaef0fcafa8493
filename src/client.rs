use std::collections::HashMap;

use thiserror::Error;

use crate::auth::{AdbKeyPair, KeyStore};
use crate::diagnostics::Diagnostics;
use crate::parsers;
use crate::protocol::AdbError;
use crate::session::{Config, DeviceIdentity, Session};
use crate::transport::UsbDevice;

/// A surfaced failure: the error itself plus a diagnostics snapshot
/// taken when it happened, so a UI can show the recent packet traffic
/// alongside the message.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ErrorReport {
    pub error: AdbError,
    pub diagnostics: Diagnostics,
}

/// Main ADB client: one device at a time, reconnectable.
///
/// Device selection and key persistence stay outside: the caller hands
/// in an already-picked [`UsbDevice`] and a [`KeyStore`].
pub struct Adb {
    keystore: Box<dyn KeyStore>,
    config: Config,
    session: Option<Session>,
}

impl Adb {
    pub fn new(keystore: Box<dyn KeyStore>) -> Self {
        Self::with_config(keystore, Config::default())
    }

    pub fn with_config(keystore: Box<dyn KeyStore>, config: Config) -> Self {
        Self {
            keystore,
            config,
            session: None,
        }
    }

    /// Connect to `device`: load (or create and persist) the host key,
    /// claim the ADB interface, authenticate, and start the session.
    /// Any previous session is torn down first.
    pub async fn connect(&mut self, device: Box<dyn UsbDevice>) -> Result<DeviceIdentity, ErrorReport> {
        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }

        let key = AdbKeyPair::load_or_generate(self.keystore.as_ref())
            .await
            .map_err(|e| self.report(e))?;

        let session = Session::connect(device, key, self.config.clone())
            .await
            .map_err(|failure| ErrorReport {
                error: failure.error,
                diagnostics: failure.diagnostics,
            })?;

        let identity = session.identity();
        self.session = Some(session);
        Ok(identity)
    }

    /// Tear down the current session, if any.
    pub async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_connected)
    }

    /// The current session, for callers that drive streams directly.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Snapshot of the session state and recent packet traffic.
    pub fn diagnostics(&self) -> Diagnostics {
        self.session
            .as_ref()
            .map(Session::diagnostics)
            .unwrap_or_default()
    }

    /// Run a shell command and return its output as text.
    pub async fn run_shell(&self, command: &str) -> Result<String, ErrorReport> {
        let session = self.current()?;
        let stream = session
            .open(&format!("shell:{command}"))
            .await
            .map_err(|e| self.report(e))?;
        let output = stream.collect(self.config.shell_timeout).await;
        stream.close().await;
        Ok(output)
    }

    /// Installed package ids, sorted.
    pub async fn list_packages(&self) -> Result<Vec<String>, ErrorReport> {
        let output = self.run_shell("pm list packages").await?;
        Ok(parsers::parse_package_list(&output))
    }

    /// Disable a package for the primary user.
    pub async fn disable_package(&self, package: &str) -> Result<String, ErrorReport> {
        self.run_shell(&format!("pm disable-user --user 0 {package}")).await
    }

    /// Re-enable a previously disabled package.
    pub async fn enable_package(&self, package: &str) -> Result<String, ErrorReport> {
        self.run_shell(&format!("pm enable {package}")).await
    }

    /// Uninstall a package for the primary user.
    pub async fn uninstall_package(&self, package: &str) -> Result<String, ErrorReport> {
        self.run_shell(&format!("pm uninstall --user 0 {package}")).await
    }

    /// All system properties, from `getprop`.
    pub async fn device_properties(&self) -> Result<HashMap<String, String>, ErrorReport> {
        let output = self.run_shell("getprop").await?;
        Ok(output
            .lines()
            .filter_map(parsers::parse_property_line)
            .collect())
    }

    /// The last `lines` lines of the device log.
    pub async fn logcat(&self, lines: u32) -> Result<String, ErrorReport> {
        self.run_shell(&format!("logcat -d -t {lines}")).await
    }

    /// Reboot the device. `target` can be `"bootloader"` or
    /// `"recovery"`; anything else is a normal reboot.
    pub async fn reboot(&self, target: Option<&str>) -> Result<(), ErrorReport> {
        let service = match target {
            Some("bootloader") => "reboot:bootloader",
            Some("recovery") => "reboot:recovery",
            _ => "reboot:",
        };
        let session = self.current()?;
        let stream = session.open(service).await.map_err(|e| self.report(e))?;
        stream.close().await;
        Ok(())
    }

    fn current(&self) -> Result<&Session, ErrorReport> {
        match &self.session {
            Some(session) if session.is_connected() => Ok(session),
            _ => Err(self.report(AdbError::Disconnected)),
        }
    }

    fn report(&self, error: AdbError) -> ErrorReport {
        ErrorReport {
            error,
            diagnostics: self.diagnostics(),
        }
    }
}
