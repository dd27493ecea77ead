//! Client library for the service family exposed by Apple mobile devices.
//!
//! Talks to the local usbmuxd multiplexer to enumerate devices and open
//! tunneled TCP streams, negotiates lockdown sessions (pairing, TLS, value
//! queries, service activation), and drives the mobilebackup2 DeviceLink
//! exchange to produce iTunes-compatible backups on disk.

#![warn(missing_debug_implementations)]

pub mod afc;
pub mod backup;
mod ca;
pub mod devicelink;
pub mod installation_proxy;
pub mod lockdown;
pub mod notification_proxy;
pub mod pairing_file;
pub mod provider;
pub mod springboardservices;
pub mod usbmuxd;

pub use backup::{BackupClient, BackupEvent, BackupOptions, BackupOutcome};
pub use lockdown::LockdownClient;
pub use usbmuxd::{UsbmuxdAddr, UsbmuxdConnection, UsbmuxdDevice};

use std::io;

use log::{debug, warn};
use provider::DeviceProvider;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream and UnixStream implement this trait, as do the TLS
/// streams a session upgrade produces.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed device connection sockets
pub type DeviceSocket = Box<dyn ReadWrite>;

/// Interface for services that can be activated through lockdown
///
/// Implement this trait to define new services that can be accessed through
/// the device connection protocol.
pub trait DeviceService: Sized {
    /// Returns the service name as advertised by the device
    fn service_name() -> std::borrow::Cow<'static, str>;

    /// Whether service activation must present the pair record's escrow bag
    fn escrowed() -> bool {
        false
    }

    /// Establishes a connection to this service
    ///
    /// Negotiates a lockdown session, asks lockdownd to start the service,
    /// opens a fresh tunneled stream to the returned port and upgrades it to
    /// TLS when the device asks for it.
    #[allow(async_fn_in_trait)]
    async fn connect(provider: &dyn DeviceProvider) -> Result<Self, MobiledeviceError> {
        let pairing_file = provider.get_pairing_file().await?;

        let mut lockdown = LockdownClient::connect(provider).await?;
        lockdown.start_session(&pairing_file).await?;

        let name = Self::service_name();
        let escrow = if Self::escrowed() {
            pairing_file.escrow_bag.as_deref()
        } else {
            None
        };
        let (port, ssl) = lockdown
            .start_service(name.clone(), escrow)
            .await
            .map_err(|e| MobiledeviceError::ServiceStartFailed {
                service: name.to_string(),
                source: Box::new(e),
            })?;

        let mut connection = provider.connect(port).await?;
        if ssl {
            connection.start_session(&pairing_file).await?;
        }

        Self::from_stream(connection).await
    }

    #[allow(async_fn_in_trait)]
    async fn from_stream(connection: DeviceConnection) -> Result<Self, MobiledeviceError>;
}

/// One byte stream to the device
///
/// Wraps a tunneled socket and provides the length-prefixed plist framing
/// spoken by lockdown and the plist-oriented services, raw reads and writes
/// for the byte-oriented ones, and the in-place TLS upgrade.
#[derive(Debug)]
pub struct DeviceConnection {
    /// The underlying connection socket, boxed for dynamic dispatch
    pub(crate) socket: Option<DeviceSocket>,
    /// Unique label identifying this connection to the device
    pub(crate) label: String,
}

impl DeviceConnection {
    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Unique identifier for this connection
    pub fn new(socket: DeviceSocket, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn into_socket(self) -> Option<DeviceSocket> {
        self.socket
    }

    /// Sends one property tree, framed as a big-endian length and a binary plist
    ///
    /// # Errors
    /// Returns `MobiledeviceError` if serialization or transmission fails
    pub(crate) async fn send_plist(
        &mut self,
        message: plist::Value,
    ) -> Result<(), MobiledeviceError> {
        let Some(socket) = &mut self.socket else {
            return Err(MobiledeviceError::NoEstablishedConnection);
        };

        let mut buf = Vec::new();
        plist::to_writer_binary(&mut buf, &message)?;
        let len = buf.len() as u32;
        socket.write_all(&len.to_be_bytes()).await?;
        socket.write_all(&buf).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Sends raw binary data to the device
    pub(crate) async fn send_raw(&mut self, message: &[u8]) -> Result<(), MobiledeviceError> {
        let Some(socket) = &mut self.socket else {
            return Err(MobiledeviceError::NoEstablishedConnection);
        };
        socket.write_all(message).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes from the device
    pub(crate) async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, MobiledeviceError> {
        let Some(socket) = &mut self.socket else {
            return Err(MobiledeviceError::NoEstablishedConnection);
        };
        let mut buf = vec![0; len];
        socket.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads one framed plist from the device without interpreting it
    pub(crate) async fn read_plist_value(&mut self) -> Result<plist::Value, MobiledeviceError> {
        let Some(socket) = &mut self.socket else {
            return Err(MobiledeviceError::NoEstablishedConnection);
        };
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        let mut buf = vec![0; len as usize];
        socket.read_exact(&mut buf).await?;
        let res: plist::Value = plist::from_bytes(&buf)?;
        Ok(res)
    }

    /// Reads a plist-formatted message from the device
    ///
    /// # Errors
    /// Returns `MobiledeviceError` if reading or parsing fails, or the device
    /// reports an error in the reply
    pub(crate) async fn read_plist(&mut self) -> Result<plist::Dictionary, MobiledeviceError> {
        let res = self.read_plist_value().await?;
        let res: plist::Dictionary = plist::from_value(&res)?;
        debug!("Received plist with {} entries", res.len());

        if let Some(e) = res.get("Error") {
            let e = match e {
                plist::Value::String(e) => e.to_string(),
                _ => {
                    warn!("Device error is not a string: {e:?}");
                    return Err(MobiledeviceError::UnexpectedResponse);
                }
            };
            return match MobiledeviceError::from_device_error_type(e.as_str()) {
                Some(e) => Err(e),
                None => Err(MobiledeviceError::UnknownErrorType(e)),
            };
        }
        Ok(res)
    }

    /// Upgrades the connection to TLS using device pairing credentials
    ///
    /// TLS 1.2 is pinned. The pair record's host certificate and key are the
    /// client identity; the presented leaf must match the pair record's
    /// device certificate, which is the sole trust anchor.
    ///
    /// # Errors
    /// Returns `MobiledeviceError` if the handshake fails or credentials are invalid
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), MobiledeviceError> {
        let mut connector = openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls())?;
        connector.set_min_proto_version(Some(openssl::ssl::SslVersion::TLS1_2))?;
        connector.set_max_proto_version(Some(openssl::ssl::SslVersion::TLS1_2))?;

        connector.set_certificate(&pairing_file.host_certificate)?;
        connector.set_private_key(&pairing_file.host_private_key)?;

        let pinned = pairing_file.device_certificate.to_der()?;
        connector.set_verify_callback(openssl::ssl::SslVerifyMode::PEER, move |_, ctx| {
            ctx.current_cert()
                .and_then(|cert| cert.to_der().ok())
                .map(|der| der == pinned)
                .unwrap_or(false)
        });

        let mut config = connector.build().configure()?;
        config.set_verify_hostname(false);
        let ssl = config.into_ssl("Device")?;

        let socket = match self.socket.take() {
            Some(s) => s,
            None => return Err(MobiledeviceError::NoEstablishedConnection),
        };
        let mut stream = tokio_openssl::SslStream::new(ssl, socket)?;
        std::pin::Pin::new(&mut stream).connect().await?;
        self.socket = Some(Box::new(stream));

        Ok(())
    }
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MobiledeviceError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("TLS upgrade failed")]
    TlsUpgradeFailed(#[from] openssl::ssl::Error),
    #[error("TLS setup failed")]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("port 62078 did not identify as lockdown")]
    NotLockdown,
    #[error("device has no pairing record")]
    NotPaired,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not recognize this host")]
    InvalidHostId,
    #[error("pairing trust dialog pending")]
    PairingDialogResponsePending,
    #[error("user denied pairing trust")]
    UserDeniedPairing,
    #[error("device must be unlocked before pairing")]
    PairingRequiresPassword,
    #[error("value is deprecated in this device version")]
    Deprecated,
    #[error("value not present on device")]
    NotFound,
    #[error("device not found")]
    DeviceNotFound,
    #[error("device disconnected")]
    DeviceDisconnected,
    #[error("device is locked")]
    DeviceLocked,
    #[error("operation denied by device policy")]
    PolicyDenied,
    #[error("device passcode must be set before backup")]
    PasscodeRequired,
    #[error("failed to start service {service}")]
    ServiceStartFailed {
        service: String,
        #[source]
        source: Box<MobiledeviceError>,
    },
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("muxer rejected the command")]
    MuxerBadCommand,
    #[error("muxer does not know this device")]
    MuxerBadDevice,
    #[error("device refused the connection")]
    MuxerConnectionRefused,
    #[error("muxer version mismatch")]
    MuxerBadVersion,
    #[error("afc error: {0}")]
    Afc(#[from] afc::errors::AfcError),
    #[error("unknown afc opcode")]
    UnknownAfcOpcode,
    #[error("invalid afc magic")]
    InvalidAfcMagic,
    #[error("missing file attribute")]
    AfcMissingAttribute,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),
}

impl MobiledeviceError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Returns
    /// Some(MobiledeviceError) if the string maps to a known error type, None otherwise
    fn from_device_error_type(e: &str) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostId),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            "MissingValue" => Some(Self::NotFound),
            "PairingDialogResponsePending" => Some(Self::PairingDialogResponsePending),
            "UserDeniedPairing" => Some(Self::UserDeniedPairing),
            "PasswordProtected" => Some(Self::PairingRequiresPassword),
            "DeprecatedInThisVersion" => Some(Self::Deprecated),
            _ => None,
        }
    }
}
