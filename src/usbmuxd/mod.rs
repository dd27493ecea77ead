//! Client for the local USB multiplexer daemon
//!
//! usbmuxd tunnels TCP connections to attached iOS devices over a unix
//! socket (`/var/run/usbmuxd`) or, on Windows, a loopback TCP port. This
//! module enumerates devices, reads and writes pair records, opens tunneled
//! streams to a device port and delivers attach/detach events.

use std::{
    net::{AddrParseError, IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::SocketAddrV4;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::{
    pairing_file::PairingFile, provider::UsbmuxdProvider, DeviceConnection, DeviceSocket,
    MobiledeviceError,
};

mod des;
mod raw_packet;

use raw_packet::RawPacket;

#[derive(Debug, Clone)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device currently known to the muxer
///
/// Valid for the lifetime of a single attach; a detach event invalidates it.
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    pub udid: String,
    pub device_id: u32,
    pub interface_index: Option<u32>,
}

/// Asynchronous device event delivered in listen mode
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Attached(UsbmuxdDevice),
    Detached(u32),
    Paired(u32),
}

#[derive(Clone, Debug)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    pub async fn to_socket(&self) -> Result<DeviceSocket, MobiledeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, MobiledeviceError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Reads `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                #[cfg(unix)]
                if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
                #[cfg(not(unix))]
                Self::TcpSocket(SocketAddr::from_str(&var)?)
            }
            Err(_) => Self::default(),
        })
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// One connection to the muxer
///
/// Requests are strictly sequential on a connection; every request carries a
/// fresh tag and the reply must echo it. Listen mode turns the connection
/// into an event source.
#[derive(Debug)]
pub struct UsbmuxdConnection {
    socket: DeviceSocket,
    tag: u32,
}

/// Handle for an active listen subscription
///
/// Dropping the handle (or calling [`DeviceEventSubscription::unsubscribe`])
/// closes the muxer socket and ends the receive loop.
#[derive(Debug)]
pub struct DeviceEventSubscription {
    events: mpsc::UnboundedReceiver<Result<DeviceEvent, MobiledeviceError>>,
    task: tokio::task::JoinHandle<()>,
}

impl DeviceEventSubscription {
    /// Waits for the next device event
    ///
    /// Returns `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Result<DeviceEvent, MobiledeviceError>> {
        self.events.recv().await
    }

    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for DeviceEventSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl UsbmuxdConnection {
    pub const BINARY_PLIST_VERSION: u32 = 0;
    pub const XML_PLIST_VERSION: u32 = 1;

    pub const RESULT_MESSAGE_TYPE: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    pub async fn default() -> Result<Self, MobiledeviceError> {
        let socket = UsbmuxdAddr::default().to_socket().await?;
        Ok(Self::new(socket, 0))
    }

    pub fn new(socket: DeviceSocket, tag: u32) -> Self {
        Self { socket, tag }
    }

    /// Asks the muxer for all currently attached devices
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), "mobiledevice-rs".into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;
        let res = self.read_reply().await?;
        let res = plist::to_value(&res)?;
        let res = plist::from_value::<des::ListDevicesResponse>(&res)?;

        let mut devs = Vec::new();
        for dev in res.device_list {
            devs.push(Self::parse_device(dev.device_id, dev.properties)?);
        }
        Ok(devs)
    }

    fn parse_device(
        device_id: u32,
        properties: des::DeviceProperties,
    ) -> Result<UsbmuxdDevice, MobiledeviceError> {
        let connection_type = match properties.connection_type.as_str() {
            "Network" => {
                let Some(addr) = properties.network_address else {
                    warn!("Device is network attached, but has no network info");
                    return Err(MobiledeviceError::UnexpectedResponse);
                };
                let addr: Vec<u8> = addr.into();
                if addr.len() < 8 {
                    warn!("Device address bytes len < 8");
                    return Err(MobiledeviceError::UnexpectedResponse);
                }

                // The address is a raw sockaddr; the family byte sits at
                // offset 1, except on Windows where it is at offset 0
                #[cfg(windows)]
                let family = addr[0];
                #[cfg(not(windows))]
                let family = addr[1];

                match family {
                    0x02 => Connection::Network(IpAddr::V4(Ipv4Addr::new(
                        addr[4], addr[5], addr[6], addr[7],
                    ))),
                    0x1E => {
                        if addr.len() < 24 {
                            warn!("IPv6 address is less than 24 bytes");
                            return Err(MobiledeviceError::UnexpectedResponse);
                        }
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(&addr[8..24]);
                        Connection::Network(IpAddr::V6(Ipv6Addr::from(octets)))
                    }
                    family => {
                        warn!("Unknown address family: {family:02X}");
                        Connection::Unknown(format!("Network {family:02X}"))
                    }
                }
            }
            "USB" => Connection::Usb,
            _ => Connection::Unknown(properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: properties.serial_number,
            device_id,
            interface_index: properties.interface_index,
        })
    }

    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, MobiledeviceError> {
        let devices = self.get_devices().await?;
        match devices.into_iter().find(|x| x.udid == udid) {
            Some(d) => Ok(d),
            None => Err(MobiledeviceError::DeviceNotFound),
        }
    }

    /// Checks whether a device with this UDID is still attached
    pub async fn is_device_connected(&mut self, udid: &str) -> Result<bool, MobiledeviceError> {
        Ok(self.get_devices().await?.iter().any(|d| d.udid == udid))
    }

    /// Reads the pair record the muxer keeps for this device
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, MobiledeviceError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_reply().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairingFile::from_bytes(d),
            _ => match Self::result_number(&res) {
                Some(_) => Err(MobiledeviceError::NotPaired),
                None => Err(MobiledeviceError::UnexpectedResponse),
            },
        }
    }

    /// Persists a freshly created pair record in the muxer's store
    pub async fn save_pair_record(
        &mut self,
        udid: &str,
        device_id: Option<u32>,
        record: &PairingFile,
    ) -> Result<(), MobiledeviceError> {
        let data = record.serialize()?;
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "SavePairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        req.insert("PairRecordData".into(), plist::Value::Data(data));
        if let Some(id) = device_id {
            req.insert("DeviceID".into(), id.into());
        }
        self.write_plist(req).await?;
        let res = self.read_reply().await?;
        match Self::result_number(&res) {
            Some(0) => Ok(()),
            _ => Err(MobiledeviceError::UnexpectedResponse),
        }
    }

    /// Removes the muxer's pair record for this device
    pub async fn delete_pair_record(&mut self, udid: &str) -> Result<(), MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "DeletePairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_reply().await?;
        match Self::result_number(&res) {
            Some(0) => Ok(()),
            _ => Err(MobiledeviceError::UnexpectedResponse),
        }
    }

    pub async fn get_buid(&mut self) -> Result<String, MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        self.write_plist(req).await?;
        let mut res = self.read_reply().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(MobiledeviceError::UnexpectedResponse),
        }
    }

    /// Opens a tunneled stream to a TCP port on the device
    ///
    /// On success the muxer socket stops speaking the muxer protocol and
    /// becomes an opaque byte stream to the device port.
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<DeviceConnection, MobiledeviceError> {
        debug!("Connecting to device {device_id} on port {port}");
        let port = port.to_be();

        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.into());
        self.write_plist(req).await?;
        match Self::result_number(&self.read_reply().await?) {
            Some(0) => Ok(DeviceConnection::new(self.socket, label)),
            Some(1) => Err(MobiledeviceError::MuxerBadCommand),
            Some(2) => Err(MobiledeviceError::MuxerBadDevice),
            Some(3) => Err(MobiledeviceError::MuxerConnectionRefused),
            Some(6) => Err(MobiledeviceError::MuxerBadVersion),
            _ => Err(MobiledeviceError::UnexpectedResponse),
        }
    }

    /// Subscribes to attach/detach/paired events
    ///
    /// Consumes the connection; events arrive on the returned handle until
    /// it is dropped or the socket fails.
    pub async fn listen(mut self) -> Result<DeviceEventSubscription, MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Listen".into());
        req.insert("ClientVersionString".into(), "mobiledevice-rs".into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;
        match Self::result_number(&self.read_reply().await?) {
            Some(0) => {}
            _ => return Err(MobiledeviceError::UnexpectedResponse),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                let event = match self.read_event().await {
                    Ok(e) => e,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                };
                if let Some(event) = event {
                    if tx.send(Ok(event)).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(DeviceEventSubscription { events: rx, task })
    }

    async fn read_event(&mut self) -> Result<Option<DeviceEvent>, MobiledeviceError> {
        let (tag, res) = self.read_packet().await?;
        // Events are delivered with tag 0; some daemons echo the
        // subscriber's tag instead.
        if tag != 0 && tag != self.tag {
            return Err(MobiledeviceError::ProtocolViolation(format!(
                "listen event with unexpected tag {tag}"
            )));
        }

        let event: des::ListenEvent = plist::from_value(&plist::to_value(&res)?)?;
        match event.message_type.as_str() {
            "Attached" => {
                let (Some(device_id), Some(properties)) = (event.device_id, event.properties)
                else {
                    return Err(MobiledeviceError::UnexpectedResponse);
                };
                Ok(Some(DeviceEvent::Attached(Self::parse_device(
                    device_id, properties,
                )?)))
            }
            "Detached" => match event.device_id {
                Some(id) => Ok(Some(DeviceEvent::Detached(id))),
                None => Err(MobiledeviceError::UnexpectedResponse),
            },
            "Paired" => match event.device_id {
                Some(id) => Ok(Some(DeviceEvent::Paired(id))),
                None => Err(MobiledeviceError::UnexpectedResponse),
            },
            other => {
                warn!("Ignoring unknown listen message: {other}");
                Ok(None)
            }
        }
    }

    fn result_number(res: &plist::Dictionary) -> Option<u64> {
        res.get("Number").and_then(|n| n.as_unsigned_integer())
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), MobiledeviceError> {
        self.tag = self.tag.wrapping_add(1);
        let raw = RawPacket::new(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        );
        self.socket.write_all(&raw.serialize()?).await?;
        Ok(())
    }

    /// Reads one muxer frame, returning its tag and decoded payload
    async fn read_packet(&mut self) -> Result<(u32, plist::Dictionary), MobiledeviceError> {
        let mut header_buffer = [0; 16];
        self.socket.read_exact(&mut header_buffer).await?;

        // We are safe to unwrap as it only panics if the buffer isn't 4
        let packet_size = u32::from_le_bytes(header_buffer[..4].try_into().unwrap());
        if packet_size < RawPacket::HEADER_SIZE {
            return Err(MobiledeviceError::ProtocolViolation(format!(
                "muxer header claims total length {packet_size}"
            )));
        }
        let tag = u32::from_le_bytes(header_buffer[12..16].try_into().unwrap());

        let packet_size = packet_size - RawPacket::HEADER_SIZE;
        debug!("Reading {packet_size} bytes from muxer");

        let mut body_buffer = vec![0; packet_size as usize];
        self.socket.read_exact(&mut body_buffer).await?;

        let res = plist::from_bytes(&body_buffer)?;
        Ok((tag, res))
    }

    /// Reads the reply to the request just sent, enforcing tag correlation
    async fn read_reply(&mut self) -> Result<plist::Dictionary, MobiledeviceError> {
        let (tag, res) = self.read_packet().await?;
        if tag != self.tag {
            return Err(MobiledeviceError::ProtocolViolation(format!(
                "reply tag {tag} does not match request tag {}",
                self.tag
            )));
        }
        Ok(res)
    }
}

impl UsbmuxdDevice {
    pub fn to_provider(
        &self,
        addr: UsbmuxdAddr,
        tag: u32,
        label: impl Into<String>,
    ) -> UsbmuxdProvider {
        let label = label.into();

        UsbmuxdProvider {
            addr,
            tag,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(dict: &plist::Dictionary, tag: u32) -> Vec<u8> {
        let packet = RawPacket::new(dict.clone(), 1, 8, tag);
        packet.serialize().unwrap()
    }

    async fn respond<S: tokio::io::AsyncWrite + Unpin>(server: &mut S, dict: &plist::Dictionary, tag: u32) {
        server.write_all(&frame(dict, tag)).await.unwrap();
    }

    #[tokio::test]
    async fn empty_device_list_enumerates_to_nothing() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 0);

        let mut reply = plist::Dictionary::new();
        reply.insert("DeviceList".into(), plist::Value::Array(Vec::new()));
        // The request carries tag 1
        respond(&mut server, &reply, 1).await;

        let devices = conn.get_devices().await.unwrap();
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn mismatched_reply_tag_is_a_protocol_violation() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 0);

        let mut reply = plist::Dictionary::new();
        reply.insert("BUID".into(), "buid".into());
        respond(&mut server, &reply, 99).await;

        match conn.get_buid().await {
            Err(MobiledeviceError::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_header_is_fatal() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 0);

        let mut header = Vec::new();
        header.extend_from_slice(&8u32.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&8u32.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        server.write_all(&header).await.unwrap();

        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        conn.write_plist(req).await.unwrap();
        match conn.read_reply().await {
            Err(MobiledeviceError::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_failure_codes_map_to_errors() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let conn = UsbmuxdConnection::new(Box::new(client), 0);

        let mut reply = plist::Dictionary::new();
        reply.insert("MessageType".into(), "Result".into());
        reply.insert("Number".into(), 3.into());
        respond(&mut server, &reply, 1).await;

        match conn.connect_to_device(7, 62078, "test").await {
            Err(MobiledeviceError::MuxerConnectionRefused) => {}
            other => panic!("expected MuxerConnectionRefused, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn attached_event_parses_device() {
        let mut properties = plist::Dictionary::new();
        properties.insert("ConnectionType".into(), "USB".into());
        properties.insert("SerialNumber".into(), "00008101-000A11111111001E".into());

        let mut event = plist::Dictionary::new();
        event.insert("MessageType".into(), "Attached".into());
        event.insert("DeviceID".into(), 3.into());
        event.insert("Properties".into(), plist::Value::Dictionary(properties));

        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 0);
        conn.tag = 1; // pretend Listen was already sent
        respond(&mut server, &event, 0).await;

        match conn.read_event().await.unwrap() {
            Some(DeviceEvent::Attached(dev)) => {
                assert_eq!(dev.device_id, 3);
                assert_eq!(dev.udid, "00008101-000A11111111001E");
                assert!(matches!(dev.connection_type, Connection::Usb));
            }
            other => panic!("expected Attached, got {other:?}"),
        }
    }
}
