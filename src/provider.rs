//! Sources of tunneled device connections
//!
//! A provider knows how to open a byte stream to an arbitrary TCP port on
//! one particular device and where that device's pair record lives.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::{
    pairing_file::PairingFile, usbmuxd::UsbmuxdAddr, DeviceConnection, MobiledeviceError,
};

pub trait DeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    // https://blog.rust-lang.org/2023/12/21/async-fn-rpit-in-traits.html#is-it-okay-to-use-async-fn-in-traits-what-are-the-limitations
    fn connect(
        &self,
        port: u16,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<DeviceConnection, MobiledeviceError>> + Send + '_>,
    >;
    fn label(&self) -> &str;
    fn udid(&self) -> &str;
    fn get_pairing_file(
        &self,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<PairingFile, MobiledeviceError>> + Send + '_>,
    >;
    /// Whether the device is still attached, as far as this transport can tell
    ///
    /// Transports without an attachment oracle report `true`; only a
    /// verified detach may report `false`.
    fn is_device_connected(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, MobiledeviceError>> + Send + '_>>
    {
        Box::pin(async { Ok(true) })
    }
}

/// Connects straight to an IP-reachable device (RSD tunnel, Wi-Fi)
#[derive(Debug)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub pairing_file: PairingFile,
    pub label: String,
    pub udid: String,
}

impl DeviceProvider for TcpProvider {
    fn connect(
        &self,
        port: u16,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<DeviceConnection, MobiledeviceError>> + Send + '_>,
    > {
        Box::pin(async move {
            let socket_addr = SocketAddr::new(self.addr, port);
            let stream = TcpStream::connect(socket_addr).await?;
            Ok(DeviceConnection::new(Box::new(stream), self.label.clone()))
        })
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }

    fn udid(&self) -> &str {
        self.udid.as_str()
    }

    fn get_pairing_file(
        &self,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<PairingFile, MobiledeviceError>> + Send + '_>,
    > {
        Box::pin(async move { Ok(self.pairing_file.clone()) })
    }
}

/// Tunnels through the local muxer to one attached device
#[derive(Debug)]
pub struct UsbmuxdProvider {
    pub(crate) addr: UsbmuxdAddr,
    pub(crate) tag: u32,
    pub(crate) udid: String,
    pub(crate) device_id: u32,
    pub(crate) label: String,
}

impl DeviceProvider for UsbmuxdProvider {
    fn connect(
        &self,
        port: u16,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<DeviceConnection, MobiledeviceError>> + Send + '_>,
    > {
        Box::pin(async move {
            let usbmuxd = self.addr.connect(self.tag).await?;
            usbmuxd
                .connect_to_device(self.device_id, port, &*self.label)
                .await
        })
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }

    fn udid(&self) -> &str {
        self.udid.as_str()
    }

    fn get_pairing_file(
        &self,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<PairingFile, MobiledeviceError>> + Send + '_>,
    > {
        Box::pin(async move {
            let mut usbmuxd = self.addr.connect(self.tag).await?;
            usbmuxd.get_pair_record(&self.udid).await
        })
    }

    fn is_device_connected(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, MobiledeviceError>> + Send + '_>>
    {
        Box::pin(async move {
            let mut usbmuxd = self.addr.connect(self.tag).await?;
            usbmuxd.is_device_connected(&self.udid).await
        })
    }
}

impl UsbmuxdProvider {
    /// The muxer connection this provider tunnels through
    pub fn muxer(&self) -> &UsbmuxdAddr {
        &self.addr
    }
}
