//! DeviceLink envelope
//!
//! mobilebackup2 and its siblings wrap every message in a plist array whose
//! first element is a `DLMessage*` tag string. A connection starts with a
//! version exchange and ends with `DLMessageDisconnect`.

use std::time::Duration;

use log::{debug, warn};
use plist::Value;

use crate::{DeviceConnection, MobiledeviceError};

pub const DL_VERSION_EXCHANGE: &str = "DLMessageVersionExchange";
pub const DL_DEVICE_READY: &str = "DLMessageDeviceReady";
pub const DL_PROCESS_MESSAGE: &str = "DLMessageProcessMessage";
pub const DL_STATUS_RESPONSE: &str = "DLMessageStatusResponse";
pub const DL_DISCONNECT: &str = "DLMessageDisconnect";

const EMPTY_PARAMETER: &str = "___EmptyParameterString___";

/// A DeviceLink session over one service connection
pub struct DeviceLinkClient {
    pub connection: DeviceConnection,
    version: (u64, u64),
}

impl std::fmt::Debug for DeviceLinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLinkClient")
            .field("version", &self.version)
            .finish()
    }
}

impl DeviceLinkClient {
    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Wraps a fresh service connection and performs the version exchange
    pub async fn new(connection: DeviceConnection) -> Result<Self, MobiledeviceError> {
        let mut client = Self {
            connection,
            version: (0, 0),
        };
        tokio::time::timeout(Self::HANDSHAKE_TIMEOUT, client.version_exchange())
            .await
            .map_err(|_| {
                MobiledeviceError::ProtocolViolation("DeviceLink handshake timed out".into())
            })??;
        Ok(client)
    }

    /// The version pair the device announced
    pub fn version(&self) -> (u64, u64) {
        self.version
    }

    /// Sequence:
    /// 1) Receive [DLMessageVersionExchange, major, minor]
    /// 2) Send    [DLMessageVersionExchange, "DLVersionsOk", major]
    /// 3) Receive [DLMessageDeviceReady]
    async fn version_exchange(&mut self) -> Result<(), MobiledeviceError> {
        debug!("Starting DeviceLink version exchange");
        let (tag, items) = self.receive_message().await?;
        if tag != DL_VERSION_EXCHANGE {
            warn!("Expected {DL_VERSION_EXCHANGE}, got {tag}");
            return Err(MobiledeviceError::ProtocolViolation(format!(
                "version exchange opened with {tag}"
            )));
        }
        let major = items
            .first()
            .and_then(|v| v.as_unsigned_integer())
            .ok_or_else(|| {
                MobiledeviceError::ProtocolViolation("version exchange without a version".into())
            })?;
        let minor = items
            .get(1)
            .and_then(|v| v.as_unsigned_integer())
            .unwrap_or(0);
        self.version = (major, minor);

        self.send_array(vec![
            Value::String(DL_VERSION_EXCHANGE.into()),
            Value::String("DLVersionsOk".into()),
            Value::Integer(major.into()),
        ])
        .await?;

        let (tag, _) = self.receive_message().await?;
        if tag != DL_DEVICE_READY {
            warn!("Expected {DL_DEVICE_READY}, got {tag}");
            return Err(MobiledeviceError::ProtocolViolation(format!(
                "device answered version exchange with {tag}"
            )));
        }
        debug!("DeviceLink ready, version {major}.{minor}");
        Ok(())
    }

    /// Receives one DL array, returning the tag and the remaining elements
    pub async fn receive_message(
        &mut self,
    ) -> Result<(String, Vec<Value>), MobiledeviceError> {
        let value = self.connection.read_plist_value().await?;
        let Value::Array(mut items) = value else {
            warn!("DeviceLink message is not an array");
            return Err(MobiledeviceError::ProtocolViolation(
                "DeviceLink message is not an array".into(),
            ));
        };
        if items.is_empty() {
            return Err(MobiledeviceError::ProtocolViolation(
                "empty DeviceLink array".into(),
            ));
        }
        let tag = match items.remove(0) {
            Value::String(tag) => tag,
            other => {
                warn!("DeviceLink tag is not a string: {other:?}");
                return Err(MobiledeviceError::ProtocolViolation(
                    "DeviceLink tag is not a string".into(),
                ));
            }
        };
        debug!("Received {tag}");
        Ok((tag, items))
    }

    /// Sends a raw DL array
    pub async fn send_array(&mut self, array: Vec<Value>) -> Result<(), MobiledeviceError> {
        self.connection.send_plist(Value::Array(array)).await
    }

    /// Sends an application payload inside the DLMessageProcessMessage envelope
    pub async fn send_process_message(
        &mut self,
        message: plist::Dictionary,
    ) -> Result<(), MobiledeviceError> {
        self.send_array(vec![
            Value::String(DL_PROCESS_MESSAGE.into()),
            Value::Dictionary(message),
        ])
        .await
    }

    /// Sends a DLMessageStatusResponse array
    pub async fn send_status_response(
        &mut self,
        status_code: i64,
        status_message: Option<&str>,
        status_dict: Option<Value>,
    ) -> Result<(), MobiledeviceError> {
        self.send_array(vec![
            Value::String(DL_STATUS_RESPONSE.into()),
            Value::Integer(status_code.into()),
            Value::String(status_message.unwrap_or(EMPTY_PARAMETER).into()),
            status_dict.unwrap_or_else(|| Value::Dictionary(plist::Dictionary::new())),
        ])
        .await
    }

    /// Signals the end of the session; errors are ignored
    pub async fn disconnect(&mut self) {
        let _ = self
            .send_array(vec![
                Value::String(DL_DISCONNECT.into()),
                Value::String(EMPTY_PARAMETER.into()),
            ])
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceConnection;

    async fn send_dl(server: &mut DeviceConnection, items: Vec<Value>) {
        server.send_plist(Value::Array(items)).await.unwrap();
    }

    #[tokio::test]
    async fn version_exchange_acknowledges_device_version() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let client = DeviceConnection::new(Box::new(client), "test");
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        send_dl(
            &mut server,
            vec![
                Value::String(DL_VERSION_EXCHANGE.into()),
                Value::Integer(400u64.into()),
                Value::Integer(0u64.into()),
            ],
        )
        .await;
        send_dl(&mut server, vec![Value::String(DL_DEVICE_READY.into())]).await;

        let dl = DeviceLinkClient::new(client).await.unwrap();
        assert_eq!(dl.version(), (400, 0));

        // The reply must echo the device's major version
        let reply = server.read_plist_value().await.unwrap();
        let Value::Array(items) = reply else {
            panic!("reply is not an array")
        };
        assert_eq!(items[0].as_string(), Some(DL_VERSION_EXCHANGE));
        assert_eq!(items[1].as_string(), Some("DLVersionsOk"));
        assert_eq!(items[2].as_unsigned_integer(), Some(400));
    }

    #[tokio::test]
    async fn unexpected_opening_tag_fails_handshake() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let client = DeviceConnection::new(Box::new(client), "test");
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        send_dl(&mut server, vec![Value::String(DL_DISCONNECT.into())]).await;

        match DeviceLinkClient::new(client).await {
            Err(MobiledeviceError::ProtocolViolation(_)) => {}
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_response_uses_empty_parameter_placeholders() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let client = DeviceConnection::new(Box::new(client), "test");
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        send_dl(
            &mut server,
            vec![
                Value::String(DL_VERSION_EXCHANGE.into()),
                Value::Integer(400u64.into()),
                Value::Integer(0u64.into()),
            ],
        )
        .await;
        send_dl(&mut server, vec![Value::String(DL_DEVICE_READY.into())]).await;
        let mut dl = DeviceLinkClient::new(client).await.unwrap();
        let _ = server.read_plist_value().await.unwrap();

        dl.send_status_response(0, None, None).await.unwrap();
        let Value::Array(items) = server.read_plist_value().await.unwrap() else {
            panic!("status response is not an array")
        };
        assert_eq!(items[0].as_string(), Some(DL_STATUS_RESPONSE));
        assert_eq!(items[1].as_signed_integer(), Some(0));
        assert_eq!(items[2].as_string(), Some(EMPTY_PARAMETER));
        assert!(matches!(items[3], Value::Dictionary(_)));
    }
}
