//! Notification proxy service client
//!
//! Used by the backup engine to announce sync phases:
//!
//! - Posted: `com.apple.itunes-client.syncWillStart`,
//!   `com.apple.itunes-mobdev.syncLockRequest`,
//!   `com.apple.itunes-client.syncDidStart`,
//!   `com.apple.itunes-mobdev.syncDidFinish`
//! - Observable: `com.apple.itunes-client.syncCancelRequest`,
//!   `com.apple.itunes-client.syncSuspendRequest`,
//!   `com.apple.itunes-client.syncResumeRequest`

use crate::{DeviceConnection, DeviceService, MobiledeviceError};

/// Client for the notification proxy service
#[derive(Debug)]
pub struct NotificationProxyClient {
    /// The underlying device connection
    pub connection: DeviceConnection,
}

impl DeviceService for NotificationProxyClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("com.apple.mobile.notification_proxy")
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MobiledeviceError> {
        Ok(Self::new(connection))
    }
}

impl NotificationProxyClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Posts a notification to the device
    pub async fn post_notification(
        &mut self,
        notification_name: impl Into<String>,
    ) -> Result<(), MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "PostNotification".into());
        req.insert("Name".into(), notification_name.into().into());
        self.connection.send_plist(plist::Value::Dictionary(req)).await
    }

    /// Registers to observe a notification; wait for it with
    /// [`NotificationProxyClient::receive_notification`]
    pub async fn observe_notification(
        &mut self,
        notification_name: impl Into<String>,
    ) -> Result<(), MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "ObserveNotification".into());
        req.insert("Name".into(), notification_name.into().into());
        self.connection.send_plist(plist::Value::Dictionary(req)).await
    }

    /// Waits for the next observed notification and returns its name
    pub async fn receive_notification(&mut self) -> Result<String, MobiledeviceError> {
        let response = self.connection.read_plist().await?;
        match response.get("Command").and_then(|c| c.as_string()) {
            Some("RelayNotification") => match response.get("Name").and_then(|n| n.as_string()) {
                Some(name) => Ok(name.to_string()),
                None => Err(MobiledeviceError::UnexpectedResponse),
            },
            _ => Err(MobiledeviceError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_notification_sends_command_and_name() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut np = NotificationProxyClient::new(DeviceConnection::new(Box::new(client), "test"));
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        np.post_notification("com.apple.itunes-mobdev.syncLockRequest")
            .await
            .unwrap();

        let sent = server.read_plist().await.unwrap();
        assert_eq!(
            sent.get("Command").and_then(|c| c.as_string()),
            Some("PostNotification")
        );
        assert_eq!(
            sent.get("Name").and_then(|n| n.as_string()),
            Some("com.apple.itunes-mobdev.syncLockRequest")
        );
    }
}
