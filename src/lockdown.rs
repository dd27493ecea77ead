//! Lockdown service client
//!
//! lockdownd is the control daemon on TCP 62078 of every device. It answers
//! typed value queries, performs pairing, upgrades the session to TLS and
//! starts the other services.

use std::time::{Duration, Instant};

use log::{debug, warn};
use plist::Value;

use crate::{
    pairing_file::PairingFile, provider::DeviceProvider, usbmuxd::UsbmuxdConnection, ca,
    DeviceConnection, DeviceService, MobiledeviceError,
};

/// Progress of a pairing attempt, reported at each transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    ReadingDevicePublicKey,
    GeneratingCertificates,
    AwaitingUserConsent,
    PasswordProtected,
    Paired,
}

/// Client for the lockdown service
pub struct LockdownClient {
    /// The underlying device connection with established lockdown service
    pub connection: DeviceConnection,
    session_id: Option<String>,
}

impl std::fmt::Debug for LockdownClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockdownClient")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl DeviceService for LockdownClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("com.apple.mobile.lockdown")
    }

    /// Connects to lockdownd and verifies the far end is actually lockdown
    async fn connect(provider: &dyn DeviceProvider) -> Result<Self, MobiledeviceError> {
        let connection = provider.connect(Self::LOCKDOWND_PORT).await?;
        let mut client = Self::new(connection);
        if client.query_type().await? != "com.apple.mobile.lockdown" {
            return Err(MobiledeviceError::NotLockdown);
        }
        Ok(client)
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MobiledeviceError> {
        Ok(Self::new(connection))
    }
}

impl LockdownClient {
    /// The TCP port lockdownd listens on
    pub const LOCKDOWND_PORT: u16 = 62078;

    const PAIRING_RETRY_INITIAL: Duration = Duration::from_millis(200);
    const PAIRING_RETRY_CAP: Duration = Duration::from_secs(5);
    const PAIRING_TOTAL_WAIT: Duration = Duration::from_secs(30);

    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            session_id: None,
        }
    }

    /// The session identifier the device assigned, once a session is started
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Asks the daemon what it is
    pub async fn query_type(&mut self) -> Result<String, MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label.clone().into());
        req.insert("Request".into(), "QueryType".into());
        self.connection
            .send_plist(Value::Dictionary(req))
            .await?;

        let message = self.connection.read_plist().await?;
        match message.get("Type").and_then(|t| t.as_string()) {
            Some(t) => Ok(t.to_string()),
            None => Err(MobiledeviceError::UnexpectedResponse),
        }
    }

    /// Retrieves a value from the device
    ///
    /// An absent key and domain returns the full device dictionary.
    ///
    /// # Errors
    /// `Deprecated` when the device answers `DeprecatedInThisVersion`, which
    /// some diagnostic domains do on recent versions.
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label.clone().into());
        req.insert("Request".into(), "GetValue".into());
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let mut message = self.connection.read_plist().await?;
        match message.remove("Value") {
            Some(v) => Ok(v),
            None => Err(MobiledeviceError::UnexpectedResponse),
        }
    }

    /// The full device dictionary
    pub async fn get_all_values(&mut self) -> Result<plist::Dictionary, MobiledeviceError> {
        match self.get_value(None, None).await? {
            Value::Dictionary(d) => Ok(d),
            _ => Err(MobiledeviceError::UnexpectedResponse),
        }
    }

    /// Convenience accessor for string-typed device values
    pub async fn get_string_value(
        &mut self,
        key: &str,
        domain: Option<&str>,
    ) -> Result<String, MobiledeviceError> {
        match self.get_value(Some(key), domain).await? {
            Value::String(s) => Ok(s),
            _ => Err(MobiledeviceError::UnexpectedResponse),
        }
    }

    /// `ProductVersion` parsed into (major, minor, patch)
    pub async fn product_version(&mut self) -> Result<(u32, u32, u32), MobiledeviceError> {
        let version = self.get_string_value("ProductVersion", None).await?;
        let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        Ok((
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        ))
    }

    /// Sets a value on the device
    pub async fn set_value(
        &mut self,
        key: impl Into<String>,
        value: Value,
        domain: Option<&str>,
    ) -> Result<(), MobiledeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label.clone().into());
        req.insert("Request".into(), "SetValue".into());
        req.insert("Key".into(), key.into().into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        self.connection.read_plist().await?;
        Ok(())
    }

    /// Starts a session and upgrades the stream to TLS when asked to
    ///
    /// # Errors
    /// `InvalidHostId` when the device no longer recognizes the record;
    /// callers holding a muxer connection can recover by re-pairing.
    pub async fn start_session(
        &mut self,
        pairing_file: &PairingFile,
    ) -> Result<(), MobiledeviceError> {
        if self.connection.socket.is_none() {
            return Err(MobiledeviceError::NoEstablishedConnection);
        }

        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label.clone().into());
        req.insert("Request".into(), "StartSession".into());
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let response = self.connection.read_plist().await?;
        self.session_id = response
            .get("SessionID")
            .and_then(|s| s.as_string())
            .map(|s| s.to_string());

        let ssl = match response.get("EnableSessionSSL") {
            Some(Value::Boolean(enable)) => *enable,
            _ => false,
        };
        if ssl {
            self.connection.start_session(pairing_file).await?;
        }
        Ok(())
    }

    /// Requests to start a service on the device
    ///
    /// # Arguments
    /// * `identifier` - The service identifier (e.g., "com.apple.mobilebackup2")
    /// * `escrow_bag` - Escrow bag from the pair record, for services that
    ///   must outlive the first unlock
    ///
    /// # Returns
    /// The port the service listens on and whether the new stream must be
    /// TLS-upgraded before use
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
        escrow_bag: Option<&[u8]>,
    ) -> Result<(u16, bool), MobiledeviceError> {
        let identifier = identifier.into();
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label.clone().into());
        req.insert("Request".into(), "StartService".into());
        req.insert("Service".into(), identifier.into());
        if let Some(escrow) = escrow_bag {
            req.insert("EscrowBag".into(), plist::Value::Data(escrow.to_vec()));
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let response = self.connection.read_plist().await?;

        let ssl = match response.get("EnableServiceSSL") {
            Some(Value::Boolean(ssl)) => *ssl,
            _ => false, // over USB, this key may not exist
        };

        match response.get("Port").and_then(|p| p.as_unsigned_integer()) {
            Some(port) if port <= u16::MAX as u64 => Ok((port as u16, ssl)),
            _ => {
                warn!("StartService response did not carry a port");
                Err(MobiledeviceError::UnexpectedResponse)
            }
        }
    }

    /// Creates a pair record and sends it to the device for trusting
    ///
    /// Loops while the trust dialog is pending, backing off from 200 ms up
    /// to 5 s between attempts and giving up after 30 s in total. Progress
    /// is reported through `progress` at each transition.
    ///
    /// The record is NOT saved to the muxer's store; that is the caller's
    /// responsibility (see [`LockdownClient::ensure_paired`]).
    pub async fn pair(
        &mut self,
        host_id: impl Into<String>,
        system_buid: impl Into<String>,
        mut progress: impl FnMut(PairingState),
    ) -> Result<PairingFile, MobiledeviceError> {
        let host_id = host_id.into();
        let system_buid = system_buid.into();

        progress(PairingState::ReadingDevicePublicKey);
        let pub_key = self.get_value(Some("DevicePublicKey"), None).await?;
        let pub_key = match pub_key.as_data() {
            Some(p) => p.to_vec(),
            None => {
                warn!("Did not get public key data response");
                return Err(MobiledeviceError::UnexpectedResponse);
            }
        };

        let wifi_mac = match self.get_value(Some("WiFiAddress"), None).await {
            Ok(v) => v.as_string().map(|s| s.to_string()),
            Err(_) => None,
        };
        let udid = match self.get_value(Some("UniqueDeviceID"), None).await {
            Ok(v) => v.as_string().map(|s| s.to_string()),
            Err(_) => None,
        };

        progress(PairingState::GeneratingCertificates);
        let certs = ca::generate_certificates(Some(&pub_key))?;

        let mut record = PairingFile {
            device_certificate: certs.device_certificate,
            host_private_key: certs.host_private_key,
            host_certificate: certs.host_certificate,
            root_private_key: certs.root_private_key,
            root_certificate: certs.root_certificate,
            system_buid,
            host_id,
            escrow_bag: None,
            wifi_mac_address: wifi_mac,
            udid,
        };

        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label.clone().into());
        req.insert("Request".into(), "Pair".into());
        req.insert(
            "PairRecord".into(),
            Value::Dictionary(record.to_wire_record()?),
        );
        req.insert("ProtocolVersion".into(), "2".into());
        let mut options = plist::Dictionary::new();
        options.insert("ExtendedPairingErrors".into(), true.into());
        req.insert("PairingOptions".into(), Value::Dictionary(options));
        let req = Value::Dictionary(req);

        let started = Instant::now();
        let mut delay = Self::PAIRING_RETRY_INITIAL;
        loop {
            self.connection.send_plist(req.clone()).await?;
            match self.connection.read_plist().await {
                Ok(response) => {
                    if let Some(escrow) = response.get("EscrowBag").and_then(|e| e.as_data()) {
                        record.escrow_bag = Some(escrow.to_vec());
                    }
                    progress(PairingState::Paired);
                    break Ok(record);
                }
                Err(MobiledeviceError::PairingDialogResponsePending) => {
                    progress(PairingState::AwaitingUserConsent);
                }
                Err(MobiledeviceError::PairingRequiresPassword) => {
                    progress(PairingState::PasswordProtected);
                }
                Err(e) => break Err(e),
            }

            if started.elapsed() + delay > Self::PAIRING_TOTAL_WAIT {
                break Err(MobiledeviceError::PairingDialogResponsePending);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Self::PAIRING_RETRY_CAP);
        }
    }

    /// Returns working pairing credentials for this device
    ///
    /// Reads the muxer's record when one exists; otherwise pairs and saves
    /// the new record. A record the device no longer recognizes
    /// (`InvalidHostID` at session start) is deleted and pairing restarts
    /// exactly once.
    pub async fn ensure_paired(
        &mut self,
        muxer: &mut UsbmuxdConnection,
        udid: &str,
        device_id: Option<u32>,
        mut progress: impl FnMut(PairingState),
    ) -> Result<PairingFile, MobiledeviceError> {
        match muxer.get_pair_record(udid).await {
            Ok(record) => match self.start_session(&record).await {
                Ok(()) => return Ok(record),
                Err(MobiledeviceError::InvalidHostId) => {
                    debug!("Device rejected stored record, re-pairing");
                    muxer.delete_pair_record(udid).await?;
                }
                Err(e) => return Err(e),
            },
            Err(MobiledeviceError::NotPaired) => {}
            Err(e) => return Err(e),
        }

        let host_id = uuid::Uuid::new_v4().to_string().to_uppercase();
        let system_buid = muxer.get_buid().await?;
        let record = self.pair(host_id, system_buid, &mut progress).await?;
        muxer.save_pair_record(udid, device_id, &record).await?;
        self.start_session(&record).await?;
        Ok(record)
    }

    /// Tells lockdownd the session is over; errors are ignored
    pub async fn goodbye(mut self) {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label.clone().into());
        req.insert("Request".into(), "Goodbye".into());
        if self
            .connection
            .send_plist(Value::Dictionary(req))
            .await
            .is_ok()
        {
            let _ = self.connection.read_plist().await;
        }
    }
}

impl From<DeviceConnection> for LockdownClient {
    fn from(value: DeviceConnection) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn reply(server: &mut DeviceConnection, dict: plist::Dictionary) {
        server.send_plist(Value::Dictionary(dict)).await.unwrap();
    }

    #[tokio::test]
    async fn query_type_mismatch_is_not_lockdown() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut client = LockdownClient::new(DeviceConnection::new(Box::new(client), "test"));
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        let mut res = plist::Dictionary::new();
        res.insert("Type".into(), "com.apple.mobile.heartbeat".into());
        reply(&mut server, res).await;

        let answer = client.query_type().await.unwrap();
        assert_ne!(answer, "com.apple.mobile.lockdown");
    }

    #[tokio::test]
    async fn get_value_returns_typed_value() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut client = LockdownClient::new(DeviceConnection::new(Box::new(client), "test"));
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        let mut res = plist::Dictionary::new();
        res.insert("Key".into(), "ProductType".into());
        res.insert("Value".into(), "iPhone14,5".into());
        reply(&mut server, res).await;

        let value = client.get_value(Some("ProductType"), None).await.unwrap();
        assert_eq!(value.as_string(), Some("iPhone14,5"));

        let sent = server.read_plist().await.unwrap();
        assert_eq!(
            sent.get("Request").and_then(|r| r.as_string()),
            Some("GetValue")
        );
        assert_eq!(
            sent.get("Key").and_then(|r| r.as_string()),
            Some("ProductType")
        );
    }

    #[tokio::test]
    async fn deprecated_value_surfaces_as_deprecated() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut client = LockdownClient::new(DeviceConnection::new(Box::new(client), "test"));
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        let mut res = plist::Dictionary::new();
        res.insert("Error".into(), "DeprecatedInThisVersion".into());
        reply(&mut server, res).await;

        match client.get_value(Some("All"), Some("com.apple.mobile.diagnostics")).await {
            Err(MobiledeviceError::Deprecated) => {}
            other => panic!("expected Deprecated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_service_parses_port_and_ssl() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut client = LockdownClient::new(DeviceConnection::new(Box::new(client), "test"));
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        let mut res = plist::Dictionary::new();
        res.insert("Port".into(), 49152.into());
        res.insert("EnableServiceSSL".into(), true.into());
        reply(&mut server, res).await;

        let (port, ssl) = client
            .start_service("com.apple.mobilebackup2", None)
            .await
            .unwrap();
        assert_eq!(port, 49152);
        assert!(ssl);
    }

    #[tokio::test]
    async fn pairing_retries_while_the_trust_dialog_is_pending() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = LockdownClient::new(DeviceConnection::new(Box::new(client), "test"));
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        let device_key = openssl::rsa::Rsa::generate(2048).unwrap();
        let mut res = plist::Dictionary::new();
        res.insert(
            "Value".into(),
            Value::Data(device_key.public_key_to_pem_pkcs1().unwrap()),
        );
        reply(&mut server, res).await;

        let mut res = plist::Dictionary::new();
        res.insert("Value".into(), "aa:bb:cc:dd:ee:ff".into());
        reply(&mut server, res).await;

        let mut res = plist::Dictionary::new();
        res.insert("Value".into(), "00008101-000A11111111001E".into());
        reply(&mut server, res).await;

        // First Pair attempt: the trust dialog is still on screen
        let mut res = plist::Dictionary::new();
        res.insert("Error".into(), "PairingDialogResponsePending".into());
        reply(&mut server, res).await;

        // Second attempt: trusted, with an escrow bag
        let mut res = plist::Dictionary::new();
        res.insert("EscrowBag".into(), Value::Data(vec![1, 2, 3]));
        reply(&mut server, res).await;

        let mut states = Vec::new();
        let record = client
            .pair(
                "AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE",
                "buid",
                |s| states.push(s),
            )
            .await
            .unwrap();

        assert_eq!(record.escrow_bag, Some(vec![1, 2, 3]));
        assert_eq!(record.udid.as_deref(), Some("00008101-000A11111111001E"));
        assert!(states.contains(&PairingState::AwaitingUserConsent));
        assert_eq!(states.last(), Some(&PairingState::Paired));

        // The wire record never carries private keys
        let _ = server.read_plist().await.unwrap(); // DevicePublicKey query
        let _ = server.read_plist().await.unwrap(); // WiFiAddress query
        let _ = server.read_plist().await.unwrap(); // UniqueDeviceID query
        let pair_request = server.read_plist().await.unwrap();
        let sent_record = pair_request
            .get("PairRecord")
            .and_then(|r| r.as_dictionary())
            .unwrap();
        assert!(sent_record.get("HostCertificate").is_some());
        assert!(sent_record.get("HostPrivateKey").is_none());
        assert!(sent_record.get("RootPrivateKey").is_none());
    }

    #[tokio::test]
    async fn user_denial_ends_pairing() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = LockdownClient::new(DeviceConnection::new(Box::new(client), "test"));
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        let device_key = openssl::rsa::Rsa::generate(2048).unwrap();
        let mut res = plist::Dictionary::new();
        res.insert(
            "Value".into(),
            Value::Data(device_key.public_key_to_pem_pkcs1().unwrap()),
        );
        reply(&mut server, res).await;

        let mut res = plist::Dictionary::new();
        res.insert("Value".into(), "aa:bb:cc:dd:ee:ff".into());
        reply(&mut server, res).await;

        let mut res = plist::Dictionary::new();
        res.insert("Value".into(), "00008101-000A11111111001E".into());
        reply(&mut server, res).await;

        let mut res = plist::Dictionary::new();
        res.insert("Error".into(), "UserDeniedPairing".into());
        reply(&mut server, res).await;

        match client.pair("host", "buid", |_| {}).await {
            Err(MobiledeviceError::UserDeniedPairing) => {}
            other => panic!("expected UserDeniedPairing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_session_without_ssl_records_session_id() {
        let certs = crate::ca::generate_certificates(None).unwrap();
        let record = PairingFile {
            device_certificate: certs.device_certificate,
            host_private_key: certs.host_private_key,
            host_certificate: certs.host_certificate,
            root_private_key: certs.root_private_key,
            root_certificate: certs.root_certificate,
            system_buid: "buid".into(),
            host_id: "host".into(),
            escrow_bag: None,
            wifi_mac_address: None,
            udid: None,
        };

        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut client = LockdownClient::new(DeviceConnection::new(Box::new(client), "test"));
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        let mut res = plist::Dictionary::new();
        res.insert("SessionID".into(), "session-1".into());
        res.insert("EnableSessionSSL".into(), false.into());
        reply(&mut server, res).await;

        client.start_session(&record).await.unwrap();
        assert_eq!(client.session_id(), Some("session-1"));
    }
}
