//! Installation proxy client
//!
//! Only the Browse the backup's Info.plist assembly needs: user
//! applications with the attributes iTunes records alongside a backup.

use std::collections::HashMap;

use crate::{DeviceConnection, DeviceService, MobiledeviceError};

/// Client for the installation proxy service
#[derive(Debug)]
pub struct InstallationProxyClient {
    pub connection: DeviceConnection,
}

impl DeviceService for InstallationProxyClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("com.apple.mobile.installation_proxy")
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MobiledeviceError> {
        Ok(Self::new(connection))
    }
}

impl InstallationProxyClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Browses installed user applications
    ///
    /// # Arguments
    /// * `return_attributes` - The per-app keys to fetch (e.g.
    ///   `CFBundleIdentifier`, `ApplicationSINF`, `iTunesMetadata`)
    ///
    /// # Returns
    /// Bundle identifier mapped to the requested attributes
    pub async fn browse_user_apps(
        &mut self,
        return_attributes: &[&str],
    ) -> Result<HashMap<String, plist::Dictionary>, MobiledeviceError> {
        let mut options = plist::Dictionary::new();
        options.insert("ApplicationType".into(), "User".into());
        options.insert(
            "ReturnAttributes".into(),
            plist::Value::Array(
                return_attributes
                    .iter()
                    .map(|a| plist::Value::String((*a).into()))
                    .collect(),
            ),
        );

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Browse".into());
        req.insert("ClientOptions".into(), plist::Value::Dictionary(options));
        self.connection.send_plist(plist::Value::Dictionary(req)).await?;

        // Browse answers in BrowsingApplications batches until Complete
        let mut apps = HashMap::new();
        loop {
            let res = self.connection.read_plist().await?;
            if let Some(plist::Value::Array(list)) = res.get("CurrentList") {
                for app in list {
                    if let plist::Value::Dictionary(app) = app {
                        if let Some(id) = app.get("CFBundleIdentifier").and_then(|i| i.as_string())
                        {
                            apps.insert(id.to_string(), app.clone());
                        }
                    }
                }
            }
            match res.get("Status").and_then(|s| s.as_string()) {
                Some("Complete") => break,
                Some(_) => continue,
                None => return Err(MobiledeviceError::UnexpectedResponse),
            }
        }
        Ok(apps)
    }
}
