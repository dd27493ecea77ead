//! Info.plist assembly
//!
//! iTunes writes an Info.plist next to every backup describing the device,
//! its user applications and a handful of iTunes bookkeeping files. The
//! device never sends this file; the host assembles it.

use std::collections::HashMap;
use std::time::SystemTime;

use plist::{Dictionary, Value};

/// The iTunes bookkeeping files recorded when present on the device
pub(crate) const ITUNES_FILES: [&str; 12] = [
    "ITunesPrefs",
    "ITunesPrefs.plist",
    "IC-Info.sidb",
    "IC-Info.sidv",
    "PhotosFolderAlbums",
    "PhotosFolderName",
    "PhotosFolderPrefs",
    "VoiceMemos.plist",
    "iPhotoAlbumPrefs",
    "iTunesApplicationIDs",
    "iTunesPrefs",
    "iTunesPrefs.plist",
];

pub(crate) const ITUNES_FILES_DEVICE_DIR: &str = "/iTunes_Control/iTunes";
pub(crate) const IBOOKS_DATA_DEVICE_PATH: &str = "/Books/iBooksData2.plist";
pub(crate) const FALLBACK_ITUNES_VERSION: &str = "10.0.1";

/// Everything the assembly draws from, gathered best-effort by the engine
#[derive(Debug, Default)]
pub(crate) struct InfoPlistInputs {
    pub device_values: Dictionary,
    pub udid: String,
    /// Bundle id mapped to the Browse attributes iTunes records
    pub apps: HashMap<String, Dictionary>,
    /// Bundle id mapped to placeholder icon PNG bytes
    pub icons: HashMap<String, Vec<u8>>,
    /// File name mapped to contents, from `/iTunes_Control/iTunes/`
    pub itunes_files: Vec<(String, Vec<u8>)>,
    pub ibooks_data: Option<Vec<u8>>,
    pub itunes_settings: Option<Value>,
    pub itunes_version: Option<String>,
}

fn copy_string(from: &Dictionary, key: &str, to: &mut Dictionary, as_key: &str) {
    if let Some(v) = from.get(key).and_then(|v| v.as_string()) {
        to.insert(as_key.into(), v.into());
    }
}

pub(crate) fn build_info_plist(inputs: &InfoPlistInputs) -> Dictionary {
    let mut info = Dictionary::new();
    let values = &inputs.device_values;

    let mut applications = Dictionary::new();
    let mut installed: Vec<Value> = Vec::new();
    for (bundle_id, attributes) in &inputs.apps {
        installed.push(Value::String(bundle_id.clone()));

        let mut entry = Dictionary::new();
        if let Some(sinf) = attributes.get("ApplicationSINF") {
            entry.insert("ApplicationSINF".into(), sinf.clone());
        }
        if let Some(meta) = attributes.get("iTunesMetadata") {
            entry.insert("iTunesMetadata".into(), meta.clone());
        }
        if let Some(icon) = inputs.icons.get(bundle_id) {
            entry.insert("PlaceholderIcon".into(), Value::Data(icon.clone()));
        }
        applications.insert(bundle_id.clone(), Value::Dictionary(entry));
    }
    info.insert("Applications".into(), Value::Dictionary(applications));
    info.insert("Installed Applications".into(), Value::Array(installed));

    copy_string(values, "BuildVersion", &mut info, "Build Version");
    copy_string(values, "DeviceName", &mut info, "Device Name");
    copy_string(values, "DeviceName", &mut info, "Display Name");
    info.insert(
        "GUID".into(),
        uuid::Uuid::new_v4().to_string().to_uppercase().into(),
    );
    copy_string(
        values,
        "IntegratedCircuitCardIdentity",
        &mut info,
        "ICCID",
    );
    copy_string(
        values,
        "InternationalMobileEquipmentIdentity",
        &mut info,
        "IMEI",
    );
    copy_string(values, "MobileEquipmentIdentifier", &mut info, "MEID");
    copy_string(values, "PhoneNumber", &mut info, "Phone Number");
    copy_string(values, "ProductType", &mut info, "Product Type");
    copy_string(values, "ProductVersion", &mut info, "Product Version");
    copy_string(values, "SerialNumber", &mut info, "Serial Number");

    let udid_upper = inputs.udid.to_uppercase();
    info.insert("Target Identifier".into(), udid_upper.clone().into());
    info.insert("Target Type".into(), "Device".into());
    info.insert("Unique Identifier".into(), udid_upper.into());
    info.insert(
        "Last Backup Date".into(),
        Value::Date(SystemTime::now().into()),
    );

    let mut itunes_files = Dictionary::new();
    for (name, contents) in &inputs.itunes_files {
        itunes_files.insert(name.clone(), Value::Data(contents.clone()));
    }
    info.insert("iTunes Files".into(), Value::Dictionary(itunes_files));

    if let Some(books) = &inputs.ibooks_data {
        info.insert("iBooks Data 2".into(), Value::Data(books.clone()));
    }

    info.insert(
        "iTunes Settings".into(),
        inputs
            .itunes_settings
            .clone()
            .unwrap_or_else(|| Value::Dictionary(Dictionary::new())),
    );
    info.insert(
        "iTunes Version".into(),
        inputs
            .itunes_version
            .clone()
            .unwrap_or_else(|| FALLBACK_ITUNES_VERSION.to_string())
            .into(),
    );

    info
}
