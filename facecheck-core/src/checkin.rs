use crate::config::StorageConfig;
use crate::store::CollaboratorError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Auxiliary context a caller may attach to a verification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationHints {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub client_ip: Option<String>,
    pub site_id: Option<String>,
    pub display_name: Option<String>,
}

impl LocationHints {
    /// "lat,lon" when both coordinates are known, otherwise the client IP.
    pub fn location_hint(&self) -> Option<String> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(format!("{},{}", lat, lon)),
            _ => self.client_ip.clone().filter(|ip| !ip.is_empty()),
        }
    }
}

/// Record of a successful verification handed to the check-in sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub identity_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    pub time: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

impl CheckIn {
    pub fn new(identity_id: &str, hints: &LocationHints, time: DateTime<Local>) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            name: hints
                .display_name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| identity_id.to_string()),
            site_id: hints.site_id.clone(),
            time,
            location_hint: hints.location_hint(),
            client_ip: hints.client_ip.clone(),
        }
    }
}

/// Best-effort sink for check-ins. May return an annotation such as a
/// resolved address.
pub trait CheckInSink: Send + Sync {
    fn record(&self, check_in: &CheckIn) -> Result<Option<String>, CollaboratorError>;
}

/// Appends check-ins to a JSON-lines file.
pub struct CheckInLog {
    path: PathBuf,
}

impl CheckInLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.checkin_log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckInSink for CheckInLog {
    fn record(&self, check_in: &CheckIn) -> Result<Option<String>, CollaboratorError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut line = serde_json::to_vec(check_in)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(None)
    }
}
