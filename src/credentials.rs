//! Credential material and the startup readiness gate
//!
//! The credentials file names the PEM files used for mTLS, the HTTPS service
//! port shared by every cluster node, the SNMP community allow-set and the
//! SNMPv3 user. It is hot-reloaded like the rule files.
//!
//! Trap processing, the cluster and the admin server must not start before the
//! certificate paths are known. [`CredentialStore::wait_ready`] blocks until
//! the first complete credential set is installed; the gate opens once and
//! never closes again.

use crate::trap::SnmpVersion;
use crate::usm::{AuthLevel, UsmUser};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

fn default_service_port() -> u16 {
    8880
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub cert_pem: PathBuf,
    #[serde(default)]
    pub cert_key: PathBuf,
    #[serde(default)]
    pub cert_root: PathBuf,
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    /// Allowed v1/v2c community strings; empty permits all
    #[serde(default)]
    pub community: BTreeSet<String>,
    #[serde(default)]
    pub snmpv3_user: String,
    #[serde(default)]
    pub snmpv3_password: String,
    /// `AuthNoPriv` (default) or `NoAuthNoPriv`
    #[serde(default)]
    pub snmpv3_authtype: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            cert_pem: PathBuf::new(),
            cert_key: PathBuf::new(),
            cert_root: PathBuf::new(),
            service_port: default_service_port(),
            community: BTreeSet::new(),
            snmpv3_user: String::new(),
            snmpv3_password: String::new(),
            snmpv3_authtype: String::new(),
        }
    }
}

impl Credentials {
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read credentials file {}", path.as_ref().display()))?;

        serde_json::from_str(&content).context("Failed to parse credentials JSON")
    }

    /// All certificate paths are present.
    pub fn is_complete(&self) -> bool {
        !self.cert_pem.as_os_str().is_empty()
            && !self.cert_key.as_os_str().is_empty()
            && !self.cert_root.as_os_str().is_empty()
    }

    /// The configured SNMPv3 user, if any.
    pub fn usm_user(&self) -> Option<UsmUser> {
        if self.snmpv3_user.is_empty() {
            return None;
        }
        Some(UsmUser::new(
            &self.snmpv3_user,
            &self.snmpv3_password,
            AuthLevel::parse(&self.snmpv3_authtype),
        ))
    }
}

/// Current credentials plus the one-shot readiness signal
#[derive(Debug)]
pub struct CredentialStore {
    current: RwLock<Credentials>,
    usm: RwLock<Option<Arc<UsmUser>>>,
    ready: watch::Sender<bool>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            current: RwLock::new(Credentials::default()),
            usm: RwLock::new(None),
            ready,
        }
    }

    /// Replace the credential set; opens the gate on the first complete set.
    pub fn install(&self, credentials: Credentials) {
        let complete = credentials.is_complete();
        let unchanged_user = {
            let current = self.current.read();
            current.snmpv3_user == credentials.snmpv3_user
                && current.snmpv3_password == credentials.snmpv3_password
                && current.snmpv3_authtype == credentials.snmpv3_authtype
        };
        if !unchanged_user {
            let user = credentials.usm_user().map(Arc::new);
            if let Some(ref user) = user {
                info!(user = %user.name(), level = ?user.level(), "SNMPv3 user configured");
            }
            *self.usm.write() = user;
        }
        *self.current.write() = credentials;

        if complete && !*self.ready.borrow() {
            info!("Credential material loaded, releasing startup gate");
            self.ready.send_replace(true);
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn snapshot(&self) -> Credentials {
        self.current.read().clone()
    }

    pub fn usm_user(&self) -> Option<Arc<UsmUser>> {
        self.usm.read().clone()
    }

    pub fn service_port(&self) -> u16 {
        self.current.read().service_port
    }

    /// Community policy: v3 always passes, an empty allow-set permits all.
    pub fn community_allows(&self, version: SnmpVersion, community: Option<&str>) -> bool {
        if version.is_authenticated() {
            return true;
        }
        let current = self.current.read();
        if current.community.is_empty() {
            return true;
        }
        community.is_some_and(|c| current.community.contains(c))
    }
}
