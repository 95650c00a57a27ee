//! Hidden service lifecycle.
//!
//! [`HiddenServiceManager`] provisions services with `ADD_ONION`, removes
//! them with `DEL_ONION` and lists the ones the daemon currently knows
//! about.

use crate::error::{Error, Result};
use crate::protocol::format_command;
use crate::session::ControlSession;
use crate::types::OnionAddress;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Key type used when none is configured.
pub const DEFAULT_KEY_TYPE: &str = "ED25519-V3";

/// One client-authorization entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAuth {
    /// Client name.
    pub name: String,
    /// Client key blob.
    pub key: String,
}

/// What to provision.
///
/// Ports map virtual (public) ports to local targets on `127.0.0.1`.
#[derive(Clone, PartialEq, Eq)]
pub struct OnionServiceConfig {
    key_type: String,
    private_key: Option<String>,
    ports: BTreeMap<u16, u16>,
    client_auth: Vec<ClientAuth>,
    flags: Vec<String>,
}

impl Default for OnionServiceConfig {
    fn default() -> Self {
        Self {
            key_type: DEFAULT_KEY_TYPE.to_string(),
            private_key: None,
            ports: BTreeMap::new(),
            client_auth: Vec::new(),
            flags: Vec::new(),
        }
    }
}

impl OnionServiceConfig {
    /// A config with the default key type and no ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Key type, e.g. `ED25519-V3`.
    pub fn key_type(mut self, key_type: impl Into<String>) -> Self {
        self.key_type = key_type.into();
        self
    }

    /// Reuse an existing key blob instead of generating one.
    pub fn private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Map `virtual_port` to `127.0.0.1:target_port`. A later mapping for
    /// the same virtual port replaces the earlier one.
    pub fn port(mut self, virtual_port: u16, target_port: u16) -> Self {
        self.ports.insert(virtual_port, target_port);
        self
    }

    /// Authorize a client.
    pub fn client_auth(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.client_auth.push(ClientAuth {
            name: name.into(),
            key: key.into(),
        });
        self
    }

    /// Add an `ADD_ONION` flag such as `DiscardPK` or `Detach`.
    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    /// Configured port mappings, ordered by virtual port.
    pub fn ports(&self) -> &BTreeMap<u16, u16> {
        &self.ports
    }

    fn validate(&self) -> Result<()> {
        if self.key_type.trim().is_empty() {
            return Err(Error::config("provision", "key type is empty"));
        }
        if self.ports.is_empty() {
            return Err(Error::config("provision", "at least one port mapping is required"));
        }
        for (&virtual_port, &target) in &self.ports {
            if virtual_port == 0 || target == 0 {
                return Err(Error::config(
                    "provision",
                    format!("invalid port mapping {} -> {}", virtual_port, target),
                ));
            }
        }
        for auth in &self.client_auth {
            if auth.name.is_empty() || auth.key.is_empty() {
                return Err(Error::config(
                    "provision",
                    "client authorization needs a name and a key",
                ));
            }
        }
        Ok(())
    }

    /// Build the `ADD_ONION` command line after validating the config.
    ///
    /// Ports are emitted in ascending order of virtual port.
    pub fn build_add_onion(&self) -> Result<String> {
        self.validate()?;

        let mut args = Vec::with_capacity(2 + self.ports.len() + self.client_auth.len());
        args.push(match &self.private_key {
            Some(key) => format!("{}:{}", self.key_type, key),
            None => format!("NEW:{}", self.key_type),
        });
        if !self.flags.is_empty() {
            args.push(format!("Flags={}", self.flags.join(",")));
        }
        for (virtual_port, target) in &self.ports {
            args.push(format!("Port={},127.0.0.1:{}", virtual_port, target));
        }
        for auth in &self.client_auth {
            args.push(format!("ClientAuth={}:{}", auth.name, auth.key));
        }

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(format_command("ADD_ONION", &refs))
    }
}

impl fmt::Debug for OnionServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnionServiceConfig")
            .field("key_type", &self.key_type)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("ports", &self.ports)
            .field("client_auth", &self.client_auth.len())
            .field("flags", &self.flags)
            .finish()
    }
}

/// A provisioned hidden service.
#[derive(Clone, PartialEq, Eq)]
pub struct HiddenService {
    address: OnionAddress,
    private_key: Option<String>,
    ports: BTreeMap<u16, u16>,
    client_auth: Vec<ClientAuth>,
}

impl HiddenService {
    /// The address, e.g. `abc...xyz.onion`.
    pub fn address(&self) -> &OnionAddress {
        &self.address
    }

    /// The address without `.onion`.
    pub fn service_id(&self) -> &str {
        self.address.service_id()
    }

    /// Type-prefixed key blob, e.g. `ED25519-V3:...`. `None` when the daemon
    /// was asked to discard it.
    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }

    /// Port mappings, ordered by virtual port.
    pub fn ports(&self) -> &BTreeMap<u16, u16> {
        &self.ports
    }

    /// Authorized clients.
    pub fn client_auth(&self) -> &[ClientAuth] {
        &self.client_auth
    }
}

impl fmt::Debug for HiddenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiddenService")
            .field("address", &self.address.to_string())
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("ports", &self.ports)
            .field("client_auth", &self.client_auth.len())
            .finish()
    }
}

/// Provisions and removes hidden services over a shared control session.
pub struct HiddenServiceManager<S = TcpStream> {
    session: Arc<ControlSession<S>>,
}

impl<S> Clone for HiddenServiceManager<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<S> HiddenServiceManager<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Manage services over `session`.
    pub fn new(session: Arc<ControlSession<S>>) -> Self {
        Self { session }
    }

    /// Provision a service.
    pub async fn provision(&self, config: &OnionServiceConfig) -> Result<HiddenService> {
        let command = config.build_add_onion()?;
        let reply = self
            .session
            .execute(&command)
            .await
            .map_err(|e| e.in_op("provision"))?;

        let mut service_id = None;
        let mut private_key = config
            .private_key
            .as_ref()
            .map(|key| format!("{}:{}", config.key_type, key));
        for line in reply.lines() {
            if let Some(id) = line.strip_prefix("ServiceID=") {
                service_id = Some(id.to_string());
            } else if let Some(key) = line.strip_prefix("PrivateKey=") {
                private_key = Some(key.to_string());
            }
        }

        let service_id = service_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::protocol("provision", "reply carried no ServiceID"))?;
        let address = OnionAddress::new(service_id);
        info!(%address, ports = config.ports.len(), "hidden service provisioned");

        Ok(HiddenService {
            address,
            private_key,
            ports: config.ports.clone(),
            client_auth: config.client_auth.clone(),
        })
    }

    /// Remove a service. Failures are reported, never retried.
    pub async fn deprovision(&self, service: &HiddenService) -> Result<()> {
        self.deprovision_id(service.service_id()).await
    }

    /// Remove a service by address or service ID.
    pub async fn deprovision_id(&self, address: &str) -> Result<()> {
        let service_id = address.strip_suffix(".onion").unwrap_or(address);
        self.session
            .execute(&format_command("DEL_ONION", &[service_id]))
            .await
            .map_err(|e| e.in_op("deprovision"))?;
        info!(service_id, "hidden service removed");
        Ok(())
    }

    /// Service IDs the daemon currently serves for this control connection.
    ///
    /// Query failures read as "no services".
    pub async fn status(&self) -> Vec<String> {
        match self.session.get_info("onions/current").await {
            Ok(value) => value
                .lines()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                debug!(error = %e, "onions/current unavailable, reporting none");
                Vec::new()
            }
        }
    }
}
