use crate::error::{ProxyError, ProxyResult};
use regex::Regex;
use serde_derive::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// Directory registration options. Opaque to the core; consumed by the
/// registration collaborator only.
#[derive(Serialize, Deserialize, Clone)]
pub struct RegistrationConfig {
    #[serde(rename = "Enabled", default)]
    pub enabled: bool,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Comment", default)]
    pub comment: Option<String>,
}

impl Default for RegistrationConfig {
    fn default() -> RegistrationConfig {
        RegistrationConfig {
            enabled: false,
            name: None,
            comment: None,
        }
    }
}

/// Proxy configuration, read-only after `open`.
#[derive(Serialize, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Shared client password. Case-insensitive for the response
    /// computation.
    #[serde(rename = "Password")]
    pub password: String,
    /// Listener interface; all interfaces when absent.
    #[serde(rename = "BindAddress", default)]
    pub bind_addr: Option<String>,
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,
    /// External interface whose address is exposed as slot 0.
    #[serde(rename = "ExternalBindAddress", default)]
    pub bind_addr_ext: Option<String>,
    /// Additional external interfaces; each defines one extra slot.
    #[serde(rename = "AdditionalExternalBindAddresses", default)]
    pub bind_addr_ext_add: Vec<String>,
    #[serde(rename = "CallsignAllowList", default)]
    pub calls_allowed: Option<String>,
    #[serde(rename = "CallsignDenyList", default)]
    pub calls_denied: Option<String>,
    #[serde(rename = "Registration", default)]
    pub registration: RegistrationConfig,
}

fn default_port() -> u16 {
    crate::DEFAULT_PROXY_PORT
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        ProxyConfig {
            password: String::new(),
            bind_addr: None,
            port: default_port(),
            bind_addr_ext: None,
            bind_addr_ext_add: Vec::new(),
            calls_allowed: None,
            calls_denied: None,
            registration: RegistrationConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ProxyResult<ProxyConfig> {
        let config: ProxyConfig = serdeconv::from_toml_file(path)
            .map_err(|err| ProxyError::Config(err.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.password.is_empty() {
            return Err(ProxyError::Config("Password must not be empty".to_string()));
        }

        if !self.password.is_ascii() {
            return Err(ProxyError::Config("Password must be ASCII".to_string()));
        }

        // Extra slots make no sense unless slot 0 has a concrete address of
        // its own.
        if !self.bind_addr_ext_add.is_empty() {
            match &self.bind_addr_ext {
                Some(addr) if parse_ipv4(addr)? != Ipv4Addr::UNSPECIFIED => (),
                _ => {
                    return Err(ProxyError::Config(
                        "AdditionalExternalBindAddresses requires a non-wildcard ExternalBindAddress"
                            .to_string(),
                    ));
                }
            }
        }

        let addrs = self.external_addrs()?;
        for (idx, addr) in addrs.iter().enumerate() {
            if addrs[..idx].contains(addr) {
                return Err(ProxyError::Config(format!(
                    "duplicate external bind address '{}'",
                    addr
                )));
            }
        }

        compile_check(&self.calls_allowed)?;
        compile_check(&self.calls_denied)?;

        Ok(())
    }

    /// Slot source addresses, slot 0 first. One slot per entry.
    pub fn external_addrs(&self) -> ProxyResult<Vec<Ipv4Addr>> {
        let first = match &self.bind_addr_ext {
            Some(addr) => parse_ipv4(addr)?,
            None => Ipv4Addr::UNSPECIFIED,
        };

        let mut addrs = vec![first];
        for addr in &self.bind_addr_ext_add {
            addrs.push(parse_ipv4(addr)?);
        }

        Ok(addrs)
    }
}

fn parse_ipv4(addr: &str) -> ProxyResult<Ipv4Addr> {
    addr.parse()
        .map_err(|_| ProxyError::Config(format!("invalid IPv4 address '{}'", addr)))
}

fn compile_check(pattern: &Option<String>) -> ProxyResult<()> {
    if let Some(pattern) = pattern {
        Regex::new(pattern)
            .map_err(|err| ProxyError::Config(format!("invalid callsign pattern: {}", err)))?;
    }
    Ok(())
}
