//! Login destinations.

use std::collections::HashMap;

use crate::config::{Config, DEFAULT_PORT};
use crate::connection::session_data::AliasCache;

/// Protocol prefix used for routed destinations.
pub const TCP_PROTOCOL: &str = "tcp";

/// A redirection the server sent during login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingInfo {
    /// Protocol code; `0` is TCP.
    pub protocol: u8,
    /// Destination port.
    pub port: u16,
    /// Destination server.
    pub server_name: String,
}

impl RoutingInfo {
    /// Create TCP routing to `server_name:port`.
    pub fn tcp(server_name: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: 0,
            port,
            server_name: server_name.into(),
        }
    }
}

/// Where a login attempt goes.
///
/// `user_server_name` is what the caller configured; the extended and resolved
/// names are derived once, through the alias table, before the first attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server name as configured, `host[\instance][,port]`.
    pub user_server_name: String,
    /// Protocol prefix as configured.
    pub user_protocol: Option<String>,
    /// `protocol:server` after alias resolution.
    pub extended_server_name: Option<String>,
    /// Server after alias resolution, `host[\instance][,port]`.
    pub resolved_server_name: String,
    /// The configured server this destination was routed from.
    pub pre_routing_server_name: Option<String>,
    default_port: u16,
}

impl ServerInfo {
    /// Build from a `host[\instance][,port]` name.
    pub fn new(name: impl Into<String>, protocol: Option<String>) -> Self {
        let name = name.into();
        Self {
            resolved_server_name: name.clone(),
            user_server_name: name,
            user_protocol: protocol,
            extended_server_name: None,
            pre_routing_server_name: None,
            default_port: DEFAULT_PORT,
        }
    }

    /// The primary server of a configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut name = config.host.clone();
        if let Some(instance) = &config.instance {
            name.push('\\');
            name.push_str(instance);
        }
        if config.port != DEFAULT_PORT {
            name.push_str(&format!(",{}", config.port));
        }
        Self::new(name, config.protocol.clone())
    }

    /// The destination of a routing redirect.
    pub fn routed(routing: &RoutingInfo, pre_routing_server_name: &str) -> Self {
        let name = format!("{},{}", routing.server_name, routing.port);
        let mut info = Self::new(name.clone(), Some(TCP_PROTOCOL.to_string()));
        info.pre_routing_server_name = Some(pre_routing_server_name.to_string());
        info.set_derived_names(Some(TCP_PROTOCOL), &name);
        info
    }

    /// Set the extended and resolved names.
    pub fn set_derived_names(&mut self, protocol: Option<&str>, server_name: &str) {
        self.extended_server_name = Some(match protocol {
            Some(p) if !p.is_empty() => format!("{p}:{server_name}"),
            _ => server_name.to_string(),
        });
        self.resolved_server_name = server_name.to_string();
    }

    /// Derive names through the alias table, once.
    ///
    /// Lookups are memoized in `cache` under the configured name.
    pub fn resolve_extended_name(&mut self, aliases: &HashMap<String, String>, cache: &AliasCache) {
        if self.extended_server_name.is_some() {
            return;
        }
        let (host, protocol) = match cache.get(&self.user_server_name) {
            Some(hit) => hit,
            None => {
                let resolved = lookup_alias(aliases, &self.user_server_name, self.user_protocol.as_deref());
                cache.insert(self.user_server_name.clone(), resolved.clone());
                resolved
            }
        };
        self.set_derived_names(protocol.as_deref(), &host);
    }

    /// Host part of the resolved name.
    #[must_use]
    pub fn host(&self) -> &str {
        let name = self.resolved_server_name.as_str();
        let end = name.find([',', '\\']).unwrap_or(name.len());
        &name[..end]
    }

    /// Instance part of the resolved name.
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        let (_, rest) = self.resolved_server_name.split_once('\\')?;
        Some(rest.split(',').next().unwrap_or(rest))
    }

    /// Port of the resolved name.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.resolved_server_name
            .rsplit_once(',')
            .and_then(|(_, p)| p.trim().parse().ok())
            .unwrap_or(self.default_port)
    }
}

fn lookup_alias(
    aliases: &HashMap<String, String>,
    name: &str,
    protocol: Option<&str>,
) -> (String, Option<String>) {
    match aliases.get(&name.to_lowercase()) {
        Some(target) => match target.split_once(':') {
            Some((p, host)) if !p.is_empty() && !p.contains(['\\', ',']) => {
                (host.to_string(), Some(p.to_lowercase()))
            }
            _ => (target.clone(), protocol.map(str::to_string)),
        },
        None => (name.to_string(), protocol.map(str::to_string)),
    }
}
