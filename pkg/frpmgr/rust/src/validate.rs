// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::{Error, Result, ValidationError};
use crate::render::ConfigSyntax;
use crate::tunnel::{ProxyType, Role, Transport, TunnelConfig};
use crate::version::{Probe, Version};
use std::collections::HashSet;

const MAX_NAME_LEN: usize = 64;

/// What the installed FRP release understands. An undetectable version is
/// treated permissively: only shape checks apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    installed: Option<Version>,
}

impl Capabilities {
    pub fn new(installed: Option<Version>) -> Self {
        Self { installed }
    }

    pub fn from_probe(probe: &Probe) -> Self {
        Self::new(probe.version().cloned())
    }

    pub fn installed(&self) -> Option<&Version> {
        self.installed.as_ref()
    }

    /// Config file syntax the installed binary reads.
    pub fn syntax(&self) -> ConfigSyntax {
        match &self.installed {
            Some(v) if *v < TOML_SINCE => ConfigSyntax::Ini,
            _ => ConfigSyntax::Toml,
        }
    }

    fn missing(&self, since: Option<Version>) -> Option<&Version> {
        match (&self.installed, since) {
            (Some(installed), Some(since)) if *installed < since => Some(installed),
            _ => None,
        }
    }
}

/// Capabilities per role, since frps and frpc are probed separately.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    pub server: Capabilities,
    pub client: Capabilities,
}

impl CapabilitySet {
    pub fn for_role(&self, role: Role) -> &Capabilities {
        match role {
            Role::Server => &self.server,
            Role::Client => &self.client,
        }
    }
}

const TOML_SINCE: Version = Version::new(0, 52, 0);

fn transport_since(t: Transport) -> Option<Version> {
    match t {
        Transport::Tcp => None,
        Transport::Kcp => Some(Version::new(0, 12, 0)),
        Transport::Websocket => Some(Version::new(0, 21, 0)),
        Transport::Quic => Some(Version::new(0, 46, 0)),
        Transport::Wss => Some(Version::new(0, 50, 0)),
    }
}

fn proxy_since(kind: ProxyType) -> Option<Version> {
    match kind {
        ProxyType::Tcp | ProxyType::Udp | ProxyType::Http | ProxyType::Https | ProxyType::Stcp => {
            None
        }
        ProxyType::Xtcp => Some(Version::new(0, 14, 0)),
        ProxyType::Tcpmux => Some(Version::new(0, 37, 0)),
    }
}

/// Names become file names under the runtime directory.
pub fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("must be at most {MAX_NAME_LEN} characters"));
    }
    if name.starts_with('.') {
        return Err("must not start with '.'".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err("may only contain ASCII letters, digits, '-', '_' and '.'".to_string());
    }
    Ok(())
}

fn check_host(findings: &mut Vec<ValidationError>, field: &str, value: &Option<String>, required: bool) {
    match value {
        None if required => findings.push(ValidationError::error(field, "is required")),
        None => {}
        Some(host) if host.trim().is_empty() => {
            findings.push(ValidationError::error(field, "must not be empty"));
        }
        Some(host) if host.chars().any(|c| c.is_whitespace() || c == '/') => {
            findings.push(ValidationError::error(
                field,
                format!("{host:?} is not a host name or address"),
            ));
        }
        Some(_) => {}
    }
}

fn check_port(findings: &mut Vec<ValidationError>, field: &str, value: Option<u16>, required: bool) {
    match value {
        None if required => findings.push(ValidationError::error(field, "is required")),
        Some(0) => findings.push(ValidationError::error(field, "must be between 1 and 65535")),
        _ => {}
    }
}

fn check_secret(findings: &mut Vec<ValidationError>, value: &Option<String>) {
    let Some(token) = value else { return };
    if let Some(var) = token.strip_prefix("env:") {
        if var.is_empty() || !var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            findings.push(ValidationError::error(
                "connection.token",
                format!("{token:?} is not a valid environment variable reference"),
            ));
        }
    } else if let Some(path) = token.strip_prefix("file:") {
        if !path.starts_with('/') {
            findings.push(ValidationError::error(
                "connection.token",
                "file references must use an absolute path",
            ));
        }
    } else if token.is_empty() {
        findings.push(ValidationError::error("connection.token", "must not be empty"));
    }
}

fn check_client(t: &TunnelConfig, caps: &Capabilities, findings: &mut Vec<ValidationError>) {
    let c = &t.connection;
    check_host(findings, "connection.server_addr", &c.server_addr, true);
    check_port(findings, "connection.server_port", c.server_port, true);
    if c.bind_addr.is_some() || c.bind_port.is_some() {
        findings.push(ValidationError::error(
            "connection.bind_port",
            "bind settings only apply to server tunnels",
        ));
    }

    let mut seen = HashSet::new();
    for (i, proxy) in c.proxies.iter().enumerate() {
        let field = |f: &str| format!("connection.proxies[{i}].{f}");
        if let Err(e) = validate_name(&proxy.name) {
            findings.push(ValidationError::error(field("name"), e));
        } else if !seen.insert(proxy.name.as_str()) {
            findings.push(ValidationError::error(
                field("name"),
                format!("duplicate proxy name '{}'", proxy.name),
            ));
        }
        check_host(findings, &field("local_ip"), &Some(proxy.local_ip.clone()), true);
        check_port(findings, &field("local_port"), proxy.local_port, true);
        match proxy.kind {
            ProxyType::Tcp | ProxyType::Udp => {
                check_port(findings, &field("remote_port"), proxy.remote_port, true);
            }
            ProxyType::Http | ProxyType::Https | ProxyType::Tcpmux => {
                if proxy.custom_domains.is_empty() {
                    findings.push(ValidationError::error(
                        field("custom_domains"),
                        format!("{} proxies need at least one domain", proxy.kind.as_str()),
                    ));
                }
            }
            ProxyType::Stcp | ProxyType::Xtcp => {}
        }
        if let Some(installed) = caps.missing(proxy_since(proxy.kind)) {
            findings.push(ValidationError::error(
                field("type"),
                format!("{} proxies are not supported by frpc {installed}", proxy.kind.as_str()),
            ));
        }
    }
}

fn check_server(t: &TunnelConfig, findings: &mut Vec<ValidationError>) {
    let c = &t.connection;
    check_host(findings, "connection.bind_addr", &c.bind_addr, false);
    check_port(findings, "connection.bind_port", c.bind_port, true);
    if c.server_addr.is_some() || c.server_port.is_some() {
        findings.push(ValidationError::error(
            "connection.server_addr",
            "server settings only apply to client tunnels",
        ));
    }
    if !c.proxies.is_empty() {
        findings.push(ValidationError::error(
            "connection.proxies",
            "proxies only apply to client tunnels",
        ));
    }
}

/// Check one entry. `peers` is the rest of the registry, used for name
/// uniqueness. Returns every finding, warnings included.
pub fn check(t: &TunnelConfig, peers: &[TunnelConfig], caps: &Capabilities) -> Vec<ValidationError> {
    let mut findings = Vec::new();

    if let Err(e) = validate_name(&t.name) {
        findings.push(ValidationError::error("name", e));
    }
    if peers.iter().any(|p| p.name == t.name) {
        findings.push(ValidationError::error(
            "name",
            format!("'{}' is already registered", t.name),
        ));
    }

    match t.role {
        Role::Client => check_client(t, caps, &mut findings),
        Role::Server => check_server(t, &mut findings),
    }
    check_secret(&mut findings, &t.connection.token);

    let binary = t.role.binary_name();
    if let Some(installed) = caps.missing(transport_since(t.connection.protocol)) {
        findings.push(ValidationError::error(
            "connection.protocol",
            format!(
                "{} transport is not supported by {binary} {installed}",
                t.connection.protocol.as_str()
            ),
        ));
    }

    for tag in &t.tags {
        if tag.trim().is_empty() || tag.chars().any(char::is_whitespace) {
            findings.push(ValidationError::error(
                "tags",
                format!("{tag:?} must be a single non-empty word"),
            ));
        }
    }

    match (&t.config_version, caps.installed()) {
        (Some(declared), installed) => match declared.parse::<Version>() {
            Err(e) => findings.push(ValidationError::error("config_version", e)),
            Ok(declared) => {
                if let Some(installed) = installed
                    && !declared.same_minor(installed)
                {
                    findings.push(ValidationError::warning(
                        "config_version",
                        format!("written for {declared}, installed {binary} is {installed}"),
                    ));
                }
            }
        },
        (None, _) => {}
    }

    findings
}

/// [`check`], turning hard failures into [`Error::Validation`]. Warnings are
/// returned on success.
pub fn validate(
    t: &TunnelConfig,
    peers: &[TunnelConfig],
    caps: &Capabilities,
) -> Result<Vec<ValidationError>> {
    let findings = check(t, peers, caps);
    if findings.iter().any(ValidationError::is_hard) {
        return Err(Error::validation(&t.name, findings));
    }
    Ok(findings)
}
