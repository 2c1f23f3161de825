// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Renders a [`TunnelConfig`] into the file `frps -c` / `frpc -c` reads.
//! Releases since v0.52.0 read TOML; older ones only understand INI.

use crate::error::{Error, Result};
use crate::tunnel::{Role, Transport, TunnelConfig};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSyntax {
    Toml,
    Ini,
}

impl ConfigSyntax {
    pub fn extension(self) -> &'static str {
        match self {
            ConfigSyntax::Toml => "toml",
            ConfigSyntax::Ini => "ini",
        }
    }
}

/// Resolve a token reference (`env:NAME`, `file:/path`, or literal).
pub fn resolve_secret(tunnel: &str, reference: &str) -> Result<String> {
    if let Some(var) = reference.strip_prefix("env:") {
        return std::env::var(var).map_err(|_| {
            Error::invalid(
                tunnel,
                "connection.token",
                format!("environment variable {var} is not set"),
            )
        });
    }
    if let Some(path) = reference.strip_prefix("file:") {
        return std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| {
                Error::invalid(tunnel, "connection.token", format!("reading {path}: {e}"))
            });
    }
    Ok(reference.to_string())
}

fn toml_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn ini_value(tunnel: &str, field: &str, s: &str) -> Result<String> {
    if s.contains(['\n', '\r']) {
        return Err(Error::invalid(
            tunnel,
            field,
            "line breaks cannot be expressed in INI configs",
        ));
    }
    Ok(s.to_string())
}

pub fn render(t: &TunnelConfig, syntax: ConfigSyntax) -> Result<String> {
    let token = match &t.connection.token {
        Some(reference) => Some(resolve_secret(&t.name, reference)?),
        None => None,
    };
    match syntax {
        ConfigSyntax::Toml => Ok(render_toml(t, token.as_deref())),
        ConfigSyntax::Ini => render_ini(t, token.as_deref()),
    }
}

// Writing into a String cannot fail; the results of `writeln!` are ignored.
fn render_toml(t: &TunnelConfig, token: Option<&str>) -> String {
    let c = &t.connection;
    let mut out = format!("# managed by frpmgr: {}\n", t.name);

    match t.role {
        Role::Server => {
            if let Some(addr) = &c.bind_addr {
                let _ = writeln!(out, "bindAddr = {}", toml_str(addr));
            }
            if let Some(port) = c.bind_port {
                let _ = writeln!(out, "bindPort = {port}");
                match c.protocol {
                    Transport::Kcp => {
                        let _ = writeln!(out, "kcpBindPort = {port}");
                    }
                    Transport::Quic => {
                        let _ = writeln!(out, "quicBindPort = {port}");
                    }
                    _ => {}
                }
            }
        }
        Role::Client => {
            if let Some(addr) = &c.server_addr {
                let _ = writeln!(out, "serverAddr = {}", toml_str(addr));
            }
            if let Some(port) = c.server_port {
                let _ = writeln!(out, "serverPort = {port}");
            }
            let _ = writeln!(out, "transport.protocol = {}", toml_str(c.protocol.as_str()));
        }
    }

    if let Some(token) = token {
        let _ = writeln!(out, "auth.method = \"token\"");
        let _ = writeln!(out, "auth.token = {}", toml_str(token));
    }

    for proxy in &c.proxies {
        let _ = writeln!(out, "\n[[proxies]]");
        let _ = writeln!(out, "name = {}", toml_str(&proxy.name));
        let _ = writeln!(out, "type = {}", toml_str(proxy.kind.as_str()));
        let _ = writeln!(out, "localIP = {}", toml_str(&proxy.local_ip));
        if let Some(port) = proxy.local_port {
            let _ = writeln!(out, "localPort = {port}");
        }
        if let Some(port) = proxy.remote_port {
            let _ = writeln!(out, "remotePort = {port}");
        }
        if !proxy.custom_domains.is_empty() {
            let domains: Vec<String> = proxy.custom_domains.iter().map(|d| toml_str(d)).collect();
            let _ = writeln!(out, "customDomains = [{}]", domains.join(", "));
        }
    }
    out
}

fn render_ini(t: &TunnelConfig, token: Option<&str>) -> Result<String> {
    let c = &t.connection;
    let name = t.name.as_str();
    let mut out = format!("; managed by frpmgr: {name}\n[common]\n");

    match t.role {
        Role::Server => {
            if let Some(addr) = &c.bind_addr {
                let _ = writeln!(out, "bind_addr = {}", ini_value(name, "connection.bind_addr", addr)?);
            }
            if let Some(port) = c.bind_port {
                let _ = writeln!(out, "bind_port = {port}");
                match c.protocol {
                    Transport::Kcp => {
                        let _ = writeln!(out, "kcp_bind_port = {port}");
                    }
                    Transport::Quic => {
                        let _ = writeln!(out, "quic_bind_port = {port}");
                    }
                    _ => {}
                }
            }
        }
        Role::Client => {
            if let Some(addr) = &c.server_addr {
                let _ = writeln!(
                    out,
                    "server_addr = {}",
                    ini_value(name, "connection.server_addr", addr)?
                );
            }
            if let Some(port) = c.server_port {
                let _ = writeln!(out, "server_port = {port}");
            }
            let _ = writeln!(out, "protocol = {}", c.protocol.as_str());
        }
    }

    if let Some(token) = token {
        let _ = writeln!(out, "token = {}", ini_value(name, "connection.token", token)?);
    }

    for proxy in &c.proxies {
        let _ = writeln!(out, "\n[{}]", proxy.name);
        let _ = writeln!(out, "type = {}", proxy.kind.as_str());
        let _ = writeln!(out, "local_ip = {}", proxy.local_ip);
        if let Some(port) = proxy.local_port {
            let _ = writeln!(out, "local_port = {port}");
        }
        if let Some(port) = proxy.remote_port {
            let _ = writeln!(out, "remote_port = {port}");
        }
        if !proxy.custom_domains.is_empty() {
            let _ = writeln!(out, "custom_domains = {}", proxy.custom_domains.join(","));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tunnel::tests::{client, server};

    #[test]
    fn test_client_toml() {
        let out = render(&client("web-a"), ConfigSyntax::Toml).unwrap();
        assert!(out.contains("serverAddr = \"frp.example.com\"\n"));
        assert!(out.contains("serverPort = 7000\n"));
        assert!(out.contains("transport.protocol = \"tcp\"\n"));
        assert!(out.contains("auth.token = \"s3cret\"\n"));
        assert!(out.contains("[[proxies]]\nname = \"ssh\"\ntype = \"tcp\"\nlocalIP = \"127.0.0.1\"\nlocalPort = 22\nremotePort = 6000\n"));
    }

    #[test]
    fn test_client_ini() {
        let out = render(&client("web-a"), ConfigSyntax::Ini).unwrap();
        assert!(out.contains("[common]\nserver_addr = frp.example.com\nserver_port = 7000\nprotocol = tcp\ntoken = s3cret\n"));
        assert!(out.contains("[ssh]\ntype = tcp\nlocal_ip = 127.0.0.1\nlocal_port = 22\nremote_port = 6000\n"));
    }

    #[test]
    fn test_server_kcp_port() {
        let mut t = server("edge");
        t.connection.protocol = Transport::Kcp;
        let toml = render(&t, ConfigSyntax::Toml).unwrap();
        assert!(toml.contains("bindPort = 7000\nkcpBindPort = 7000\n"));
        let ini = render(&t, ConfigSyntax::Ini).unwrap();
        assert!(ini.contains("bind_port = 7000\nkcp_bind_port = 7000\n"));
    }

    #[test]
    fn test_toml_escaping() {
        assert_eq!(toml_str(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(toml_str("line\nbreak"), r#""line\nbreak""#);
    }

    #[test]
    fn test_env_secret() {
        let mut t = client("web-a");
        t.connection.token = Some("env:FRPMGR_TEST_TOKEN".to_string());

        let out = temp_env::with_var("FRPMGR_TEST_TOKEN", Some("from-env"), || {
            render(&t, ConfigSyntax::Toml).unwrap()
        });
        assert!(out.contains("auth.token = \"from-env\""));

        let err = temp_env::with_var_unset("FRPMGR_TEST_TOKEN", || {
            render(&t, ConfigSyntax::Toml).unwrap_err()
        });
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_file_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "from-file\n").unwrap();

        let mut t = client("web-a");
        t.connection.token = Some(format!("file:{}", path.display()));
        let out = render(&t, ConfigSyntax::Ini).unwrap();
        assert!(out.contains("token = from-file\n"));
    }

    #[test]
    fn test_ini_rejects_line_breaks() {
        let mut t = client("web-a");
        t.connection.token = Some("multi\nline".to_string());
        assert!(render(&t, ConfigSyntax::Ini).is_err());
        assert!(render(&t, ConfigSyntax::Toml).is_ok());
    }
}
