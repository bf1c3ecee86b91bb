use std::{collections::HashMap, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};

use crate::{cli::Cli, connection::ConnectionSettings};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub auth_base: String,
    pub media_url: Option<String>,
    pub announced_ip: Option<String>,
    pub agents: HashMap<String, String>,
    pub call_timeout: Duration,
    pub agent_connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub send_hello: bool,
    pub require_ingest_auth: bool,
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            heartbeat_interval: self.heartbeat_interval,
            send_hello: self.send_hello,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            auth_base: "http://127.0.0.1:4000".to_string(),
            media_url: None,
            announced_ip: None,
            agents: HashMap::new(),
            call_timeout: Duration::from_secs(10),
            agent_connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            send_hello: true,
            require_ingest_auth: false,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<Cli> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let agents = parse_agent_map(&cli.agents_json)?;
        if cli.heartbeat_secs == 0 {
            anyhow::bail!("heartbeat interval must be at least one second");
        }

        Ok(GatewayConfig {
            listen_addr,
            auth_base: cli.auth_base.trim_end_matches('/').to_string(),
            media_url: cli
                .media_url
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            announced_ip: cli.announced_ip.filter(|ip| !ip.is_empty()),
            agents,
            call_timeout: Duration::from_secs(cli.call_timeout_secs),
            agent_connect_timeout: Duration::from_secs(cli.agent_connect_timeout_secs),
            heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
            send_hello: cli.send_hello,
            require_ingest_auth: cli.require_ingest_auth,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

/// Parses the `tenantCode -> agent URL` map. Blank input means no agents.
pub fn parse_agent_map(json: &str) -> Result<HashMap<String, String>> {
    if json.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(json).context("AGENTS_JSON must be a JSON object of tenant code to URL")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["vitrine-gateway"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test_timeout::timeout]
    fn agent_map_parses_object() {
        let agents = parse_agent_map(r#"{"acme":"ws://10.0.0.5:9000","globex":"ws://agent"}"#).unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents["acme"], "ws://10.0.0.5:9000");
    }

    #[test_timeout::timeout]
    fn malformed_agent_map_is_an_error() {
        assert!(parse_agent_map("{acme: nope").is_err());
        assert!(parse_agent_map(r#"["ws://agent"]"#).is_err());
        assert!(parse_agent_map("  ").unwrap().is_empty());
    }

    #[test_timeout::timeout]
    fn cli_converts_into_config() {
        let config = GatewayConfig::try_from(cli(&[
            "--listen-addr",
            "127.0.0.1:8088",
            "--auth-base",
            "http://auth.local/",
            "--agents-json",
            r#"{"acme":"ws://agent"}"#,
            "--send-hello",
            "false",
        ]))
        .unwrap();
        assert_eq!(config.listen_addr.port(), 8088);
        assert_eq!(config.auth_base, "http://auth.local");
        assert_eq!(config.agents["acme"], "ws://agent");
        assert!(!config.send_hello);
        assert_eq!(config.connection_settings().heartbeat_interval, Duration::from_secs(30));
    }

    #[test_timeout::timeout]
    fn bad_listen_address_fails() {
        let err = GatewayConfig::try_from(cli(&["--listen-addr", "nowhere"])).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }
}
