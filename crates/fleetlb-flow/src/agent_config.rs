//! Amphora agent configuration written to the config drive.
//!
//! The agent reads an INI file at boot. It carries the amphora's identity,
//! where its server certificate lives, and the health manager endpoints it
//! sends heartbeats to.

use std::collections::BTreeMap;

use fleetlb_core::AmphoraId;

use crate::config::ControllerConfig;
use crate::drivers::Certificate;

/// Config drive path of the agent configuration.
pub const AGENT_CONFIG_PATH: &str = "/etc/fleetlb/amphora-agent.conf";

/// Config drive path of the agent's server certificate.
pub const SERVER_CERT_PATH: &str = "/etc/fleetlb/certs/server.pem";

const BASE_PATH: &str = "/var/lib/fleetlb";

/// Renders the agent configuration for one amphora.
#[must_use]
pub fn render_agent_config(amphora_id: AmphoraId, config: &ControllerConfig) -> String {
    let mut lines = vec![
        "[DEFAULT]".to_string(),
        "debug = False".to_string(),
        String::new(),
        "[amphora_agent]".to_string(),
        format!("amphora_id = {amphora_id}"),
        format!("agent_server_cert = {SERVER_CERT_PATH}"),
        format!("transport = {}", config.transport),
        String::new(),
        "[health_manager]".to_string(),
        format!(
            "controller_ip_port_list = {}",
            config.controller_ip_port_list.join(", ")
        ),
        format!("heartbeat_interval = {}", config.heartbeat_interval.as_secs()),
    ];
    if let Some(key) = &config.heartbeat_key {
        lines.push(format!("heartbeat_key = {key}"));
    }
    lines.extend([
        String::new(),
        "[haproxy_amphora]".to_string(),
        format!("base_path = {BASE_PATH}"),
        format!("base_cert_dir = {BASE_PATH}/certs"),
    ]);
    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}

/// Builds the config drive contents for one amphora.
///
/// The certificate is only placed on the drive for certificate-based
/// transport.
#[must_use]
pub fn config_drive_files(
    amphora_id: AmphoraId,
    config: &ControllerConfig,
    cert: Option<&Certificate>,
) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    files.insert(
        AGENT_CONFIG_PATH.to_string(),
        render_agent_config(amphora_id, config),
    );
    if let Some(cert) = cert {
        files.insert(SERVER_CERT_PATH.to_string(), cert.pem.clone());
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn renders_every_section() {
        let config = ControllerConfig {
            controller_ip_port_list: vec!["192.0.2.1:5555".into(), "192.0.2.2:5555".into()],
            heartbeat_key: Some("insecure".into()),
            ..ControllerConfig::default()
        };
        let id = AmphoraId::generate();
        let text = render_agent_config(id, &config);

        for section in ["[DEFAULT]", "[amphora_agent]", "[health_manager]", "[haproxy_amphora]"] {
            assert!(text.contains(section), "missing {section}");
        }
        assert!(text.contains(&format!("amphora_id = {id}")));
        assert!(text.contains("controller_ip_port_list = 192.0.2.1:5555, 192.0.2.2:5555"));
        assert!(text.contains("heartbeat_interval = 10"));
        assert!(text.contains("heartbeat_key = insecure"));
    }

    #[test]
    fn heartbeat_key_is_omitted_when_unset() {
        let text = render_agent_config(AmphoraId::generate(), &ControllerConfig::default());
        assert!(!text.contains("heartbeat_key"));
    }

    #[test]
    fn certificate_goes_on_the_drive() {
        let cert = Certificate {
            pem: "-----BEGIN CERTIFICATE-----".into(),
            expiration: Utc::now(),
        };
        let config = ControllerConfig::default();
        let id = AmphoraId::generate();

        let with_cert = config_drive_files(id, &config, Some(&cert));
        assert_eq!(with_cert.get(SERVER_CERT_PATH), Some(&cert.pem));
        assert!(with_cert.contains_key(AGENT_CONFIG_PATH));

        let plain = config_drive_files(id, &config, None);
        assert_eq!(plain.len(), 1);
    }
}
