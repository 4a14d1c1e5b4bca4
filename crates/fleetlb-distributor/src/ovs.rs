//! Open vSwitch backend.
//!
//! [`OvsSwitch`] drives a local OVS instance through `ovs-vsctl`,
//! `ovs-ofctl` and `ip link`. Table reads go through `--format=json` so map
//! columns such as `external_ids` decode without ad-hoc parsing.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::error::{SwitchError, SwitchResult};
use crate::openflow::{FlowSpec, GroupSpec};
use crate::switch::Switch;

const VSCTL: &str = "ovs-vsctl";
const OFCTL: &str = "ovs-ofctl";
const SYS_CLASS_NET: &str = "/sys/class/net";

/// [`Switch`] backed by the local Open vSwitch.
#[derive(Debug, Clone)]
pub struct OvsSwitch {
    protocol: String,
    sys_class_net: PathBuf,
}

impl OvsSwitch {
    /// Creates a backend programming flows with the given OpenFlow protocol.
    #[must_use]
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            sys_class_net: PathBuf::from(SYS_CLASS_NET),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> SwitchResult<String> {
        let command = format!("{program} {}", args.join(" "));
        tracing::debug!(%command, "running switch command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| SwitchError::new(&command, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SwitchError::new(command, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn vsctl(&self, args: &[&str]) -> SwitchResult<String> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.run(VSCTL, &args).await
    }

    async fn ofctl(&self, verb: &str, bridge: &str, spec: String) -> SwitchResult<String> {
        let args = vec![
            "-O".to_string(),
            self.protocol.clone(),
            verb.to_string(),
            bridge.to_string(),
            spec,
        ];
        self.run(OFCTL, &args).await
    }

    async fn read_external_ids(
        &self,
        table: &str,
        record: &str,
    ) -> SwitchResult<BTreeMap<String, String>> {
        let raw = self
            .vsctl(&[
                "--format=json",
                "--columns=external_ids",
                "list",
                table,
                record,
            ])
            .await?;
        parse_external_ids(&raw).map_err(|message| SwitchError::new(format!("{VSCTL} list {table}"), message))
    }

    async fn write_external_ids(
        &self,
        table: &str,
        record: &str,
        ids: &BTreeMap<String, String>,
    ) -> SwitchResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["set".to_string(), table.to_string(), record.to_string()];
        args.extend(
            ids.iter()
                .map(|(key, value)| format!("external_ids:{key}=\"{value}\"")),
        );
        self.run(VSCTL, &args).await.map(|_| ())
    }
}

/// Decodes the `external_ids` map from `ovs-vsctl --format=json list` output.
///
/// The output looks like
/// `{"data":[[["map",[["k","v"]]]]],"headings":["external_ids"]}`.
fn parse_external_ids(raw: &str) -> Result<BTreeMap<String, String>, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let pairs = value
        .pointer("/data/0/0/1")
        .and_then(Value::as_array)
        .ok_or_else(|| "external_ids column missing".to_string())?;
    pairs
        .iter()
        .map(|pair| match pair.as_array().map(Vec::as_slice) {
            Some([Value::String(k), Value::String(v)]) => Ok((k.clone(), v.clone())),
            _ => Err(format!("malformed external_ids entry {pair}")),
        })
        .collect()
}

#[async_trait]
impl Switch for OvsSwitch {
    async fn ping(&self) -> SwitchResult<()> {
        self.vsctl(&["show"]).await.map(|_| ())
    }

    async fn list_bridges(&self) -> SwitchResult<Vec<String>> {
        let out = self.vsctl(&["list-br"]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn add_bridge(&self, bridge: &str, protocol: &str) -> SwitchResult<()> {
        let protocols = format!("protocols={protocol}");
        self.vsctl(&["add-br", bridge, "--", "set", "bridge", bridge, &protocols])
            .await
            .map(|_| ())
    }

    async fn delete_bridge(&self, bridge: &str) -> SwitchResult<()> {
        self.vsctl(&["--if-exists", "del-br", bridge]).await.map(|_| ())
    }

    async fn bridge_external_ids(&self, bridge: &str) -> SwitchResult<BTreeMap<String, String>> {
        self.read_external_ids("bridge", bridge).await
    }

    async fn set_bridge_external_ids(
        &self,
        bridge: &str,
        ids: &BTreeMap<String, String>,
    ) -> SwitchResult<()> {
        self.write_external_ids("bridge", bridge, ids).await
    }

    async fn remove_bridge_external_id(&self, bridge: &str, key: &str) -> SwitchResult<()> {
        self.vsctl(&["remove", "bridge", bridge, "external_ids", key])
            .await
            .map(|_| ())
    }

    async fn root_external_ids(&self) -> SwitchResult<BTreeMap<String, String>> {
        self.read_external_ids("Open_vSwitch", ".").await
    }

    async fn set_root_external_ids(&self, ids: &BTreeMap<String, String>) -> SwitchResult<()> {
        self.write_external_ids("Open_vSwitch", ".", ids).await
    }

    async fn find_interface_by_mac(&self, mac: &str) -> SwitchResult<Option<String>> {
        let wanted = mac.to_ascii_lowercase();
        let command = format!("read {}", self.sys_class_net.display());
        let mut entries = tokio::fs::read_dir(&self.sys_class_net)
            .await
            .map_err(|e| SwitchError::new(&command, e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SwitchError::new(&command, e.to_string()))?
        {
            let Ok(address) = tokio::fs::read_to_string(entry.path().join("address")).await else {
                continue;
            };
            if address.trim().to_ascii_lowercase() == wanted {
                return Ok(Some(entry.file_name().to_string_lossy().into_owned()));
            }
        }
        Ok(None)
    }

    async fn add_port(&self, bridge: &str, iface: &str) -> SwitchResult<()> {
        self.vsctl(&["add-port", bridge, iface]).await.map(|_| ())
    }

    async fn get_ofport(&self, _bridge: &str, iface: &str) -> SwitchResult<Option<u32>> {
        let out = self.vsctl(&["get", "Interface", iface, "ofport"]).await?;
        Ok(out.parse::<i64>().ok().and_then(|p| u32::try_from(p).ok()))
    }

    async fn add_group(&self, bridge: &str, group: &GroupSpec) -> SwitchResult<()> {
        self.ofctl("add-group", bridge, group.to_string())
            .await
            .map(|_| ())
    }

    async fn modify_group(&self, bridge: &str, group: &GroupSpec) -> SwitchResult<()> {
        self.ofctl("mod-group", bridge, group.to_string())
            .await
            .map(|_| ())
    }

    async fn delete_flows(&self, bridge: &str) -> SwitchResult<()> {
        let args = vec![
            "-O".to_string(),
            self.protocol.clone(),
            "del-flows".to_string(),
            bridge.to_string(),
        ];
        self.run(OFCTL, &args).await.map(|_| ())
    }

    async fn add_flow(&self, bridge: &str, flow: &FlowSpec) -> SwitchResult<()> {
        self.ofctl("add-flow", bridge, flow.to_string())
            .await
            .map(|_| ())
    }

    async fn set_link(&self, iface: &str, up: bool) -> SwitchResult<()> {
        let state = if up { "up" } else { "down" };
        let args = vec![
            "link".to_string(),
            "set".to_string(),
            iface.to_string(),
            state.to_string(),
        ];
        self.run("ip", &args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_external_ids_json() {
        let raw = r#"{"data":[[["map",[["dist-lb-id","abc"],["slot-0","amp,02:00:00:00:00:01"]]]]],"headings":["external_ids"]}"#;
        let ids = parse_external_ids(raw).unwrap();
        assert_eq!(ids["dist-lb-id"], "abc");
        assert_eq!(ids["slot-0"], "amp,02:00:00:00:00:01");
    }

    #[test]
    fn empty_map_parses() {
        let raw = r#"{"data":[[["map",[]]]],"headings":["external_ids"]}"#;
        assert!(parse_external_ids(raw).unwrap().is_empty());
    }

    #[test]
    fn malformed_output_is_an_error() {
        assert!(parse_external_ids("not json").is_err());
        assert!(parse_external_ids(r#"{"data":[]}"#).is_err());
    }
}
