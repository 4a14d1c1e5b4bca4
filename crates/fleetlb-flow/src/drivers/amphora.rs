//! Amphora agent capability and the recording noop driver.
//!
//! The real transport is an HTTPS client talking to the agent on each
//! amphora; only the capability and an in-memory driver live here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use fleetlb_core::{Amphora, AmphoraId, Listener, ListenerId, LoadBalancer, VrrpGroup};

use super::network::{AmphoraNetworkConfig, Port};
use super::{DriverError, DriverResult, FailureSet};

/// Amphora agent transport.
#[async_trait]
pub trait AmphoraDriver: Send + Sync {
    /// Completes agent bootstrap once the instance is reachable.
    async fn finalize(&self, amphora: &Amphora) -> DriverResult<()>;

    /// Pushes listener configuration and reloads the proxy.
    async fn update_listeners(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
        listeners: &[Listener],
    ) -> DriverResult<()>;

    /// Starts listeners.
    async fn start_listeners(&self, amphora: &Amphora, listeners: &[Listener]) -> DriverResult<()>;

    /// Stops listeners.
    async fn stop_listeners(&self, amphora: &Amphora, listeners: &[Listener]) -> DriverResult<()>;

    /// Removes one listener.
    async fn delete_listener(&self, amphora: &Amphora, listener: &Listener) -> DriverResult<()>;

    /// Configures the VIP inside the amphora after the port is plugged.
    ///
    /// Returns [`DriverError::AlreadyPlugged`] if the agent already has it.
    async fn post_vip_plug(
        &self,
        amphora: &Amphora,
        lb: &LoadBalancer,
        config: &AmphoraNetworkConfig,
    ) -> DriverResult<()>;

    /// Configures a newly plugged member network inside the amphora.
    ///
    /// Returns [`DriverError::AlreadyPlugged`] if the agent already has it.
    async fn post_network_plug(&self, amphora: &Amphora, port: &Port) -> DriverResult<()>;

    /// Replaces the agent's server certificate.
    async fn upload_cert(&self, amphora: &Amphora, pem: &str) -> DriverResult<()>;

    /// Returns the interface holding the VRRP address.
    async fn get_vrrp_interface(&self, amphora: &Amphora) -> DriverResult<String>;

    /// Pushes VRRP configuration.
    async fn update_vrrp_conf(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
        group: &VrrpGroup,
    ) -> DriverResult<()>;

    /// Starts VRRP.
    async fn start_vrrp(&self, amphora: &Amphora) -> DriverResult<()>;

    /// Stops VRRP.
    async fn stop_vrrp(&self, amphora: &Amphora) -> DriverResult<()>;

    /// Returns the MAC of the amphora's VIP interface.
    async fn get_mac(&self, amphora: &Amphora) -> DriverResult<String>;

    /// Stops the amphora answering ARP for the VIP.
    async fn disable_arp(&self, amphora: &Amphora) -> DriverResult<()>;
}

/// One recorded agent call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmphoraCall {
    /// Trait method name.
    pub operation: &'static str,
    /// Target amphora.
    pub amphora_id: AmphoraId,
}

#[derive(Debug, Default)]
struct NoopAmphoraState {
    calls: Vec<AmphoraCall>,
    running: BTreeMap<AmphoraId, BTreeSet<ListenerId>>,
    certs: BTreeMap<AmphoraId, String>,
    already_plugged: BTreeSet<&'static str>,
}

/// Amphora driver that records every call.
#[derive(Debug, Default)]
pub struct NoopAmphoraDriver {
    state: Mutex<NoopAmphoraState>,
    failures: FailureSet,
}

/// Derives a stable MAC for an amphora.
#[must_use]
pub fn amphora_mac(amphora_id: AmphoraId) -> String {
    let bytes = amphora_id.as_uuid().into_bytes();
    format!("fa:16:3e:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

impl NoopAmphoraDriver {
    /// Creates an empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes an operation fail, by trait method name.
    pub fn fail(&self, operation: &'static str) {
        self.failures.fail(operation);
    }

    /// Undoes [`fail`](Self::fail).
    pub fn heal(&self, operation: &'static str) {
        self.failures.heal(operation);
    }

    /// Makes `post_vip_plug` or `post_network_plug` report the network as
    /// already plugged.
    pub fn report_already_plugged(&self, operation: &'static str) {
        self.lock().already_plugged.insert(operation);
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<AmphoraCall> {
        self.lock().calls.clone()
    }

    /// Returns the recorded calls of one operation.
    #[must_use]
    pub fn calls_to(&self, operation: &str) -> Vec<AmphoraId> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .map(|call| call.amphora_id)
            .collect()
    }

    /// Returns the listeners running on an amphora.
    #[must_use]
    pub fn running_listeners(&self, amphora_id: AmphoraId) -> BTreeSet<ListenerId> {
        self.lock()
            .running
            .get(&amphora_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the certificate last uploaded to an amphora.
    #[must_use]
    pub fn cert_of(&self, amphora_id: AmphoraId) -> Option<String> {
        self.lock().certs.get(&amphora_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NoopAmphoraState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record(&self, operation: &'static str, amphora: &Amphora) -> DriverResult<()> {
        self.failures.check("amphora", operation)?;
        let mut state = self.lock();
        state.calls.push(AmphoraCall {
            operation,
            amphora_id: amphora.id,
        });
        if state.already_plugged.contains(operation) {
            return Err(DriverError::AlreadyPlugged {
                target: amphora.id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AmphoraDriver for NoopAmphoraDriver {
    async fn finalize(&self, amphora: &Amphora) -> DriverResult<()> {
        self.record("finalize", amphora)
    }

    async fn update_listeners(
        &self,
        _lb: &LoadBalancer,
        amphora: &Amphora,
        _listeners: &[Listener],
    ) -> DriverResult<()> {
        self.record("update_listeners", amphora)
    }

    async fn start_listeners(&self, amphora: &Amphora, listeners: &[Listener]) -> DriverResult<()> {
        self.record("start_listeners", amphora)?;
        self.lock()
            .running
            .entry(amphora.id)
            .or_default()
            .extend(listeners.iter().map(|l| l.id));
        Ok(())
    }

    async fn stop_listeners(&self, amphora: &Amphora, listeners: &[Listener]) -> DriverResult<()> {
        self.record("stop_listeners", amphora)?;
        if let Some(running) = self.lock().running.get_mut(&amphora.id) {
            for listener in listeners {
                running.remove(&listener.id);
            }
        }
        Ok(())
    }

    async fn delete_listener(&self, amphora: &Amphora, listener: &Listener) -> DriverResult<()> {
        self.record("delete_listener", amphora)?;
        if let Some(running) = self.lock().running.get_mut(&amphora.id) {
            running.remove(&listener.id);
        }
        Ok(())
    }

    async fn post_vip_plug(
        &self,
        amphora: &Amphora,
        _lb: &LoadBalancer,
        _config: &AmphoraNetworkConfig,
    ) -> DriverResult<()> {
        self.record("post_vip_plug", amphora)
    }

    async fn post_network_plug(&self, amphora: &Amphora, _port: &Port) -> DriverResult<()> {
        self.record("post_network_plug", amphora)
    }

    async fn upload_cert(&self, amphora: &Amphora, pem: &str) -> DriverResult<()> {
        self.record("upload_cert", amphora)?;
        self.lock().certs.insert(amphora.id, pem.to_string());
        Ok(())
    }

    async fn get_vrrp_interface(&self, amphora: &Amphora) -> DriverResult<String> {
        self.record("get_vrrp_interface", amphora)?;
        Ok("eth1".to_string())
    }

    async fn update_vrrp_conf(
        &self,
        _lb: &LoadBalancer,
        amphora: &Amphora,
        _group: &VrrpGroup,
    ) -> DriverResult<()> {
        self.record("update_vrrp_conf", amphora)
    }

    async fn start_vrrp(&self, amphora: &Amphora) -> DriverResult<()> {
        self.record("start_vrrp", amphora)
    }

    async fn stop_vrrp(&self, amphora: &Amphora) -> DriverResult<()> {
        self.record("stop_vrrp", amphora)
    }

    async fn get_mac(&self, amphora: &Amphora) -> DriverResult<String> {
        self.record("get_mac", amphora)?;
        Ok(amphora_mac(amphora.id))
    }

    async fn disable_arp(&self, amphora: &Amphora) -> DriverResult<()> {
        self.record("disable_arp", amphora)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlb_core::{LoadBalancerId, ListenerProtocol};

    #[tokio::test]
    async fn listener_lifecycle_is_tracked() {
        let driver = NoopAmphoraDriver::new();
        let amp = Amphora::new(AmphoraId::generate());
        let listener = Listener::new(
            ListenerId::generate(),
            LoadBalancerId::generate(),
            ListenerProtocol::Tcp,
            80,
        );
        driver
            .start_listeners(&amp, std::slice::from_ref(&listener))
            .await
            .unwrap();
        assert!(driver.running_listeners(amp.id).contains(&listener.id));
        driver.delete_listener(&amp, &listener).await.unwrap();
        assert!(driver.running_listeners(amp.id).is_empty());
        assert_eq!(driver.calls_to("start_listeners"), vec![amp.id]);
    }

    #[tokio::test]
    async fn already_plugged_is_reported_after_recording() {
        let driver = NoopAmphoraDriver::new();
        driver.report_already_plugged("post_network_plug");
        let amp = Amphora::new(AmphoraId::generate());
        let port = Port {
            id: "p".into(),
            network_id: "n".into(),
            mac_address: "fa:16:3e:00:00:01".into(),
            ip_address: None,
        };
        let err = driver.post_network_plug(&amp, &port).await.unwrap_err();
        assert!(err.is_already_plugged());
        assert_eq!(driver.calls().len(), 1);
    }

    #[test]
    fn macs_are_stable() {
        let id = AmphoraId::generate();
        assert_eq!(amphora_mac(id), amphora_mac(id));
        assert!(amphora_mac(id).starts_with("fa:16:3e:"));
    }
}
