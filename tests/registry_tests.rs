use async_trait::async_trait;
use quadracode::registry::{AgentRegistryIntegration, RegistryClient};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct MockRegistry {
    fail_register: AtomicBool,
    registers: AtomicU32,
    heartbeats: AtomicU32,
    unregisters: AtomicU32,
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn register_agent(&self, agent_id: &str, _host: &str, _port: u16) -> String {
        self.registers.fetch_add(1, Ordering::SeqCst);
        if self.fail_register.load(Ordering::SeqCst) {
            "registry request failed: 503".to_string()
        } else {
            format!("agent {} registered", agent_id)
        }
    }

    async fn heartbeat(&self, agent_id: &str, _status: &str) -> String {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        format!("heartbeat ok for {}", agent_id)
    }

    async fn unregister_agent(&self, agent_id: &str) -> String {
        self.unregisters.fetch_add(1, Ordering::SeqCst);
        format!("agent {} unregistered", agent_id)
    }
}

#[tokio::test]
async fn start_registers_and_shutdown_unregisters() {
    let registry = Arc::new(MockRegistry::default());
    let integration =
        AgentRegistryIntegration::new("agent-1", "agent-1", 8123, 15, registry.clone());

    integration.start().await;
    assert!(integration.is_registered());
    assert_eq!(registry.registers.load(Ordering::SeqCst), 1);

    integration.shutdown().await;
    assert!(!integration.is_registered());
    assert_eq!(registry.unregisters.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_registration_is_not_fatal_and_skips_unregister() {
    let registry = Arc::new(MockRegistry::default());
    registry.fail_register.store(true, Ordering::SeqCst);

    let integration =
        AgentRegistryIntegration::new("agent-1", "agent-1", 8123, 15, registry.clone());
    integration.start().await;

    // Registration failed but the integration is alive and will retry from
    // the heartbeat loop.
    assert!(!integration.is_registered());
    assert_eq!(registry.registers.load(Ordering::SeqCst), 1);

    integration.shutdown().await;
    // Never registered, so nothing to unregister.
    assert_eq!(registry.unregisters.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_is_idempotent() {
    let registry = Arc::new(MockRegistry::default());
    let integration =
        AgentRegistryIntegration::new("agent-1", "agent-1", 8123, 15, registry.clone());

    integration.start().await;
    integration.start().await;
    assert_eq!(registry.registers.load(Ordering::SeqCst), 1);

    integration.shutdown().await;
}

#[test]
fn heartbeat_interval_is_clamped_to_the_minimum() {
    let registry = Arc::new(MockRegistry::default());
    let fast = AgentRegistryIntegration::new("agent-1", "agent-1", 8123, 1, registry.clone());
    assert_eq!(fast.interval().as_secs(), 5);

    let slow = AgentRegistryIntegration::new("agent-1", "agent-1", 8123, 60, registry);
    assert_eq!(slow.interval().as_secs(), 60);
}
