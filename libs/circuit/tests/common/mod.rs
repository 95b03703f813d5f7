#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use circuit::Circuit;
use circuit_fabric::MemoryTransport;

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    let settled = tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "condition not reached in time");
}

/// Connected circuit on a shared in-memory medium
pub async fn node(id: &str, transport: &Arc<MemoryTransport>) -> Circuit {
    let circuit = Circuit::new(id, transport.clone());
    circuit.connect().await.unwrap();
    circuit
}

/// Whether `circuit` currently resolves `channel` to `owner`
pub fn knows(circuit: &Circuit, channel: &str, owner: &str) -> bool {
    circuit
        .directory()
        .map(|d| d.owners(channel).iter().any(|o| o == owner))
        .unwrap_or(false)
}
