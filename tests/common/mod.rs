use std::time::Duration;

use aeroledger::node::{Node, NodeConfig, NodeHandle};
use aeroledger::transport::LocalNet;

pub const BOOTSTRAP: &str = "node-0.hangar.local:7000";

/// Quiet tracing setup for tests; RUST_LOG selects what shows.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config(addr: &str) -> NodeConfig {
    NodeConfig::new(addr, BOOTSTRAP)
        .with_difficulty(1)
        // Tests drive maintenance rounds by hand; keep the periodic task
        // out of the way.
        .with_maintenance_interval(Duration::from_secs(600))
}

pub fn cluster_addr(index: usize) -> String {
    format!("node-{index}.hangar.local:{}", 7000 + index)
}

/// Spawn `qty` nodes on one in-process network. Node 0 forms the ring and
/// the rest join through it, one at a time.
pub async fn make_cluster(net: &LocalNet, qty: usize) -> Vec<NodeHandle<LocalNet>> {
    let mut handles = Vec::new();
    for index in 0..qty {
        let config = test_config(&cluster_addr(index));
        let handle = Node::new(config, net.clone()).start().await;
        handles.push(handle);
    }
    handles
}

/// Run a few full maintenance rounds across the cluster, enough for ring
/// pointers and finger tables to settle.
pub async fn settle(handles: &[NodeHandle<LocalNet>]) {
    for _ in 0..3 {
        for handle in handles {
            handle.stabilize().await;
            handle.fix_fingers().await;
            handle.check_predecessor().await;
            handle.sync_peers().await;
        }
    }
}
