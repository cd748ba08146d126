//! Shared fixtures for integration tests

#![allow(dead_code)]

use quota_core::{spawn_notary, Config, Identity, Network, Node, NodeBuilder, NotaryHandle};
use std::sync::Arc;

/// A notary and a set of in-memory nodes on one network
pub struct TestNetwork {
    pub network: Network,
    pub notary: NotaryHandle,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            network: Network::new(),
            notary: spawn_notary(Identity::from_seed("Notary", &[0xAA; 32]), 64),
        }
    }

    /// Start an in-memory node with a short session timeout
    pub fn node(&self, name: &str, seed: u8) -> Node {
        self.builder(name, seed).start().unwrap()
    }

    pub fn builder(&self, name: &str, seed: u8) -> NodeBuilder {
        let mut config = Config::default();
        config.party_name = name.to_string();
        config.flow.session_timeout_ms = 2_000;

        NodeBuilder::new(
            Identity::from_seed(name, &[seed; 32]),
            Arc::new(self.notary.clone()),
            self.network.clone(),
        )
        .config(config)
    }
}
