//! Shared fixtures for the integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Mutex;
use std::time::Duration;

use controller_core::{EventHandler, Object};

pub const NODE_NAME_INDEX: &str = "nodeName";

/// Minimal namespaced object with a node assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct TestPod {
    pub namespace: String,
    pub name: String,
    pub node: String,
    pub version: String,
}

impl Object for TestPod {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn resource_version(&self) -> Option<&str> {
        Some(&self.version)
    }
}

pub fn pod(namespace: &str, name: &str, node: &str, version: u64) -> TestPod {
    TestPod {
        namespace: namespace.to_string(),
        name: name.to_string(),
        node: node.to_string(),
        version: version.to_string(),
    }
}

pub fn node_name_index(pod: &TestPod) -> Vec<String> {
    vec![pod.node.clone()]
}

/// Records handler calls as `add:ns/name`, `update:ns/name`, `delete:ns/name`.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        let events = self.events.lock().unwrap();
        events.iter().filter(|e| *e == event).count()
    }

    fn push(&self, kind: &str, pod: &TestPod) {
        let event = format!("{kind}:{}", pod.key());
        self.events.lock().unwrap().push(event);
    }
}

impl EventHandler<TestPod> for Recorder {
    fn on_add(&self, obj: &TestPod) {
        self.push("add", obj);
    }

    fn on_update(&self, _old: &TestPod, new: &TestPod) {
        self.push("update", new);
    }

    fn on_delete(&self, obj: &TestPod) {
        self.push("delete", obj);
    }
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
