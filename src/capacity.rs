//! Node capacity advertisement
//!
//! Two things make a carved slice visible to the kubelet side:
//! - a per-pod extended resource `<prefix>/<pod-name>` in the Node's status
//!   capacity, added when the slice is ready and removed on teardown
//! - the device plugin config label, switched between a baseline and a carved
//!   value from the number of prepared partitions, next to a slice-count label

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::controller::NodeClient;
use crate::Error;

/// Quantity advertised for a per-pod resource
pub const CAPACITY_QUANTITY: &str = "1";

/// Direction of a capacity patch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityChange {
    /// Advertise the resource
    Add,
    /// Withdraw the resource
    Remove,
}

/// Escape one JSON pointer reference token
pub fn escape_json_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Extended resource name for a pod's slice
pub fn resource_name(prefix: &str, pod_name: &str) -> String {
    format!("{}/{}", prefix, pod_name)
}

/// JSON pointer of an extended resource in the Node status capacity
pub fn capacity_path(resource: &str) -> String {
    format!("/status/capacity/{}", escape_json_pointer(resource))
}

/// JSON patch document adding or removing one extended resource
pub fn capacity_patch(resource: &str, change: CapacityChange) -> Result<json_patch::Patch, Error> {
    let path = capacity_path(resource);
    let doc = match change {
        CapacityChange::Add => serde_json::json!([
            { "op": "add", "path": path, "value": CAPACITY_QUANTITY }
        ]),
        CapacityChange::Remove => serde_json::json!([
            { "op": "remove", "path": path }
        ]),
    };
    serde_json::from_value(doc)
        .map_err(|e| Error::serialization(format!("capacity patch for {}: {}", resource, e)))
}

/// Labels the Node should carry for the given number of prepared partitions
pub fn desired_labels(config: &ControllerConfig, prepared_count: usize) -> BTreeMap<String, String> {
    let plugin_config = if prepared_count == 0 {
        &config.baseline_config
    } else {
        &config.carved_config
    };
    BTreeMap::from([
        (config.device_plugin_label.clone(), plugin_config.clone()),
        (config.slice_count_label(), prepared_count.to_string()),
    ])
}

/// Labels from `desired` whose value differs from `current`
pub fn label_changes(
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Bring the Node's capacity labels in line with the prepared partition count.
///
/// Returns whether a patch was sent.
pub async fn sync_capacity_labels(
    client: &dyn NodeClient,
    config: &ControllerConfig,
    prepared_count: usize,
) -> Result<bool, Error> {
    let current = client.node_labels(&config.node_name).await?;
    let changes = label_changes(&current, &desired_labels(config, prepared_count));
    if changes.is_empty() {
        debug!(prepared = prepared_count, "node capacity labels already current");
        return Ok(false);
    }
    client.patch_node_labels(&config.node_name, &changes).await?;
    info!(prepared = prepared_count, labels = ?changes, "updated node capacity labels");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockNodeClient;

    #[test]
    fn pointer_tokens_escape_tilde_before_slash() {
        assert_eq!(escape_json_pointer("migslicer.dev/vllm-0"), "migslicer.dev~1vllm-0");
        assert_eq!(escape_json_pointer("a~/b"), "a~0~1b");
        assert_eq!(escape_json_pointer("plain"), "plain");
    }

    #[test]
    fn add_patch_targets_status_capacity() {
        let resource = resource_name("migslicer.dev", "vllm-0");
        let patch = capacity_patch(&resource, CapacityChange::Add).unwrap();
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{
                "op": "add",
                "path": "/status/capacity/migslicer.dev~1vllm-0",
                "value": "1"
            }])
        );
    }

    #[test]
    fn remove_patch_has_no_value() {
        let patch = capacity_patch("migslicer.dev/vllm-0", CapacityChange::Remove).unwrap();
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json[0]["op"], "remove");
        assert!(json[0].get("value").is_none());
    }

    #[test]
    fn label_value_follows_prepared_count() {
        let config = ControllerConfig::for_testing("gpu-1");
        let empty = desired_labels(&config, 0);
        assert_eq!(empty["nvidia.com/device-plugin.config"], "a100-40gb");
        assert_eq!(empty["migslicer.dev/slices"], "0");

        let carved = desired_labels(&config, 3);
        assert_eq!(carved["nvidia.com/device-plugin.config"], "a100-40gb-1");
        assert_eq!(carved["migslicer.dev/slices"], "3");
    }

    #[test]
    fn only_differing_labels_are_changed() {
        let config = ControllerConfig::for_testing("gpu-1");
        let current = BTreeMap::from([
            (
                "nvidia.com/device-plugin.config".to_string(),
                "a100-40gb-1".to_string(),
            ),
            ("migslicer.dev/slices".to_string(), "1".to_string()),
            ("kubernetes.io/hostname".to_string(), "gpu-1".to_string()),
        ]);
        let changes = label_changes(&current, &desired_labels(&config, 2));
        assert_eq!(
            changes,
            BTreeMap::from([("migslicer.dev/slices".to_string(), "2".to_string())])
        );
        assert!(label_changes(&current, &desired_labels(&config, 1)).is_empty());
    }

    #[tokio::test]
    async fn sync_skips_patch_when_labels_match() {
        let config = ControllerConfig::for_testing("gpu-1");
        let current = desired_labels(&config, 0);
        let mut client = MockNodeClient::new();
        client
            .expect_node_labels()
            .returning(move |_| Ok(current.clone()));
        client.expect_patch_node_labels().never();

        let patched = sync_capacity_labels(&client, &config, 0).await.unwrap();
        assert!(!patched);
    }

    #[tokio::test]
    async fn sync_patches_when_first_slice_appears() {
        let config = ControllerConfig::for_testing("gpu-1");
        let current = desired_labels(&config, 0);
        let mut client = MockNodeClient::new();
        client
            .expect_node_labels()
            .returning(move |_| Ok(current.clone()));
        client
            .expect_patch_node_labels()
            .withf(|node, labels| {
                node == "gpu-1" && labels["nvidia.com/device-plugin.config"] == "a100-40gb-1"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let patched = sync_capacity_labels(&client, &config, 1).await.unwrap();
        assert!(patched);
    }
}
