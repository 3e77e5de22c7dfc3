//! Process configuration
//!
//! Every setting comes from a flag with an environment fallback so the daemon
//! can be configured from a DaemonSet's env block.

use std::time::Duration;

use clap::Args;

use crate::gpu::nvml::DEFAULT_NVML_LIBRARY;
use crate::Error;

/// Node label read by the NVIDIA device plugin to pick its config
pub const DEFAULT_DEVICE_PLUGIN_LABEL: &str = "nvidia.com/device-plugin.config";

/// Device plugin config used while no slice is carved
pub const DEFAULT_BASELINE_CONFIG: &str = "a100-40gb";

/// Device plugin config used while at least one slice is carved
pub const DEFAULT_CARVED_CONFIG: &str = "a100-40gb-1";

/// Prefix of per-pod extended resources and of our own labels
pub const DEFAULT_RESOURCE_PREFIX: &str = "migslicer.dev";

/// Controller settings as parsed from the command line
#[derive(Args, Clone, Debug)]
pub struct ControllerArgs {
    /// Name of the node this daemon runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Namespace holding MigNode records
    #[arg(long, env = "MIGSLICER_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Prefix for per-pod extended resources
    #[arg(long, env = "MIGSLICER_RESOURCE_PREFIX", default_value = DEFAULT_RESOURCE_PREFIX)]
    pub resource_prefix: String,

    /// Node label carrying the device plugin config name
    #[arg(long, env = "MIGSLICER_DEVICE_PLUGIN_LABEL", default_value = DEFAULT_DEVICE_PLUGIN_LABEL)]
    pub device_plugin_label: String,

    /// Device plugin config while no slices exist
    #[arg(long, env = "MIGSLICER_BASELINE_CONFIG", default_value = DEFAULT_BASELINE_CONFIG)]
    pub baseline_config: String,

    /// Device plugin config while slices exist
    #[arg(long, env = "MIGSLICER_CARVED_CONFIG", default_value = DEFAULT_CARVED_CONFIG)]
    pub carved_config: String,

    /// Path or soname of the NVML library
    #[arg(long, env = "NVML_LIBRARY", default_value = DEFAULT_NVML_LIBRARY)]
    pub nvml_library: String,

    /// Seconds between retries of allocations still waiting for a slice
    #[arg(long, env = "MIGSLICER_REQUEUE_SECS", default_value = "10")]
    pub requeue_secs: u64,
}

/// Validated controller configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Node this daemon manages
    pub node_name: String,
    /// Namespace of the MigNode record
    pub namespace: String,
    /// Prefix for per-pod extended resources
    pub resource_prefix: String,
    /// Device plugin config label key
    pub device_plugin_label: String,
    /// Label value with no slices carved
    pub baseline_config: String,
    /// Label value with slices carved
    pub carved_config: String,
    /// NVML library path
    pub nvml_library: String,
    /// Requeue interval while allocations are pending
    pub requeue_interval: Duration,
}

impl ControllerConfig {
    /// Label carrying the number of carved slices
    pub fn slice_count_label(&self) -> String {
        format!("{}/slices", self.resource_prefix)
    }

    /// Configuration used by unit tests
    #[cfg(test)]
    pub fn for_testing(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            namespace: "default".to_string(),
            resource_prefix: DEFAULT_RESOURCE_PREFIX.to_string(),
            device_plugin_label: DEFAULT_DEVICE_PLUGIN_LABEL.to_string(),
            baseline_config: DEFAULT_BASELINE_CONFIG.to_string(),
            carved_config: DEFAULT_CARVED_CONFIG.to_string(),
            nvml_library: DEFAULT_NVML_LIBRARY.to_string(),
            requeue_interval: Duration::from_secs(10),
        }
    }
}

impl TryFrom<ControllerArgs> for ControllerConfig {
    type Error = Error;

    fn try_from(args: ControllerArgs) -> Result<Self, Self::Error> {
        let node_name = args
            .node_name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::config("NODE_NAME must be set"))?;
        if args.resource_prefix.is_empty() || args.resource_prefix.contains('/') {
            return Err(Error::config(format!(
                "resource prefix '{}' must be a non-empty domain",
                args.resource_prefix
            )));
        }
        if args.baseline_config == args.carved_config {
            return Err(Error::config(
                "baseline and carved device plugin configs must differ",
            ));
        }
        if args.requeue_secs == 0 {
            return Err(Error::config("requeue interval must be at least one second"));
        }

        Ok(Self {
            node_name,
            namespace: args.namespace,
            resource_prefix: args.resource_prefix,
            device_plugin_label: args.device_plugin_label,
            baseline_config: args.baseline_config,
            carved_config: args.carved_config,
            nvml_library: args.nvml_library,
            requeue_interval: Duration::from_secs(args.requeue_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ControllerArgs,
    }

    fn parse(argv: &[&str]) -> Result<ControllerConfig, Error> {
        let cli = TestCli::try_parse_from(argv).expect("arguments should parse");
        ControllerConfig::try_from(cli.args)
    }

    #[test]
    fn defaults_match_the_device_plugin_conventions() {
        let config = parse(&["migslicer", "--node-name", "gpu-1"]).unwrap();
        assert_eq!(config.node_name, "gpu-1");
        assert_eq!(config.namespace, "default");
        assert_eq!(config.device_plugin_label, "nvidia.com/device-plugin.config");
        assert_eq!(config.baseline_config, "a100-40gb");
        assert_eq!(config.carved_config, "a100-40gb-1");
        assert_eq!(config.slice_count_label(), "migslicer.dev/slices");
        assert_eq!(config.requeue_interval, Duration::from_secs(10));
    }

    #[test]
    fn empty_node_name_is_rejected() {
        let err = parse(&["migslicer", "--node-name", ""]).unwrap_err();
        assert!(err.to_string().contains("NODE_NAME"));
    }

    #[test]
    fn identical_label_values_are_rejected() {
        let err = parse(&[
            "migslicer",
            "--node-name",
            "gpu-1",
            "--baseline-config",
            "same",
            "--carved-config",
            "same",
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn prefix_must_not_contain_a_slash() {
        assert!(parse(&[
            "migslicer",
            "--node-name",
            "gpu-1",
            "--resource-prefix",
            "a/b"
        ])
        .is_err());
    }
}
