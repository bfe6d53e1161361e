use std::path::PathBuf;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use utils::version;

/// Default directory where kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "ASCEND_CONFIG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the vNPU config file, e.g. /etc/ascend/ascend-config.yaml"
    )]
    pub config_file: PathBuf,

    #[arg(long, env = "NODE_NAME", help = "Name of the node this plugin runs on")]
    pub node_name: String,

    #[arg(
        long,
        env = "HW_LOG_LEVEL",
        default_value_t = 0,
        allow_negative_numbers = true,
        help = "Log level: -1 debug, 0 info, 1 warning, 2 error, 3 critical. RUST_LOG overrides it"
    )]
    pub log_level: i8,

    #[arg(
        long,
        env = "REPORT_TIME_OFFSET",
        default_value_t = 1,
        allow_negative_numbers = true,
        help = "Seconds added to the handshake timestamp reported on the node"
    )]
    pub report_time_offset: i64,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet device plugin directory"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        env = "ASCEND_DCMI_LIB_PATH",
        default_value = "libdcmi.so",
        help = "Path or name of the Ascend DCMI driver library"
    )]
    pub dcmi_lib_path: String,
}

impl DaemonArgs {
    pub fn log_level_filter(&self) -> LevelFilter {
        utils::logging::level_from_verbosity(self.log_level)
    }
}
