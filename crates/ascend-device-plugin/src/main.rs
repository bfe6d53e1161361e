use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use ascend_device_plugin::app::forward_signals;
use ascend_device_plugin::app::watch_kubelet_socket;
use ascend_device_plugin::app::Supervisor;
use ascend_device_plugin::config::DaemonArgs;
use ascend_device_plugin::config::PluginTuning;
use ascend_device_plugin::config::VnpuConfig;
use ascend_device_plugin::driver::DcmiDeviceQuery;
use ascend_device_plugin::inventory::DeviceInventory;
use ascend_device_plugin::k8s::KubeClusterClient;
use ascend_device_plugin::plugin::server::PluginServerConfig;
use ascend_device_plugin::plugin::PluginServer;
use clap::Parser;
use tokio::sync::mpsc;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let args = DaemonArgs::parse();
    utils::logging::init(args.log_level_filter());

    tracing::info!("Starting ascend device plugin {}", &**version::VERSION);

    run_daemon(args).await.inspect_err(|e| {
        tracing::error!("ascend device plugin exited: {e:?}");
    })
}

async fn run_daemon(args: DaemonArgs) -> Result<()> {
    let config = VnpuConfig::load(&args.config_file).map_err(|e| anyhow!("{e:?}"))?;

    let driver = DcmiDeviceQuery::open(&args.dcmi_lib_path).map_err(|e| anyhow!("{e:?}"))?;
    let inventory = DeviceInventory::load(Arc::new(driver), &config).map_err(|e| anyhow!("{e:?}"))?;
    let inventory = Arc::new(inventory);

    let cluster = KubeClusterClient::connect(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let plugin = PluginServer::new(
        PluginServerConfig {
            node_name: args.node_name.clone(),
            plugin_dir: args.device_plugin_path.clone(),
            report_time_offset: args.report_time_offset,
            tuning: PluginTuning::default(),
        },
        inventory,
        Arc::new(cluster),
        events_tx.clone(),
    );

    let _watcher = watch_kubelet_socket(&args.device_plugin_path, events_tx.clone())?;
    let signals = forward_signals(events_tx)?;

    let result = Supervisor::new(plugin).run(events_rx).await;
    signals.abort();
    result
}
