use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Server;
use tonic::transport::Uri;
use tonic::Request;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::announce::Announcer;
use super::api::device_plugin_server::DevicePluginServer;
use super::api::registration_client::RegistrationClient;
use super::api::DevicePluginOptions;
use super::api::RegisterRequest;
use super::restart_budget::RestartBudget;
use super::restart_budget::RestartBudgetConfig;
use super::DevicePluginService;
use super::PluginError;
use super::PluginLifecycle;
use super::API_VERSION;
use super::KUBELET_SOCKET;
use crate::app::SupervisorEvent;
use crate::config::PluginTuning;
use crate::domain::allocation::AllocationCoordinator;
use crate::domain::inventory::DeviceInventory;
use crate::infrastructure::k8s::annotations::allocation_annotation;
use crate::infrastructure::k8s::ClusterClient;

/// Settings of the plugin server that don't come from the inventory.
#[derive(Debug, Clone)]
pub struct PluginServerConfig {
    pub node_name: String,
    /// Kubelet device plugin directory, holding `kubelet.sock`
    pub plugin_dir: PathBuf,
    pub report_time_offset: i64,
    pub tuning: PluginTuning,
}

struct RunningPlugin {
    token: CancellationToken,
    serve: JoinHandle<()>,
    announce: JoinHandle<()>,
    socket_path: PathBuf,
}

/// Device plugin endpoint for the local chip's resource.
pub struct PluginServer {
    config: PluginServerConfig,
    inventory: Arc<DeviceInventory>,
    cluster: Arc<dyn ClusterClient>,
    coordinator: Arc<AllocationCoordinator>,
    health: Arc<watch::Sender<Option<i32>>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    running: Option<RunningPlugin>,
}

impl PluginServer {
    pub fn new(
        config: PluginServerConfig,
        inventory: Arc<DeviceInventory>,
        cluster: Arc<dyn ClusterClient>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        let coordinator = Arc::new(AllocationCoordinator::new(
            config.node_name.clone(),
            allocation_annotation(&inventory.profile().common_word),
            inventory.clone(),
            cluster.clone(),
        ));
        Self {
            config,
            inventory,
            cluster,
            coordinator,
            health: Arc::new(watch::channel(None).0),
            events,
            running: None,
        }
    }

    /// Socket file name, also the endpoint announced to kubelet.
    pub fn endpoint(&self) -> String {
        format!("{}.sock", self.inventory.profile().common_word)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.plugin_dir.join(self.endpoint())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    async fn launch(&self, token: &CancellationToken) -> Result<RunningPlugin, Report<PluginError>> {
        self.inventory
            .refresh()
            .change_context(PluginError::InventoryRefresh)?;

        let socket_path = self.socket_path();
        let listener = bind_socket(&socket_path)?;
        info!("gRPC server is bound to: {}", socket_path.display());

        let service = DevicePluginService::new(
            self.inventory.clone(),
            self.coordinator.clone(),
            self.health.clone(),
            token.clone(),
        );
        let serve = tokio::spawn(serve_with_restarts(
            serve_rounds(listener, socket_path.clone(), service, token.clone()),
            self.config.tuning.restart_budget,
            self.config.tuning.restart_delay,
            token.clone(),
            self.events.clone(),
        ));

        let dial_timeout = self.config.tuning.dial_timeout;
        let answered = matches!(
            tokio::time::timeout(dial_timeout, create_uds_channel(&socket_path)).await,
            Ok(Ok(_))
        );
        if !answered {
            abort_serving(token, serve, &socket_path).await;
            return Err(Report::new(PluginError::ProbeFailed {
                path: socket_path.display().to_string(),
            }));
        }
        debug!("plugin socket answers");

        let kubelet_socket = self.config.plugin_dir.join(KUBELET_SOCKET);
        if let Err(e) = self.register_with_kubelet(&kubelet_socket).await {
            abort_serving(token, serve, &socket_path).await;
            return Err(e);
        }

        let announcer = Announcer::new(
            self.config.node_name.clone(),
            self.inventory.clone(),
            self.cluster.clone(),
            self.health.clone(),
            self.config.tuning.announce,
            self.config.report_time_offset,
        );
        let announce = {
            let token = token.clone();
            tokio::spawn(async move {
                info!("Starting announce task");
                announcer.run(token).await;
            })
        };

        Ok(RunningPlugin {
            token: token.clone(),
            serve,
            announce,
            socket_path,
        })
    }

    /// Register the plugin endpoint with kubelet.
    ///
    /// # Errors
    ///
    /// - [`PluginError::RegistrationFailed`] if kubelet can't be reached in
    ///   time or rejects the request
    pub async fn register_with_kubelet(
        &self,
        kubelet_socket: &Path,
    ) -> Result<(), Report<PluginError>> {
        info!(
            "registering device plugin with kubelet: {}",
            kubelet_socket.display()
        );

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint(),
            resource_name: self.inventory.profile().resource_name.clone(),
            options: Some(DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            }),
        };

        let register = async {
            let channel = create_uds_channel(kubelet_socket).await.map_err(|e| {
                Report::new(PluginError::RegistrationFailed {
                    message: e.to_string(),
                })
            })?;
            RegistrationClient::new(channel)
                .register(Request::new(request))
                .await
                .map_err(|status| {
                    Report::new(PluginError::RegistrationFailed {
                        message: status.message().to_string(),
                    })
                })?;
            Ok::<(), Report<PluginError>>(())
        };

        tokio::time::timeout(self.config.tuning.dial_timeout, register)
            .await
            .map_err(|_| {
                Report::new(PluginError::RegistrationFailed {
                    message: "timed out".to_string(),
                })
            })??;

        info!("successfully registered device plugin with kubelet");
        Ok(())
    }
}

#[async_trait]
impl PluginLifecycle for PluginServer {
    /// Refresh the inventory, serve the plugin socket, check it answers,
    /// register with kubelet and start announcing.
    ///
    /// On failure everything started so far is torn down again.
    async fn start(&mut self) -> Result<(), Report<PluginError>> {
        if self.running.is_some() {
            self.stop().await?;
        }

        let token = CancellationToken::new();
        let running = self.launch(&token).await?;
        self.running = Some(running);
        info!("device plugin started on {}", self.socket_path().display());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Report<PluginError>> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.token.cancel();
        for (name, task) in [("serve", running.serve), ("announce", running.announce)] {
            if let Err(e) = task.await {
                error!("{name} task failed during shutdown: {e}");
            }
        }

        remove_socket(&running.socket_path);
        info!("device plugin stopped");
        Ok(())
    }
}

/// Tear down a half-started plugin: stop serving and drop its socket file.
async fn abort_serving(token: &CancellationToken, serve: JoinHandle<()>, socket_path: &Path) {
    token.cancel();
    if let Err(e) = serve.await {
        error!("serve task failed during aborted start: {e}");
    }
    remove_socket(socket_path);
}

fn remove_socket(socket_path: &Path) {
    if let Err(e) = std::fs::remove_file(socket_path) {
        debug!("plugin socket {} not removed: {e}", socket_path.display());
    }
}

/// Bind the plugin socket, replacing a stale file left by a previous run.
fn bind_socket(path: &Path) -> Result<UnixListener, Report<PluginError>> {
    let bind_failed = || PluginError::BindFailed {
        path: path.display().to_string(),
    };
    if path.exists() {
        std::fs::remove_file(path).change_context_lazy(bind_failed)?;
    }
    UnixListener::bind(path).change_context_lazy(bind_failed)
}

type ServeRound = Pin<Box<dyn Future<Output = Result<(), Report<PluginError>>> + Send>>;

/// Build a factory yielding one gRPC serve round per call. The first round
/// uses `listener`; later rounds bind `socket_path` again.
fn serve_rounds(
    listener: UnixListener,
    socket_path: PathBuf,
    service: DevicePluginService,
    token: CancellationToken,
) -> impl FnMut() -> ServeRound {
    let mut listener = Some(listener);
    move || -> ServeRound {
        let listener = listener.take();
        let socket_path = socket_path.clone();
        let service = service.clone();
        let token = token.clone();
        Box::pin(async move {
            let listener = match listener {
                Some(listener) => listener,
                None => match bind_socket(&socket_path) {
                    Ok(listener) => listener,
                    Err(e) => return Err(e),
                },
            };
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        token.cancelled().await;
                        info!("shutting down gRPC server");
                    },
                )
                .await
                .change_context(PluginError::ServeFailed)
        })
    }
}

/// Run serve rounds until `token` is cancelled, restarting after each round
/// that ends on its own. Reports a fatal event once the crash budget is spent.
async fn serve_with_restarts<F, Fut>(
    mut serve_round: F,
    budget: RestartBudgetConfig,
    restart_delay: Duration,
    token: CancellationToken,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Report<PluginError>>>,
{
    let mut budget = RestartBudget::new(budget, Instant::now());
    loop {
        let result = serve_round().await;
        if token.is_cancelled() {
            debug!("gRPC server stopped");
            return;
        }

        match result {
            Ok(()) => warn!("gRPC server exited unexpectedly"),
            Err(e) => error!("gRPC server crashed: {e:?}"),
        }

        if let Err(e) = budget.record_crash(Instant::now()) {
            error!("giving up on gRPC server: {e:?}");
            if events
                .send(SupervisorEvent::Fatal {
                    message: e.to_string(),
                })
                .is_err()
            {
                warn!("supervisor is gone, fatal event dropped");
            }
            return;
        }

        warn!(
            "restarting gRPC server in {restart_delay:?}, crash {} in window",
            budget.crashes()
        );
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

/// Connect a gRPC channel over a Unix socket.
async fn create_uds_channel(socket_path: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();

    // the URL is a placeholder, the connector dials the socket
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use test_log::test;
    use tonic::Response;
    use tonic::Status;

    use super::*;
    use crate::plugin::api::device_plugin_client::DevicePluginClient;
    use crate::plugin::api::registration_server::Registration;
    use crate::plugin::api::registration_server::RegistrationServer;
    use crate::plugin::api::Empty;
    use crate::plugin::announce::AnnounceCadence;
    use crate::testing::FakeClusterClient;
    use crate::testing::FakeDevice;
    use crate::testing::FakeDeviceQuery;
    use crate::testing;

    struct FakeKubelet {
        requests: mpsc::UnboundedSender<RegisterRequest>,
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> Result<Response<Empty>, Status> {
            let _ = self.requests.send(request.into_inner());
            Ok(Response::new(Empty {}))
        }
    }

    fn spawn_kubelet(dir: &Path) -> mpsc::UnboundedReceiver<RegisterRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = UnixListener::bind(dir.join(KUBELET_SOCKET)).expect("bind kubelet socket");
        tokio::spawn(async move {
            Server::builder()
                .add_service(RegistrationServer::new(FakeKubelet { requests: tx }))
                .serve_with_incoming(tokio_stream::wrappers::UnixListenerStream::new(listener))
                .await
        });
        rx
    }

    fn plugin_server(
        dir: &Path,
    ) -> (
        PluginServer,
        Arc<FakeClusterClient>,
        mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        let query = Arc::new(FakeDeviceQuery::new(vec![
            FakeDevice::new(0, 0, "uuid-a"),
            FakeDevice::new(1, 1, "uuid-b"),
        ]));
        let inventory = Arc::new(DeviceInventory::new(query, testing::profile_910b()));
        let cluster = Arc::new(FakeClusterClient::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = PluginServerConfig {
            node_name: "node-1".to_string(),
            plugin_dir: dir.to_path_buf(),
            report_time_offset: 1,
            tuning: PluginTuning {
                dial_timeout: Duration::from_secs(2),
                announce: AnnounceCadence {
                    initial: Duration::from_millis(10),
                    ..Default::default()
                },
                ..Default::default()
            },
        };
        let server = PluginServer::new(config, inventory, cluster.clone(), events_tx);
        (server, cluster, events_rx)
    }

    #[test(tokio::test)]
    async fn start_registers_and_serves() {
        let dir = TempDir::new().expect("temp dir");
        let mut registrations = spawn_kubelet(dir.path());
        let (mut server, cluster, _events) = plugin_server(dir.path());

        server.start().await.expect("start should succeed");
        assert!(server.is_running());

        let request = registrations.recv().await.expect("registration");
        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "Ascend910B.sock");
        assert_eq!(request.resource_name, "huawei.com/Ascend910B");
        assert_eq!(
            request.options,
            Some(DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            })
        );

        let channel = create_uds_channel(&dir.path().join("Ascend910B.sock"))
            .await
            .expect("plugin socket should answer");
        let mut client = DevicePluginClient::new(channel);
        let mut stream = client
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("list and watch")
            .into_inner();
        let snapshot = stream
            .next()
            .await
            .expect("snapshot")
            .expect("snapshot ok");
        assert_eq!(snapshot.devices.len(), 8);
        drop(stream);
        drop(client);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!cluster.patches().is_empty());

        server.stop().await.expect("stop should succeed");
        assert!(!server.is_running());
        assert!(!dir.path().join("Ascend910B.sock").exists());

        // stopping twice is a no-op
        server.stop().await.expect("second stop");
    }

    #[test(tokio::test)]
    async fn start_replaces_stale_socket() {
        let dir = TempDir::new().expect("temp dir");
        let _registrations = spawn_kubelet(dir.path());
        std::fs::write(dir.path().join("Ascend910B.sock"), b"stale").expect("stale file");
        let (mut server, _cluster, _events) = plugin_server(dir.path());

        server.start().await.expect("start should succeed");
        server.stop().await.expect("stop");
    }

    #[test(tokio::test)]
    async fn restart_registers_again() {
        let dir = TempDir::new().expect("temp dir");
        let mut registrations = spawn_kubelet(dir.path());
        let (mut server, _cluster, _events) = plugin_server(dir.path());

        server.start().await.expect("first start");
        server.stop().await.expect("stop");
        server.start().await.expect("second start");

        registrations.recv().await.expect("first registration");
        registrations.recv().await.expect("second registration");
        server.stop().await.expect("stop");
    }

    #[test(tokio::test)]
    async fn start_fails_without_kubelet() {
        let dir = TempDir::new().expect("temp dir");
        let (mut server, _cluster, _events) = plugin_server(dir.path());

        let err = server.start().await.expect_err("kubelet is missing");
        assert!(matches!(
            err.current_context(),
            PluginError::RegistrationFailed { .. }
        ));
        assert!(!server.is_running());
        assert!(!dir.path().join("Ascend910B.sock").exists());
    }

    #[test(tokio::test(start_paused = true))]
    async fn crashing_server_exhausts_budget() {
        let rounds = Arc::new(AtomicU32::new(0));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let budget = RestartBudgetConfig {
            max_crashes: 2,
            window: Duration::from_secs(3600),
        };

        let counter = rounds.clone();
        serve_with_restarts(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Report::new(PluginError::ServeFailed)) }
            },
            budget,
            Duration::from_secs(1),
            CancellationToken::new(),
            events_tx,
        )
        .await;

        assert_eq!(rounds.load(Ordering::SeqCst), 3);
        assert!(matches!(
            events_rx.recv().await,
            Some(SupervisorEvent::Fatal { .. })
        ));
    }

    #[test(tokio::test(start_paused = true))]
    async fn cancelled_server_is_not_restarted() {
        let rounds = Arc::new(AtomicU32::new(0));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let counter = rounds.clone();
        let round_token = token.clone();
        serve_with_restarts(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                round_token.cancel();
                async { Ok(()) }
            },
            RestartBudgetConfig::default(),
            Duration::from_secs(1),
            token,
            events_tx,
        )
        .await;

        assert_eq!(rounds.load(Ordering::SeqCst), 1);
        assert!(events_rx.try_recv().is_err());
    }
}
