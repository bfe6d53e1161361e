use std::path::Path;

use anyhow::anyhow;
use anyhow::Result;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::plugin::PluginLifecycle;
use crate::plugin::KUBELET_SOCKET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Hangup,
    Interrupt,
    Terminate,
    Quit,
}

/// Everything that can make the supervisor act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// `kubelet.sock` was created again
    KubeletRestarted,
    Signal(ProcessSignal),
    /// The plugin can't recover on its own
    Fatal { message: String },
    WatchError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    Restart,
    Shutdown,
    Fail(String),
    Ignore,
}

pub fn reaction(event: &SupervisorEvent) -> Reaction {
    match event {
        SupervisorEvent::KubeletRestarted | SupervisorEvent::Signal(ProcessSignal::Hangup) => {
            Reaction::Restart
        }
        SupervisorEvent::Signal(_) => Reaction::Shutdown,
        SupervisorEvent::Fatal { message } => Reaction::Fail(message.clone()),
        SupervisorEvent::WatchError { .. } => Reaction::Ignore,
    }
}

/// Drives the plugin through restarts until shutdown.
pub struct Supervisor<P> {
    plugin: P,
    state: SupervisorState,
}

impl<P: PluginLifecycle> Supervisor<P> {
    pub fn new(plugin: P) -> Self {
        Self {
            plugin,
            state: SupervisorState::Stopped,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Start the plugin and react to `events` until a shutdown signal, a
    /// fatal event or the end of the event stream.
    ///
    /// # Errors
    ///
    /// Fails if the plugin can't be started or a fatal event arrives.
    pub async fn run(&mut self, mut events: mpsc::UnboundedReceiver<SupervisorEvent>) -> Result<()> {
        self.state = SupervisorState::Starting;
        loop {
            self.state = match self.state {
                SupervisorState::Starting => {
                    info!("starting device plugin");
                    if let Err(e) = self.plugin.start().await {
                        error!("failed to start device plugin: {e:?}");
                        self.shutdown().await;
                        return Err(anyhow!("failed to start device plugin: {e}"));
                    }
                    SupervisorState::Running
                }
                SupervisorState::Running => match events.recv().await {
                    None => {
                        warn!("event sources closed");
                        SupervisorState::Stopping
                    }
                    Some(event) => {
                        debug!("supervisor event: {event:?}");
                        match reaction(&event) {
                            Reaction::Restart => {
                                info!("restarting device plugin after {event:?}");
                                SupervisorState::Restarting
                            }
                            Reaction::Shutdown => {
                                info!("received {event:?}, shutting down");
                                SupervisorState::Stopping
                            }
                            Reaction::Fail(message) => {
                                error!("fatal: {message}");
                                self.shutdown().await;
                                return Err(anyhow!(message));
                            }
                            Reaction::Ignore => {
                                warn!("ignoring {event:?}");
                                SupervisorState::Running
                            }
                        }
                    }
                },
                SupervisorState::Restarting => {
                    if let Err(e) = self.plugin.stop().await {
                        warn!("failed to stop device plugin before restart: {e:?}");
                    }
                    SupervisorState::Starting
                }
                SupervisorState::Stopping => {
                    self.shutdown().await;
                    SupervisorState::Stopped
                }
                SupervisorState::Stopped => return Ok(()),
            };
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.plugin.stop().await {
            error!("failed to stop device plugin: {e:?}");
        }
        self.state = SupervisorState::Stopped;
    }
}

pub fn is_kubelet_socket_created(event: &Event, kubelet_socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|p| p == kubelet_socket)
}

/// Watch `plugin_dir` and report every re-creation of `kubelet.sock`.
///
/// The watch lasts as long as the returned watcher lives.
///
/// # Errors
///
/// Fails if the directory can't be watched.
pub fn watch_kubelet_socket(
    plugin_dir: &Path,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) -> Result<RecommendedWatcher> {
    let kubelet_socket = plugin_dir.join(KUBELET_SOCKET);
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) if is_kubelet_socket_created(&event, &kubelet_socket) => {
                    info!("{} created, kubelet restarted", kubelet_socket.display());
                    SupervisorEvent::KubeletRestarted
                }
                Ok(event) => {
                    debug!("Filesystem event: {:?}", event);
                    return;
                }
                Err(e) => {
                    error!("Filesystem watch error: {:?}", e);
                    SupervisorEvent::WatchError {
                        message: e.to_string(),
                    }
                }
            };
            // receiver dropped means the supervisor is done
            let _ = events.send(event);
        },
        Config::default(),
    )?;
    watcher.watch(plugin_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Forward SIGHUP, SIGINT, SIGTERM and SIGQUIT as supervisor events.
///
/// # Errors
///
/// Fails if a signal handler can't be installed.
pub fn forward_signals(events: mpsc::UnboundedSender<SupervisorEvent>) -> Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = hangup.recv() => ProcessSignal::Hangup,
                _ = interrupt.recv() => ProcessSignal::Interrupt,
                _ = terminate.recv() => ProcessSignal::Terminate,
                _ = quit.recv() => ProcessSignal::Quit,
            };
            info!("received signal {received:?}");
            if events.send(SupervisorEvent::Signal(received)).is_err() {
                return;
            }
        }
    }))
}
