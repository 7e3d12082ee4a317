//! Client core: one explicit state per client, driven by intents and by the
//! timers of a single runtime task.

mod runtime;
mod state;
#[cfg(test)]
mod tests;

pub use runtime::ClientRuntime;
pub use state::{Arbiter, CaptureRequest, ClientNotice, ClientState, Effect, Phase};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::SharedClock;
use crate::config::CamlinkConfig;
use crate::error::{CamlinkError, TransportError};
use crate::quality::QualityPreset;
use crate::transport::{
    websocket_url, EventTransport, FailoverPolicy, FailoverTransport, HttpBackend,
    PollingTransport, SharedTransport,
};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub frame_refresh_interval: Duration,
    pub settle_delay: Duration,
    pub offline_threshold: Duration,
    pub event_timeout: Duration,
    pub polling_timeout: Duration,
    pub default_preset: QualityPreset,
}

impl From<&CamlinkConfig> for ClientSettings {
    fn from(config: &CamlinkConfig) -> Self {
        Self {
            poll_interval: config.session.poll_interval(),
            heartbeat_interval: config.session.heartbeat_interval(),
            stale_after: config.session.stale_after(),
            frame_refresh_interval: config.session.frame_refresh_interval(),
            settle_delay: config.capture.settle_delay(),
            offline_threshold: config.liveness.offline_threshold(),
            event_timeout: config.capture.event_timeout(),
            polling_timeout: config.capture.polling_schedule().timeout,
            default_preset: config.quality.default_preset,
        }
    }
}

/// What a viewer can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    StartLive,
    StopLive,
    Capture,
    SelectQuality(QualityPreset),
    Shutdown,
}

/// Cloneable front end of a running client core
#[derive(Clone)]
pub struct ClientHandle {
    intents: mpsc::Sender<Intent>,
    state: watch::Receiver<ClientState>,
    notices: broadcast::Sender<ClientNotice>,
    cancellation_token: CancellationToken,
}

impl ClientHandle {
    pub async fn start_live(&self) -> Result<(), CamlinkError> {
        self.send(Intent::StartLive).await
    }

    pub async fn stop_live(&self) -> Result<(), CamlinkError> {
        self.send(Intent::StopLive).await
    }

    pub async fn capture(&self) -> Result<(), CamlinkError> {
        self.send(Intent::Capture).await
    }

    pub async fn select_quality(&self, preset: QualityPreset) -> Result<(), CamlinkError> {
        self.send(Intent::SelectQuality(preset)).await
    }

    /// Stop the core; live view is switched off explicitly on the way out
    pub async fn shutdown(&self) -> Result<(), CamlinkError> {
        self.send(Intent::Shutdown).await
    }

    /// Stop without the orderly live-off write
    pub fn abort(&self) {
        self.cancellation_token.cancel();
    }

    pub async fn send(&self, intent: Intent) -> Result<(), CamlinkError> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| CamlinkError::component("client", "client core is not running"))
    }

    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    pub fn state_updates(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<ClientNotice> {
        self.notices.subscribe()
    }
}

/// Start a client core on `transport`
pub fn spawn_client(
    transport: SharedTransport,
    clock: SharedClock,
    settings: ClientSettings,
) -> (ClientHandle, JoinHandle<()>) {
    let (intent_tx, intent_rx) = mpsc::channel(32);
    let (state_tx, state_rx) = watch::channel(Arbiter::new(settings.default_preset).state().clone());
    let (notice_tx, _) = broadcast::channel(64);
    let cancellation_token = CancellationToken::new();

    let runtime = ClientRuntime::new(
        transport,
        clock,
        settings,
        intent_rx,
        state_tx,
        notice_tx.clone(),
        cancellation_token.clone(),
    );
    let task = tokio::spawn(runtime.run());

    let handle = ClientHandle {
        intents: intent_tx,
        state: state_rx,
        notices: notice_tx,
        cancellation_token,
    };
    (handle, task)
}

/// Event channel to the hub with polling fallback, as configured
pub fn connect_transport(
    config: &CamlinkConfig,
    clock: SharedClock,
) -> Result<SharedTransport, TransportError> {
    let hub_url = config.transport.hub_url.trim_end_matches('/');
    let event = EventTransport::new(
        websocket_url(hub_url),
        config.transport.connect_timeout(),
        config.capture.event_timeout(),
    );
    let backend = HttpBackend::new(hub_url, config.transport.connect_timeout())?;
    let polling = PollingTransport::new(
        Arc::new(backend),
        config.capture.polling_schedule(),
        config.liveness.offline_threshold(),
        Arc::clone(&clock),
    );
    let policy = FailoverPolicy::new(
        config.transport.failure_threshold,
        config.transport.cooldown(),
        config.transport.backoff(),
    );

    info!(
        "Client transport: events at {}, polling at {}",
        websocket_url(hub_url),
        hub_url
    );
    Ok(Arc::new(FailoverTransport::new(
        Arc::new(event),
        Arc::new(polling),
        policy,
        clock,
    )))
}
