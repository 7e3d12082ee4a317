use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{Arbiter, ClientNotice, ClientState, Effect, Phase};
use super::{ClientSettings, Intent};
use crate::clock::{Millis, SharedClock};
use crate::error::{CaptureError, TransportError};
use crate::events::{Command, LiveAction, RejectReason, StatusSnapshot};
use crate::liveness::LivenessMonitor;
use crate::quality::QualityNegotiator;
use crate::session::{SessionManager, SessionVerdict};
use crate::store::SessionStamp;
use crate::transport::{CaptureOutcome, CaptureTicket, ChannelMode, Reply, SharedTransport};

type PendingCapture = BoxFuture<'static, (CaptureTicket, Result<CaptureOutcome, TransportError>)>;

/// Whether the rest of an effect batch still applies
enum Flow {
    Continue,
    /// A reply changed the state; drop the remaining effects and run these
    Replace(Vec<Effect>),
}

/// One client core: a single task owning the arbiter, the session, the
/// quality negotiator and the liveness monitor. Status polling, heartbeats,
/// frame refresh, settle delays and capture completion are all timers or
/// futures of the same `select!` loop, so they never run concurrently.
pub struct ClientRuntime {
    transport: SharedTransport,
    clock: SharedClock,
    settings: ClientSettings,
    arbiter: Arbiter,
    session: SessionManager,
    quality: QualityNegotiator,
    liveness: LivenessMonitor,
    last_written_at: Option<Millis>,
    last_snapshot: Option<StatusSnapshot>,
    last_frame: Option<u64>,
    heartbeat_at: Option<Instant>,
    frame_at: Option<Instant>,
    resume_at: Option<Instant>,
    pending_capture: Option<PendingCapture>,
    intents: mpsc::Receiver<Intent>,
    state_tx: watch::Sender<ClientState>,
    notices: broadcast::Sender<ClientNotice>,
    cancellation_token: CancellationToken,
}

impl ClientRuntime {
    pub(super) fn new(
        transport: SharedTransport,
        clock: SharedClock,
        settings: ClientSettings,
        intents: mpsc::Receiver<Intent>,
        state_tx: watch::Sender<ClientState>,
        notices: broadcast::Sender<ClientNotice>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            arbiter: Arbiter::new(settings.default_preset),
            session: SessionManager::new(settings.heartbeat_interval, settings.stale_after),
            quality: QualityNegotiator::new(settings.default_preset),
            liveness: LivenessMonitor::new(settings.offline_threshold),
            transport,
            clock,
            settings,
            last_written_at: None,
            last_snapshot: None,
            last_frame: None,
            heartbeat_at: None,
            frame_at: None,
            resume_at: None,
            pending_capture: None,
            intents,
            state_tx,
            notices,
            cancellation_token,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Client core started ({:?} status poll, {:?} heartbeat)",
            self.settings.poll_interval, self.settings.heartbeat_interval
        );

        // Liveness must be known before the first intent is handled
        self.poll_status().await;

        let mut status_ticker = interval_at(
            Instant::now() + self.settings.poll_interval,
            self.settings.poll_interval,
        );
        status_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                intent = self.intents.recv() => match intent {
                    Some(Intent::Shutdown) | None => break,
                    Some(intent) => self.handle_intent(intent).await,
                },
                _ = status_ticker.tick() => self.poll_status().await,
                _ = sleep_until_opt(self.heartbeat_at) => self.heartbeat().await,
                _ = sleep_until_opt(self.frame_at) => self.refresh_frame().await,
                _ = sleep_until_opt(self.resume_at) => {
                    self.resume_at = None;
                    let effects = self.arbiter.settle_elapsed();
                    self.apply(effects).await;
                }
                (ticket, outcome) = wait_pending(&mut self.pending_capture) => {
                    self.finish_capture(ticket, outcome).await;
                }
            }
        }

        self.shutdown().await;
        info!("Client core stopped");
    }

    async fn handle_intent(&mut self, intent: Intent) {
        debug!("Handling intent {:?}", intent);
        let effects = match intent {
            Intent::StartLive => self.arbiter.start_live(),
            Intent::StopLive => self.arbiter.stop_live(),
            Intent::Capture => {
                let shared_live = self
                    .last_snapshot
                    .as_ref()
                    .map_or(false, |snapshot| snapshot.live_enabled);
                match self.arbiter.request_capture(self.clock.now_ms(), shared_live) {
                    Ok(effects) => effects,
                    Err(error) => vec![Effect::Notify(ClientNotice::CaptureRejected { error })],
                }
            }
            Intent::SelectQuality(preset) => self.arbiter.quality_selected(preset),
            Intent::Shutdown => Vec::new(),
        };
        self.apply(effects).await;
    }

    /// Run a batch of effects in order, then publish the resulting state
    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            if let Flow::Replace(next) = self.perform(effect).await {
                queue = next.into();
            }
        }
        self.state_tx.send_replace(self.arbiter.state().clone());
    }

    async fn perform(&mut self, effect: Effect) -> Flow {
        match effect {
            Effect::SendLive(enabled) => return self.send_live(enabled).await,
            Effect::StartSession => {
                let stamp = self.session.start(self.clock.now_ms());
                self.arbiter.session_started(stamp.session_id.clone());
                self.write_heartbeat(stamp).await;
                self.heartbeat_at = Some(Instant::now() + self.settings.heartbeat_interval);
            }
            Effect::PauseHeartbeat => {
                debug!("Heartbeat paused");
                self.heartbeat_at = None;
            }
            Effect::ResumeHeartbeat => {
                if let Some(stamp) = self.session.heartbeat(self.clock.now_ms()) {
                    self.write_heartbeat(stamp).await;
                    self.heartbeat_at = Some(Instant::now() + self.settings.heartbeat_interval);
                }
            }
            Effect::EndSession => {
                self.session.end();
                self.arbiter.session_ended();
                self.heartbeat_at = None;
            }
            Effect::ApplyQuality { force } => self.apply_quality(force).await,
            Effect::StartFrameLoop => {
                self.send_best_effort(Command::FrameFeed { enabled: true })
                    .await;
                self.frame_at = Some(Instant::now());
            }
            Effect::StopFrameLoop => self.frame_at = None,
            Effect::DetachFrames => {
                self.send_best_effort(Command::FrameFeed { enabled: false })
                    .await;
            }
            Effect::IssueCapture => return self.issue_capture().await,
            Effect::ScheduleResume => {
                debug!("Resuming live view in {:?}", self.settings.settle_delay);
                self.resume_at = Some(Instant::now() + self.settings.settle_delay);
            }
            Effect::CancelResume => self.resume_at = None,
            Effect::Notify(notice) => {
                // No UI subscribed is fine
                let _ = self.notices.send(notice);
            }
        }
        Flow::Continue
    }

    async fn send_live(&mut self, enabled: bool) -> Flow {
        let action = if enabled {
            LiveAction::Start
        } else {
            LiveAction::Stop
        };
        match self.transport.send(Command::LiveControl { action }).await {
            Ok(Reply::Rejected {
                reason: RejectReason::Busy,
                details,
            }) if enabled => Flow::Replace(
                self.arbiter
                    .live_rejected(details.unwrap_or_else(|| "camera busy".to_string())),
            ),
            Ok(Reply::Rejected { reason, details }) => {
                warn!(
                    "Live {:?} not applied ({:?}: {}), continuing with known state",
                    action,
                    reason,
                    details.unwrap_or_default()
                );
                Flow::Continue
            }
            Ok(_) => Flow::Continue,
            Err(e) => {
                warn!("Live {:?} could not be sent: {}", action, e);
                Flow::Continue
            }
        }
    }

    async fn write_heartbeat(&mut self, stamp: SessionStamp) {
        self.send_best_effort(Command::Heartbeat { session: stamp })
            .await;
    }

    async fn apply_quality(&mut self, force: bool) {
        let preset = self.arbiter.state().quality;
        let Some(quality) = self.quality.select(preset, force) else {
            return;
        };
        match self.transport.send(Command::SettingsUpdate { quality }).await {
            Ok(Reply::Accepted) => {
                info!("Quality {} applied", preset);
                self.quality.mark_applied(quality);
                let _ = self.notices.send(ClientNotice::QualityApplied { preset });
            }
            Ok(reply) => warn!("Quality {} not applied: {:?}", preset, reply),
            Err(e) => warn!("Quality {} could not be sent: {}", preset, e),
        }
    }

    async fn issue_capture(&mut self) -> Flow {
        let now = self.clock.now_ms();
        let result = match self.transport.send(Command::Capture).await {
            Ok(Reply::CaptureStarted(ticket)) => {
                info!("Capture {} accepted via {}", ticket.id, ticket.via);
                self.arbiter.capture_accepted(ticket.id.clone());
                let transport = Arc::clone(&self.transport);
                self.pending_capture = Some(
                    async move {
                        let outcome = transport.await_capture(&ticket).await;
                        (ticket, outcome)
                    }
                    .boxed(),
                );
                return Flow::Continue;
            }
            Ok(Reply::Rejected {
                reason: RejectReason::Busy,
                ..
            }) => Err(CaptureError::Busy),
            Ok(Reply::Rejected { reason, details }) => Err(CaptureError::Undelivered {
                details: details.unwrap_or_else(|| format!("{:?}", reason)),
            }),
            Ok(Reply::Accepted) => Err(CaptureError::Undelivered {
                details: "capture accepted without a ticket".to_string(),
            }),
            Err(e) => Err(CaptureError::Undelivered {
                details: e.to_string(),
            }),
        };
        Flow::Replace(self.arbiter.capture_finished(result, now))
    }

    async fn finish_capture(
        &mut self,
        ticket: CaptureTicket,
        outcome: Result<CaptureOutcome, TransportError>,
    ) {
        let result = match outcome {
            Ok(CaptureOutcome::Completed(completion)) => Ok(completion),
            Ok(CaptureOutcome::Failed { details }) => Err(CaptureError::Failed { details }),
            Ok(CaptureOutcome::TimedOut) => Err(CaptureError::Timeout {
                timeout: match ticket.via {
                    ChannelMode::Event => self.settings.event_timeout,
                    ChannelMode::Polling => self.settings.polling_timeout,
                },
            }),
            Err(e) => Err(CaptureError::Undelivered {
                details: e.to_string(),
            }),
        };
        let effects = self.arbiter.capture_finished(result, self.clock.now_ms());
        self.apply(effects).await;
    }

    /// Liveness, channel and session ownership from one status read
    async fn poll_status(&mut self) {
        match self.transport.status().await {
            Ok(snapshot) => {
                self.last_written_at = snapshot.telemetry_written_at;
                self.last_snapshot = Some(snapshot);
            }
            Err(e) => debug!("Status unavailable ({}), judging liveness on last known write", e),
        }

        let now = self.clock.now_ms();
        let mut effects = Vec::new();
        // Ownership first: a suspended owner that lost its slot must not
        // resume and overwrite the newer session
        if let Some(winner) = self.foreign_winner(now) {
            effects.extend(self.arbiter.session_conceded(&winner));
        }
        if let Some(change) = self.liveness.observe(self.last_written_at, now) {
            effects.extend(self.arbiter.liveness_changed(change));
        }
        effects.extend(self.arbiter.channel_changed(self.transport.mode()));
        self.apply(effects).await;
    }

    /// A newer foreign heartbeat in the last snapshot, if we hold a session
    fn foreign_winner(&self, now: Millis) -> Option<SessionStamp> {
        let snapshot = self.last_snapshot.as_ref()?;
        match self.session.evaluate(snapshot.session.as_ref(), now) {
            SessionVerdict::Conceded { winner } => Some(winner),
            SessionVerdict::Abandoned { previous } => {
                debug!(
                    "Session {} abandoned, next heartbeat overwrites it",
                    previous.session_id
                );
                None
            }
            _ => None,
        }
    }

    async fn heartbeat(&mut self) {
        self.heartbeat_at = None;
        let now = self.clock.now_ms();

        if let Some(winner) = self.foreign_winner(now) {
            let effects = self.arbiter.session_conceded(&winner);
            self.apply(effects).await;
            return;
        }

        if let Some(stamp) = self.session.heartbeat(now) {
            self.write_heartbeat(stamp).await;
            self.heartbeat_at = Some(Instant::now() + self.settings.heartbeat_interval);
        }
    }

    async fn refresh_frame(&mut self) {
        self.frame_at = None;
        match self.transport.latest_frame().await {
            Ok(Some(frame_id)) if self.last_frame != Some(frame_id) => {
                self.last_frame = Some(frame_id);
                let _ = self.notices.send(ClientNotice::FrameRefreshed { frame_id });
            }
            Ok(_) => {}
            Err(e) => debug!("Frame check failed: {}", e),
        }
        if self.arbiter.state().is_streaming() {
            self.frame_at = Some(Instant::now() + self.settings.frame_refresh_interval);
        }
    }

    async fn shutdown(&mut self) {
        match self.arbiter.state().phase {
            Phase::LiveActive => {
                let effects = self.arbiter.stop_live();
                self.apply(effects).await;
            }
            Phase::Capturing => {
                warn!("Shutting down with a capture in flight; its result will not be awaited")
            }
            Phase::Idle => {}
        }
        self.transport.disconnect().await;
    }

    async fn send_best_effort(&mut self, command: Command) {
        let name = command.name();
        match self.transport.send(command).await {
            Ok(Reply::Rejected { reason, details }) => warn!(
                "{} rejected ({:?}): {}",
                name,
                reason,
                details.unwrap_or_default()
            ),
            Ok(_) => {}
            Err(e) => warn!("{} could not be sent: {}", name, e),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_pending<T>(pending: &mut Option<BoxFuture<'static, T>>) -> T {
    let output = match pending.as_mut() {
        Some(future) => future.await,
        None => std::future::pending().await,
    };
    *pending = None;
    output
}
