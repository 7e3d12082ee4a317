//! Explicit client state and the capture/live arbitration rules.
//!
//! [`Arbiter`] is pure: every transition mutates [`ClientState`] and returns
//! the side effects the runtime must carry out, in order.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Millis;
use crate::error::CaptureError;
use crate::liveness::{LivenessChange, OnlineStatus};
use crate::quality::QualityPreset;
use crate::store::SessionStamp;
use crate::transport::{CaptureCompletion, ChannelMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    LiveActive,
    Capturing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub id: Option<String>,
    pub requested_at: Millis,
    pub completed_at: Option<Millis>,
    pub result_ref: Option<String>,
    /// Another viewer had live view on when this idle client captured
    pub live_before: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    pub phase: Phase,
    /// Live stream flag as this client last asked for it
    pub live_enabled: bool,
    /// The viewer wants live view; survives silent stops and captures
    pub was_live: bool,
    /// Live view paused because the camera went offline
    pub suspended: bool,
    /// Settle delay running before live view is restored
    pub resume_pending: bool,
    pub online: OnlineStatus,
    pub capture: Option<CaptureRequest>,
    pub last_capture: Option<CaptureRequest>,
    pub channel: ChannelMode,
    pub session_id: Option<String>,
    pub quality: QualityPreset,
}

impl ClientState {
    fn new(quality: QualityPreset) -> Self {
        Self {
            phase: Phase::Idle,
            live_enabled: false,
            was_live: false,
            suspended: false,
            resume_pending: false,
            online: OnlineStatus::Unknown,
            capture: None,
            last_capture: None,
            channel: ChannelMode::Event,
            session_id: None,
            quality,
        }
    }

    /// Live frames are actually flowing to this viewer
    pub fn is_streaming(&self) -> bool {
        self.phase == Phase::LiveActive && !self.suspended
    }
}

/// What the UI layer gets told
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    LiveStarted,
    LiveStopped,
    LiveSuspended,
    LiveResumed,
    LiveRejected { details: String },
    SessionConceded { winner: String },
    CaptureStarted,
    CaptureCompleted { result_ref: String, duration_ms: u64 },
    CaptureFailed { error: CaptureError },
    CaptureRejected { error: CaptureError },
    OnlineChanged { online: bool },
    ChannelChanged { mode: ChannelMode },
    FrameRefreshed { frame_id: u64 },
    QualityApplied { preset: QualityPreset },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write the live stream flag
    SendLive(bool),
    /// Mint a session, write its first heartbeat and start the interval
    StartSession,
    /// Stop heartbeating but keep the session
    PauseHeartbeat,
    /// Heartbeat now and restart the interval for the kept session
    ResumeHeartbeat,
    EndSession,
    ApplyQuality { force: bool },
    StartFrameLoop,
    StopFrameLoop,
    /// Ask the hub to stop pushing frames to this client
    DetachFrames,
    IssueCapture,
    ScheduleResume,
    CancelResume,
    Notify(ClientNotice),
}

pub struct Arbiter {
    state: ClientState,
}

impl Arbiter {
    pub fn new(quality: QualityPreset) -> Self {
        Self {
            state: ClientState::new(quality),
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn start_live(&mut self) -> Vec<Effect> {
        match self.state.phase {
            Phase::LiveActive => Vec::new(),
            Phase::Capturing => {
                debug!("Live requested during capture, will start once it finishes");
                self.state.was_live = true;
                Vec::new()
            }
            // The camera still settles after a capture; join the scheduled resume
            Phase::Idle if self.state.resume_pending => {
                debug!("Live requested while settling, starting after the delay");
                self.state.was_live = true;
                Vec::new()
            }
            Phase::Idle => self.enter_live(false),
        }
    }

    fn enter_live(&mut self, force_quality: bool) -> Vec<Effect> {
        self.state.phase = Phase::LiveActive;
        self.state.was_live = true;

        if self.state.online == OnlineStatus::Offline {
            info!("Camera offline, live view waits for fresh telemetry");
            self.state.suspended = true;
            return vec![Effect::Notify(ClientNotice::LiveSuspended)];
        }

        info!("Entering live view");
        self.state.suspended = false;
        self.state.live_enabled = true;
        vec![
            Effect::SendLive(true),
            Effect::StartSession,
            Effect::ApplyQuality {
                force: force_quality,
            },
            Effect::StartFrameLoop,
            Effect::Notify(ClientNotice::LiveStarted),
        ]
    }

    pub fn stop_live(&mut self) -> Vec<Effect> {
        match self.state.phase {
            // The settle timer keeps running in case the shared flag needs restoring
            Phase::Idle if self.state.resume_pending && self.state.was_live => {
                self.state.was_live = false;
                vec![Effect::Notify(ClientNotice::LiveStopped)]
            }
            Phase::Idle => Vec::new(),
            Phase::Capturing => {
                self.state.was_live = false;
                Vec::new()
            }
            Phase::LiveActive => {
                info!("Leaving live view");
                self.state.phase = Phase::Idle;
                self.state.was_live = false;
                self.state.suspended = false;
                self.state.live_enabled = false;
                vec![
                    Effect::StopFrameLoop,
                    Effect::EndSession,
                    Effect::SendLive(false),
                    Effect::Notify(ClientNotice::LiveStopped),
                ]
            }
        }
    }

    /// Begin a capture. Live view is forced off and the heartbeat stopped
    /// before the capture is issued. `shared_live` is the live flag as last
    /// read from the store; an idle client puts it back once done.
    pub fn request_capture(
        &mut self,
        now: Millis,
        shared_live: bool,
    ) -> Result<Vec<Effect>, CaptureError> {
        if self.state.phase == Phase::Capturing {
            warn!("Capture requested while another is in flight");
            return Err(CaptureError::AlreadyCapturing);
        }

        // A pending restore for another viewer is carried into this capture
        let live_before = self.state.phase == Phase::Idle
            && (shared_live || (self.state.resume_pending && self.restores_shared_live()));

        let mut effects = Vec::new();
        if self.state.resume_pending {
            self.state.resume_pending = false;
            effects.push(Effect::CancelResume);
        }

        effects.push(Effect::SendLive(false));
        if self.state.phase == Phase::LiveActive {
            effects.push(Effect::EndSession);
            effects.push(Effect::StopFrameLoop);
        }

        info!(
            "Capture requested (live view {})",
            if self.state.was_live {
                "will be restored"
            } else {
                "off"
            }
        );
        self.state.phase = Phase::Capturing;
        self.state.live_enabled = false;
        self.state.suspended = false;
        self.state.capture = Some(CaptureRequest {
            id: None,
            requested_at: now,
            completed_at: None,
            result_ref: None,
            live_before,
        });

        effects.push(Effect::Notify(ClientNotice::CaptureStarted));
        effects.push(Effect::IssueCapture);
        Ok(effects)
    }

    pub fn capture_accepted(&mut self, id: String) {
        if let Some(capture) = self.state.capture.as_mut() {
            capture.id = Some(id);
        }
    }

    /// Terminal capture result. Failures are reported, never retried.
    pub fn capture_finished(
        &mut self,
        result: Result<CaptureCompletion, CaptureError>,
        now: Millis,
    ) -> Vec<Effect> {
        if self.state.phase != Phase::Capturing {
            debug!("Ignoring capture result outside a capture");
            return Vec::new();
        }

        let mut request = self.state.capture.take().unwrap_or(CaptureRequest {
            id: None,
            requested_at: now,
            completed_at: None,
            result_ref: None,
            live_before: false,
        });
        self.state.phase = Phase::Idle;

        let mut effects = Vec::new();
        match result {
            Ok(completion) => {
                info!(
                    "Capture {} completed in {} ms",
                    completion.id, completion.duration_ms
                );
                request.completed_at = Some(now);
                request.result_ref = Some(completion.result_ref.clone());
                effects.push(Effect::Notify(ClientNotice::CaptureCompleted {
                    result_ref: completion.result_ref,
                    duration_ms: completion.duration_ms,
                }));
            }
            // Contention resets the same way a local rejection does
            Err(CaptureError::Busy) => {
                warn!("Capture refused, camera busy");
                effects.push(Effect::Notify(ClientNotice::CaptureRejected {
                    error: CaptureError::Busy,
                }));
            }
            Err(error) => {
                warn!("Capture failed: {}", error);
                effects.push(Effect::Notify(ClientNotice::CaptureFailed { error }));
            }
        }
        let restore_shared = request.live_before;
        self.state.last_capture = Some(request);

        if self.state.was_live || restore_shared {
            self.state.resume_pending = true;
            effects.push(Effect::ScheduleResume);
        }
        effects
    }

    /// Settle delay over: restore live view with the quality re-applied, or
    /// only switch the shared flag back on for the viewer that had it
    pub fn settle_elapsed(&mut self) -> Vec<Effect> {
        if !self.state.resume_pending || self.state.phase != Phase::Idle {
            return Vec::new();
        }
        self.state.resume_pending = false;
        if self.state.was_live {
            return self.enter_live(true);
        }
        if self.restores_shared_live() {
            info!("Restoring the shared live flag after capture");
            return vec![Effect::SendLive(true)];
        }
        Vec::new()
    }

    fn restores_shared_live(&self) -> bool {
        self.state
            .last_capture
            .as_ref()
            .map_or(false, |capture| capture.live_before)
    }

    /// The hub refused to start live view
    pub fn live_rejected(&mut self, details: String) -> Vec<Effect> {
        if self.state.phase != Phase::LiveActive {
            return Vec::new();
        }
        warn!("Live view rejected: {}", details);
        self.state.phase = Phase::Idle;
        self.state.was_live = false;
        self.state.suspended = false;
        self.state.live_enabled = false;

        let mut effects = vec![Effect::StopFrameLoop];
        if self.state.session_id.is_some() {
            effects.push(Effect::EndSession);
        }
        effects.push(Effect::Notify(ClientNotice::LiveRejected { details }));
        effects
    }

    /// A newer viewer owns the session. Stop locally without touching the
    /// shared live flag the winner relies on.
    pub fn session_conceded(&mut self, winner: &SessionStamp) -> Vec<Effect> {
        if self.state.phase != Phase::LiveActive {
            return Vec::new();
        }
        info!("Conceding live view to session {}", winner.session_id);
        self.state.phase = Phase::Idle;
        self.state.was_live = false;
        self.state.suspended = false;
        self.state.live_enabled = false;
        vec![
            Effect::StopFrameLoop,
            Effect::EndSession,
            Effect::DetachFrames,
            Effect::Notify(ClientNotice::SessionConceded {
                winner: winner.session_id.clone(),
            }),
        ]
    }

    pub fn liveness_changed(&mut self, change: LivenessChange) -> Vec<Effect> {
        match change {
            LivenessChange::WentOffline => {
                self.state.online = OnlineStatus::Offline;
                let mut effects = vec![Effect::Notify(ClientNotice::OnlineChanged { online: false })];
                if self.state.is_streaming() {
                    info!("Camera offline, pausing live view");
                    self.state.suspended = true;
                    effects.extend([
                        Effect::StopFrameLoop,
                        Effect::PauseHeartbeat,
                        Effect::Notify(ClientNotice::LiveSuspended),
                    ]);
                }
                effects
            }
            LivenessChange::WentOnline => {
                self.state.online = OnlineStatus::Online;
                let mut effects = vec![Effect::Notify(ClientNotice::OnlineChanged { online: true })];
                if self.state.phase == Phase::LiveActive && self.state.suspended {
                    info!("Camera back online, resuming live view");
                    self.state.suspended = false;
                    self.state.live_enabled = true;
                    effects.push(Effect::SendLive(true));
                    effects.push(if self.state.session_id.is_some() {
                        Effect::ResumeHeartbeat
                    } else {
                        Effect::StartSession
                    });
                    effects.extend([
                        Effect::ApplyQuality { force: true },
                        Effect::StartFrameLoop,
                        Effect::Notify(ClientNotice::LiveResumed),
                    ]);
                }
                effects
            }
        }
    }

    pub fn channel_changed(&mut self, mode: ChannelMode) -> Vec<Effect> {
        if self.state.channel == mode {
            return Vec::new();
        }
        info!("Now using the {} channel", mode);
        self.state.channel = mode;
        vec![Effect::Notify(ClientNotice::ChannelChanged { mode })]
    }

    pub fn quality_selected(&mut self, preset: QualityPreset) -> Vec<Effect> {
        self.state.quality = preset;
        if self.state.is_streaming() {
            vec![Effect::ApplyQuality { force: false }]
        } else {
            Vec::new()
        }
    }

    pub fn session_started(&mut self, session_id: String) {
        self.state.session_id = Some(session_id);
    }

    pub fn session_ended(&mut self) {
        self.state.session_id = None;
    }
}
