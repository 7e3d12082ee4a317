use crate::client::{ClientHandle, Intent};
use crate::error::Result;
use crate::quality::QualityPreset;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal key bindings for the `watch` command
pub struct KeyboardInputHandler {
    client: ClientHandle,
    cancellation_token: CancellationToken,
}

impl KeyboardInputHandler {
    pub fn new(client: ClientHandle) -> Self {
        Self {
            client,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start listening for keyboard input
    pub async fn start(&self) -> Result<()> {
        info!("Keys: l toggle live, c capture, 1-4 quality, q quit");

        let client = self.client.clone();
        let cancellation_token = self.cancellation_token.clone();
        let runtime_handle = Handle::current();

        task::spawn_blocking(move || {
            if let Err(e) = enable_raw_mode() {
                error!("Failed to enable raw mode for keyboard input: {}", e);
                return;
            }

            loop {
                if cancellation_token.is_cancelled() {
                    debug!("Keyboard input handler stopping");
                    break;
                }

                match event::poll(Duration::from_millis(100)) {
                    Ok(true) => {
                        let Ok(Event::Key(key_event)) = event::read() else {
                            continue;
                        };
                        if key_event.kind != KeyEventKind::Press {
                            continue;
                        }

                        let live_enabled = client.state().live_enabled;
                        let Some(intent) = intent_for_key(key_event.code, live_enabled) else {
                            debug!("Key pressed: {:?}", key_event.code);
                            continue;
                        };

                        let client = client.clone();
                        runtime_handle.spawn(async move {
                            if let Err(e) = client.send(intent).await {
                                warn!("Failed to deliver {:?}: {}", intent, e);
                            }
                        });

                        if intent == Intent::Shutdown {
                            info!("Quit key pressed - requesting shutdown");
                            break;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Error polling for keyboard events: {}", e);
                    }
                }
            }

            if let Err(e) = disable_raw_mode() {
                error!("Failed to disable raw mode: {}", e);
            }
            debug!("Keyboard input handler task exited");
        });

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping keyboard input handler");
        self.cancellation_token.cancel();

        // Give the blocking task a poll interval to restore the terminal
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = disable_raw_mode();

        Ok(())
    }
}

/// Map a key press to a client intent; `l` toggles against the current live flag
pub fn intent_for_key(code: KeyCode, live_enabled: bool) -> Option<Intent> {
    match code {
        KeyCode::Char('l') | KeyCode::Char(' ') => Some(if live_enabled {
            Intent::StopLive
        } else {
            Intent::StartLive
        }),
        KeyCode::Char('c') => Some(Intent::Capture),
        KeyCode::Char(digit @ '1'..='4') => {
            let index = digit as usize - '1' as usize;
            Some(Intent::SelectQuality(QualityPreset::ALL[index]))
        }
        KeyCode::Char('q') | KeyCode::Esc => Some(Intent::Shutdown),
        _ => None,
    }
}
