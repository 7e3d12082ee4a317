pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod keyboard_input;
pub mod liveness;
pub mod quality;
pub mod retry;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

pub use client::{
    connect_transport, spawn_client, ClientHandle, ClientNotice, ClientSettings, ClientState,
    Intent, Phase,
};
pub use clock::{Clock, Millis, SharedClock, SystemClock, TokioClock};
pub use config::CamlinkConfig;
pub use error::{
    ActuatorError, CamlinkError, CaptureError, Result, StoreError, TransportError,
};
pub use events::{CameraEvent, Command, EventBus, StatusSnapshot};
pub use hub::{CameraActuator, CameraHub, HubSettings, ProcessActuator, SimulatedActuator};
pub use keyboard_input::KeyboardInputHandler;
pub use liveness::{LivenessMonitor, OnlineStatus};
pub use quality::{QualityNegotiator, QualityPreset};
pub use session::{SessionManager, SessionVerdict};
pub use store::{FileStateStore, MemoryStateStore, SharedStore, StateStore, StateStoreExt};
pub use transport::{ChannelMode, FailoverTransport, SharedTransport, Transport};

#[cfg(feature = "server")]
pub use server::{HubServer, HubServerBuilder};
