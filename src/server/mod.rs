mod app;
mod handlers;
mod ws;

pub use app::{router, HubServer, HubServerBuilder, ServerState};
