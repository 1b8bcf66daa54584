mod config;
mod error;
mod responses;
mod server;
mod state;
mod surveys;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{ServiceConfig, DEFAULT_INBOUND_BODY_MAX_BYTES, DEFAULT_PUBLIC_BASE_URL};
pub use server::{router, run_server};
pub use state::{AppState, SurveyScheduler};
