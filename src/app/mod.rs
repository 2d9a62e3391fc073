mod state;

pub use state::{AppState, HealthStatus};
