pub mod health;
pub mod routes;

pub use health::RunHealth;
pub use routes::{router, ApiState};
