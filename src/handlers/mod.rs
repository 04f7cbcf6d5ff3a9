mod health;
mod work;

pub use health::{health_check, is_probe_request, readiness_check};
pub use work::work;
