pub mod batch;
pub mod compress;
pub mod history;
pub mod liveness;
pub mod readiness;
pub mod usage;
