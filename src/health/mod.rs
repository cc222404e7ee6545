pub mod health_core;
pub mod health_telemetry;
