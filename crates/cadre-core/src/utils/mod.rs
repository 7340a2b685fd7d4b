pub mod tracing;
pub mod truncate;
