use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Sysinfo error: {0}")]
    SysinfoError(String),
    #[error("Process discovery error: {0}")]
    ProcessDiscoveryError(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("Sampling worker panicked: {0}")]
    WorkerPanicked(String),
    #[error("Trace error: {0}")]
    Trace(String),
    #[error("Other error: {0}")]
    Other(String),
}
