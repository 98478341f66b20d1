#[derive(Debug, thiserror::Error)]
pub enum TrafgenError {
    #[error("invalid address: {0}")]
    AddressInvalid(String),
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("socket error: {0}")]
    Socket(#[source] std::io::Error),
    #[error("reactor error: {0}")]
    Reactor(#[source] std::io::Error),
    #[error("capture device error: {0}")]
    Capture(String),
    #[error("trace file error: {0}")]
    Trace(#[source] std::io::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, TrafgenError>;
