use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("DNS lookup failed: {0}")]
    Dns(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("HSS request failed: {0}")]
    Hss(String),

    #[error("no route for {0}")]
    RoutingDeadEnd(String),

    #[error("sproutlet transaction is complete")]
    TsxComplete,

    #[error("transaction state corrupted: {0}")]
    Fatal(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}
