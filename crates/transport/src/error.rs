use std::{io, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("session limit of {limit} reached")]
    SessionLimit { limit: usize },
    #[error("read stalled mid-frame for {0:?}")]
    ReadTimeout(Duration),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
}
