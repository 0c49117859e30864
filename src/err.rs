#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("port I/O failed: {0}")]
    Port(#[from] std::io::Error),

    #[error("file access failed: {0}")]
    File(std::io::Error),

    #[error("the line dropped")]
    LinkDown,

    #[error("remote end stopped answering after {0} retries")]
    TimedOut(u32),

    #[error("no SYNC from the remote end")]
    NoSync,

    #[error("too many link errors ({0} over budget)")]
    ErrorBudget(u64),

    #[error("remote end sent CLOSE outside shutdown")]
    ClosedByPeer,

    #[error("malformed command: {0:?}")]
    BadCommand(String),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}
