#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection could not be established")]
    ConnectFailed,

    #[error("Connection {0} has been dropped")]
    Disconnected(i32),

    #[error("Connection {0} does not exist")]
    UnknownConnection(i32),

    #[error("Endpoint is closing, request rejected")]
    AlreadyClosing,
}
