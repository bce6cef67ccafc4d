use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Room or booking does not exist.
    NotFound(Ulid),
    /// Requested window overlaps the given existing booking.
    Conflict(Ulid),
    /// Caller does not own the booking.
    Forbidden(Ulid),
    /// The room's policy has no such operation.
    NotSupported {
        policy: &'static str,
        operation: &'static str,
    },
    InvalidInput(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable short name used on the wire and as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::NotSupported { .. } => "not_supported",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "persistence",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(id) => write!(f, "time slot conflicts with booking: {id}"),
            EngineError::Forbidden(id) => write!(f, "booking {id} belongs to another user"),
            EngineError::NotSupported { policy, operation } => {
                write!(f, "{operation} is not supported for {policy} rooms")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
