use thiserror::Error;

/// Remote or local failure of a single call. Never closes the transport.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// The server has no method under the requested name.
    #[error("method not found")]
    MethodNotFound,
    /// The server could not parse the request.
    #[error("bad request")]
    BadRequest,
    /// The client could not parse the reply.
    #[error("bad reply")]
    BadReply,
    /// The call ended locally without a reply: evicted, timed out, or the
    /// client or connection went away.
    #[error("call cancelled")]
    Cancelled,
}

impl RpcError {
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::MethodNotFound => 1,
            Self::BadRequest => 2,
            Self::BadReply => 3,
            Self::Cancelled => 4,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::MethodNotFound),
            2 => Some(Self::BadRequest),
            3 => Some(Self::BadReply),
            4 => Some(Self::Cancelled),
            _ => None,
        }
    }
}
