mod acceptor;
mod buffer;
mod endpoint;
mod framing;
mod reconnect;
mod socket;
mod sys;

pub use acceptor::{Acceptor, AcceptorConfig, AcceptorState};
pub use buffer::Buffer;
pub use endpoint::{Endpoint, EndpointParseError, UnixAddress};
pub use framing::{
    FramingAcceptor, FramingAcceptorConfig, FramingConfig, FramingSocket, SocketId,
};
pub use reconnect::{enable_auto_reconnect_and_open, enable_socket_auto_reconnect_and_open};
pub use socket::{KeepAlive, SendError, Socket, SocketConfig, SocketState};
