pub mod encode;
pub mod handshake;

pub use encode::EncodeError;
pub use handshake::HandshakeError;
