pub mod echo;
pub mod handshake;

pub use echo::EchoReply;
pub use handshake::Greeting;
