pub mod rendezvous;
pub mod stream;


pub use rendezvous::StdinRendezvous;
pub use stream::StreamBuffer;
