pub mod net;

pub use net::{bind_tcp_listener, listen_addr};
