pub mod channel;
pub mod connection;
pub mod transport;

pub use channel::{Channel, ChannelTable};
pub use connection::{ClientConnection, ConnectionId, ConnectionState, PackageMap};
pub use transport::{ThrottledTransport, Transport};
