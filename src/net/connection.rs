//! Client connection state
//!
//! Per-client session as the scheduler sees it. The controller entity acts as
//! the connection's viewer; the transport sits behind a trait object.

use hashbrown::HashSet;
use rustc_hash::FxBuildHasher;

use crate::net::channel::ChannelTable;
use crate::net::transport::Transport;
use crate::world::entity::{ClassId, EntityId};

pub type ConnectionId = u64;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress, nothing replicated yet
    Pending,
    /// Joined and receiving replication
    Open,
    /// Torn down by the transport
    Closed,
}

/// Replicated classes a client can instantiate
#[derive(Debug, Clone, Default)]
pub struct PackageMap {
    /// `None` means every class is known
    known: Option<HashSet<ClassId, FxBuildHasher>>,
}

impl PackageMap {
    /// Map that resolves every class
    pub fn all() -> Self {
        Self { known: None }
    }

    /// Map restricted to the given classes
    pub fn only(classes: impl IntoIterator<Item = ClassId>) -> Self {
        Self {
            known: Some(classes.into_iter().collect()),
        }
    }

    pub fn knows(&self, class: ClassId) -> bool {
        self.known.as_ref().map_or(true, |set| set.contains(&class))
    }

    /// Make a class resolvable (client finished loading its package)
    pub fn register(&mut self, class: ClassId) {
        if let Some(set) = self.known.as_mut() {
            set.insert(class);
        }
    }
}

/// Per-client session as seen by the replication scheduler
pub struct ClientConnection {
    pub id: ConnectionId,
    pub state: ConnectionState,
    /// The client's player controller (the "connection viewer")
    pub controller: Option<EntityId>,
    /// Current bitrate estimate in bytes per second
    pub current_net_speed: u32,
    /// Tick time of the last packet received from the client
    pub last_receive_time: f64,
    /// Set when the previous pass ran out of capacity
    pub was_saturated: bool,
    /// Scheduling passes run for this connection
    pub tick_count: u64,
    /// Tick time of the last scheduling pass
    pub last_rep_time: f64,
    pub package_map: PackageMap,
    pub replicated_total: u64,
    pub bytes_replicated: u64,
    channels: ChannelTable,
    transport: Box<dyn Transport>,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, transport: Box<dyn Transport>, current_net_speed: u32) -> Self {
        Self {
            id,
            state: ConnectionState::Pending,
            controller: None,
            current_net_speed,
            last_receive_time: 0.0,
            was_saturated: false,
            tick_count: 0,
            last_rep_time: 0.0,
            package_map: PackageMap::all(),
            replicated_total: 0,
            bytes_replicated: 0,
            channels: ChannelTable::new(),
            transport,
        }
    }

    /// Client joined with a player controller
    pub fn join(&mut self, controller: EntityId, now: f64) {
        self.controller = Some(controller);
        self.state = ConnectionState::Open;
        self.last_receive_time = now;
    }

    /// Record client traffic
    pub fn touch(&mut self, now: f64) {
        self.last_receive_time = now;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Non-blocking capacity poll
    #[inline]
    pub fn is_ready(&self, bytes_hint: usize) -> bool {
        self.transport.is_ready(bytes_hint)
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut ChannelTable {
        &mut self.channels
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Split borrow for the replication walk
    pub(crate) fn split_mut(&mut self) -> (&mut ChannelTable, &mut dyn Transport, &PackageMap) {
        (&mut self.channels, self.transport.as_mut(), &self.package_map)
    }

    /// Record replications sent during a pass
    pub fn record_sent(&mut self, updates: u64, bytes: u64) {
        self.replicated_total += updates;
        self.bytes_replicated += bytes;
    }

    /// Tear down: mark closed and drop every channel; returns channels dropped
    pub fn close(&mut self) -> usize {
        self.state = ConnectionState::Closed;
        self.controller = None;
        self.channels.clear()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("controller", &self.controller)
            .field("current_net_speed", &self.current_net_speed)
            .field("was_saturated", &self.was_saturated)
            .field("channels", &self.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::ThrottledTransport;

    fn connection() -> ClientConnection {
        ClientConnection::new(7, Box::new(ThrottledTransport::new(10_000, 40)), 10_000)
    }

    #[test]
    fn test_new_connection_pending() {
        let conn = connection();
        assert_eq!(conn.state, ConnectionState::Pending);
        assert!(!conn.is_open());
        assert!(conn.channels().is_empty());
    }

    #[test]
    fn test_join_opens() {
        let mut conn = connection();
        conn.join(EntityId::new(4, 0), 2.0);
        assert!(conn.is_open());
        assert_eq!(conn.controller, Some(EntityId::new(4, 0)));
        assert_eq!(conn.last_receive_time, 2.0);
    }

    #[test]
    fn test_close_drops_channels() {
        let mut conn = connection();
        conn.join(EntityId::new(4, 0), 0.0);
        conn.channels_mut().open(EntityId::new(1, 0), 0.0, 1.0);
        conn.channels_mut().open(EntityId::new(2, 0), 0.0, 1.0);
        assert_eq!(conn.close(), 2);
        assert_eq!(conn.state, ConnectionState::Closed);
        assert!(conn.channels().is_empty());
    }

    #[test]
    fn test_package_map() {
        let all = PackageMap::all();
        assert!(all.knows(42));

        let mut restricted = PackageMap::only([1, 2]);
        assert!(restricted.knows(1));
        assert!(!restricted.knows(3));
        restricted.register(3);
        assert!(restricted.knows(3));
    }

    #[test]
    fn test_record_sent() {
        let mut conn = connection();
        conn.record_sent(1, 120);
        conn.record_sent(2, 40);
        assert_eq!(conn.replicated_total, 3);
        assert_eq!(conn.bytes_replicated, 160);
    }
}
