//! Node daemon internals: persistence, peer address tracking, the gossip
//! sync engine, and the HTTP control surface.

pub mod addrbook;
pub mod http;
pub mod p2p;
pub mod store;
