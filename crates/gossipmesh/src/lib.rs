//! GossipMesh: decentralized cluster membership and failure detection.
//!
//! GossipMesh keeps an eventually-consistent view of which peers in a
//! cluster are alive, suspected, or dead, with no central coordinator,
//! using the SWIM family of techniques:
//!
//! - **Failure detection**: each member probes one random peer per
//!   interval, falling back to indirect probes through other peers to
//!   rule out asymmetric link failure.
//! - **Suspicion**: a peer that fails its probes is only *suspected*; it
//!   gets a logarithmically scaled window to refute the rumour with a
//!   higher incarnation number before being declared dead.
//! - **Gossip**: membership deltas piggyback on compound UDP datagrams to
//!   a few random peers per interval.
//! - **Anti-entropy**: periodic full state exchanges over TCP pull
//!   diverged views back together.
//!
//! # Example
//!
//! ```no_run
//! use gossipmesh::{Membership, MembershipConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let first = Membership::create(MembershipConfig::new(
//!     "node-1",
//!     "127.0.0.1:7946".parse()?,
//! ))
//! .await?;
//!
//! let second = Membership::create(MembershipConfig::new(
//!     "node-2",
//!     "127.0.0.1:7947".parse()?,
//! ))
//! .await?;
//! second.join(&[first.advertise_addr()]).await?;
//!
//! assert_eq!(second.num_members(), 2);
//!
//! second.leave(std::time::Duration::from_secs(5)).await?;
//! second.shutdown();
//! first.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod broadcast;
pub mod config;
pub mod delegate;
pub mod error;
pub mod membership;
pub mod message;
pub mod node;
pub mod registry;
pub mod transport;

mod gossip;
mod probe;
mod state;

// Re-export primary types
pub use config::MembershipConfig;
pub use delegate::{
    ChannelEventDelegate, Delegate, EventDelegate, MemberEvent, MemberEventKind,
};
pub use error::{MembershipError, Result};
pub use membership::{Membership, META_MAX_SIZE};
pub use message::MessageKind;
pub use node::{Node, NodeState};

/// Crate version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
