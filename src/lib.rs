//! # meshplane
//!
//! Host-side wiring for an overlay network data plane: figure out how the
//! local kernel bridging constructs are assembled, and set up encrypted
//! point-to-point tunnels between overlay peers using the kernel's IPsec
//! (ESP, transport mode) machinery.
//!
//! ## Key Components
//!
//! ### Topology
//! - [`detect_bridge_topology`] - Classify the bridge/datapath link pair
//! - [`hairpin::watch_hairpin`] - Watch a bridge port for hairpin-mode violations
//!
//! ### Encrypted Tunnels
//! - [`new_spi`] - Derive the per-peer-pair security parameter index
//! - [`Ipsec`] - Install/remove kernel security associations and policies
//! - [`TunnelManager`] - Per-peer-pair session orchestration
//!
//! Peer identities and session keys come from the membership layer; this
//! crate never derives key material itself. All failures surface through the
//! [`log`] facade, the embedding process chooses the backend.

pub mod bridge;
pub mod config;
pub mod hairpin;
pub mod ipsec;
pub mod link;
#[cfg(target_os = "linux")]
pub mod netlink;
pub mod tunnel;

pub use bridge::{detect_bridge_topology, BridgeTopology, BRIDGE_IFNAME, DATAPATH_IFNAME};
pub use config::Config;
pub use ipsec::{new_spi, Ipsec, PeerShortId, Spi, XfrmBackend};
pub use link::{Link, LinkKind, LinkUpdate, LinkView, Protinfo};
pub use tunnel::TunnelManager;
