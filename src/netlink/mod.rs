//! Raw netlink plumbing for the route and xfrm families.
//!
//! Kept deliberately narrow: the rest of the crate talks to the kernel
//! through [`crate::link::LinkView`] and [`crate::ipsec::XfrmBackend`], and
//! this module is the only place that knows the wire ABI. Sockets are
//! blocking; installer calls are meant to be synchronous kernel calls and
//! the link-event subscription is pumped from a dedicated thread.

pub mod route;
pub mod socket;
pub mod xfrm;

pub use route::RouteSocket;
pub use socket::{Error, NetlinkSocket};
pub use xfrm::XfrmSocket;
