//! Kernel link objects as seen by the classifier and the hairpin monitor.
//!
//! The kernel owns every link; this module only describes them. The
//! [`LinkView`] trait is the query seam: the real implementation lives in
//! [`crate::netlink::route`], tests substitute an in-memory fake.

use anyhow::Result;

/// What kind of construct a kernel link is, as reported by `IFLA_INFO_KIND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// A software bridge device.
    Bridge,
    /// An Open vSwitch datapath device.
    Openvswitch,
    /// A plain device with no kind reported by the kernel.
    Device,
    /// Anything else (veth, dummy, ...).
    Other(String),
}

/// A named kernel network-interface object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Interface index.
    pub index: i32,
    /// Interface name.
    pub name: String,
    /// Reported kind.
    pub kind: LinkKind,
}

/// Bridge-port protocol info for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protinfo {
    /// Hairpin (reflective relay) mode enabled on the port.
    pub hairpin: bool,
}

/// One link-state change notification from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUpdate {
    /// Name of the link the notification is about.
    pub name: String,
    /// Hairpin flag carried in the notification's protinfo, if any.
    pub hairpin: Option<bool>,
}

/// Read-only view of the kernel's link table.
///
/// `link_by_name` treats absence as data: a missing link is `Ok(None)`,
/// never an error. Only the query transport itself can fail.
pub trait LinkView {
    fn link_by_name(&self, name: &str) -> Result<Option<Link>>;

    /// Bridge-port protocol info for `link`, or `None` if the kernel
    /// reports none (the link is not a bridge port).
    fn protinfo(&self, link: &Link) -> Result<Option<Protinfo>>;
}

/// True iff the link is specifically a software bridge device.
pub fn is_bridge_kind(link: &Link) -> bool {
    matches!(link.kind, LinkKind::Bridge)
}

/// True iff the link is a datapath device.
///
/// A plain [`LinkKind::Device`] also counts: older kernels do not report a
/// kind for the openvswitch datapath, and deployment convention assumes a
/// kindless link under the datapath name is ours. Assumption, not guarantee.
pub fn is_datapath_kind(link: &Link) -> bool {
    matches!(link.kind, LinkKind::Openvswitch | LinkKind::Device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(kind: LinkKind) -> Link {
        Link {
            index: 4,
            name: "port0".to_string(),
            kind,
        }
    }

    #[test]
    fn test_bridge_kind_predicate() {
        assert!(is_bridge_kind(&link(LinkKind::Bridge)));
        assert!(!is_bridge_kind(&link(LinkKind::Openvswitch)));
        assert!(!is_bridge_kind(&link(LinkKind::Device)));
        assert!(!is_bridge_kind(&link(LinkKind::Other("veth".to_string()))));
    }

    #[test]
    fn test_datapath_kind_predicate() {
        assert!(is_datapath_kind(&link(LinkKind::Openvswitch)));
        // Kindless device falls back to "assume datapath".
        assert!(is_datapath_kind(&link(LinkKind::Device)));
        assert!(!is_datapath_kind(&link(LinkKind::Bridge)));
        assert!(!is_datapath_kind(&link(LinkKind::Other("veth".to_string()))));
    }
}
