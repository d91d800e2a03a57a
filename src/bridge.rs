//! Bridge topology classification.
//!
//! The overlay data plane can be wired through a software bridge, straight
//! through an Open vSwitch datapath, or through a bridge stacked on top of a
//! datapath. Which one is in place is derived on demand from two link
//! lookups, never stored.

use log::warn;

use crate::link::{is_bridge_kind, is_datapath_kind, Link, LinkView};

/// Conventional name of the overlay bridge link.
pub const BRIDGE_IFNAME: &str = "weave";
/// Conventional name of the datapath link.
pub const DATAPATH_IFNAME: &str = "datapath";

/// How the host's overlay bridging constructs are assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeTopology {
    /// Neither construct exists.
    None,
    /// Software bridge only.
    Bridge,
    /// Single datapath device under the bridge name (legacy fast path).
    Fastdp,
    /// Bridge stacked on a separate datapath device.
    BridgedFastdp,
    /// Links exist but in no recognized combination.
    Inconsistent,
}

/// Classify the current topology from the two well-known link names.
///
/// First matching case wins. A failed lookup is classified as absence so
/// that callers always get a topology; the underlying error is logged so
/// operators can tell "genuinely absent" from "query failed".
pub fn detect_bridge_topology<V: LinkView>(
    view: &V,
    bridge_name: &str,
    datapath_name: &str,
) -> BridgeTopology {
    let bridge = lookup(view, bridge_name);
    let datapath = lookup(view, datapath_name);

    match (&bridge, &datapath) {
        (None, None) => BridgeTopology::None,
        (Some(b), None) if is_bridge_kind(b) => BridgeTopology::Bridge,
        (Some(b), None) if is_datapath_kind(b) => BridgeTopology::Fastdp,
        (Some(b), Some(d)) if is_datapath_kind(d) && is_bridge_kind(b) => {
            BridgeTopology::BridgedFastdp
        }
        _ => BridgeTopology::Inconsistent,
    }
}

fn lookup<V: LinkView>(view: &V, name: &str) -> Option<Link> {
    match view.link_by_name(name) {
        Ok(link) => link,
        Err(e) => {
            warn!("link lookup {:?} failed, treating as absent: {:#}", name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkKind;
    use anyhow::{anyhow, Result};
    use std::collections::HashMap;

    /// In-memory link table with an optional set of names whose lookup fails.
    #[derive(Default)]
    struct FakeLinks {
        links: HashMap<String, LinkKind>,
        failing: Vec<String>,
    }

    impl FakeLinks {
        fn new(entries: &[(&str, LinkKind)]) -> Self {
            let links = entries
                .iter()
                .map(|(name, kind)| (name.to_string(), kind.clone()))
                .collect();
            Self {
                links,
                failing: Vec::new(),
            }
        }

        fn failing_on(mut self, name: &str) -> Self {
            self.failing.push(name.to_string());
            self
        }
    }

    impl LinkView for FakeLinks {
        fn link_by_name(&self, name: &str) -> Result<Option<Link>> {
            if self.failing.iter().any(|n| n == name) {
                return Err(anyhow!("netlink query failed"));
            }
            Ok(self.links.get(name).map(|kind| Link {
                index: 1,
                name: name.to_string(),
                kind: kind.clone(),
            }))
        }

        fn protinfo(&self, _link: &Link) -> Result<Option<crate::link::Protinfo>> {
            Ok(None)
        }
    }

    fn classify(bridge: Option<LinkKind>, datapath: Option<LinkKind>) -> BridgeTopology {
        let mut entries = Vec::new();
        if let Some(kind) = bridge {
            entries.push((BRIDGE_IFNAME, kind));
        }
        if let Some(kind) = datapath {
            entries.push((DATAPATH_IFNAME, kind));
        }
        let view = FakeLinks::new(&entries);
        detect_bridge_topology(&view, BRIDGE_IFNAME, DATAPATH_IFNAME)
    }

    #[test]
    fn test_classify_table() {
        let veth = || LinkKind::Other("veth".to_string());

        // (bridge link, datapath link) -> expected topology, over the full
        // combination space. `None` = absent, `Some(kind)` = present.
        let cases: Vec<(Option<LinkKind>, Option<LinkKind>, BridgeTopology)> = vec![
            (None, None, BridgeTopology::None),
            (Some(LinkKind::Bridge), None, BridgeTopology::Bridge),
            (Some(LinkKind::Openvswitch), None, BridgeTopology::Fastdp),
            (Some(LinkKind::Device), None, BridgeTopology::Fastdp),
            (Some(veth()), None, BridgeTopology::Inconsistent),
            (None, Some(LinkKind::Bridge), BridgeTopology::Inconsistent),
            (
                None,
                Some(LinkKind::Openvswitch),
                BridgeTopology::Inconsistent,
            ),
            (None, Some(LinkKind::Device), BridgeTopology::Inconsistent),
            (
                Some(LinkKind::Bridge),
                Some(LinkKind::Bridge),
                BridgeTopology::Inconsistent,
            ),
            (
                Some(LinkKind::Bridge),
                Some(LinkKind::Openvswitch),
                BridgeTopology::BridgedFastdp,
            ),
            (
                Some(LinkKind::Bridge),
                Some(LinkKind::Device),
                BridgeTopology::BridgedFastdp,
            ),
            (
                Some(LinkKind::Openvswitch),
                Some(LinkKind::Openvswitch),
                BridgeTopology::Inconsistent,
            ),
            (
                Some(LinkKind::Device),
                Some(LinkKind::Openvswitch),
                BridgeTopology::Inconsistent,
            ),
            (
                Some(veth()),
                Some(LinkKind::Openvswitch),
                BridgeTopology::Inconsistent,
            ),
        ];

        for (bridge, datapath, expected) in cases {
            let got = classify(bridge.clone(), datapath.clone());
            assert_eq!(
                got, expected,
                "bridge={:?} datapath={:?}",
                bridge, datapath
            );
        }
    }

    #[test]
    fn test_bridge_only_end_to_end() {
        // "weave" exists as a bridge, "datapath" absent.
        let view = FakeLinks::new(&[(BRIDGE_IFNAME, LinkKind::Bridge)]);
        assert_eq!(
            detect_bridge_topology(&view, BRIDGE_IFNAME, DATAPATH_IFNAME),
            BridgeTopology::Bridge
        );
    }

    #[test]
    fn test_bridged_fastdp_end_to_end() {
        let view = FakeLinks::new(&[
            (BRIDGE_IFNAME, LinkKind::Bridge),
            (DATAPATH_IFNAME, LinkKind::Openvswitch),
        ]);
        assert_eq!(
            detect_bridge_topology(&view, BRIDGE_IFNAME, DATAPATH_IFNAME),
            BridgeTopology::BridgedFastdp
        );
    }

    #[test]
    fn test_query_failure_is_classified_as_absence() {
        // Bridge lookup errors out, datapath absent: same as nothing there.
        let view = FakeLinks::default().failing_on(BRIDGE_IFNAME);
        assert_eq!(
            detect_bridge_topology(&view, BRIDGE_IFNAME, DATAPATH_IFNAME),
            BridgeTopology::None
        );

        // Datapath lookup errors out while the bridge is fine.
        let view =
            FakeLinks::new(&[(BRIDGE_IFNAME, LinkKind::Bridge)]).failing_on(DATAPATH_IFNAME);
        assert_eq!(
            detect_bridge_topology(&view, BRIDGE_IFNAME, DATAPATH_IFNAME),
            BridgeTopology::Bridge
        );
    }
}
