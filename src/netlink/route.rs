//! NETLINK_ROUTE queries: link lookup by name, bridge-port protinfo, and
//! the link-change subscription feeding the hairpin monitor.

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::sync::mpsc;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::socket::{
    attrs, Error, Messages, MsgBuilder, NetlinkSocket, NLMSG_DONE, NLMSG_ERROR, NLM_F_DUMP,
    NLM_F_REQUEST,
};
use crate::link::{Link, LinkKind, LinkUpdate, LinkView, Protinfo};

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;

const IFLA_IFNAME: u16 = 3;
const IFLA_PROTINFO: u16 = 12;
const IFLA_LINKINFO: u16 = 18;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_BRPORT_MODE: u16 = 4; // hairpin

// Multicast group bit for RTNLGRP_LINK (group 1).
const RTNLGRP_LINK_MASK: u32 = 1;

/// struct ifinfomsg.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct IfInfoMsg {
    family: u8,
    _pad: u8,
    kind: u16,
    index: i32,
    flags: u32,
    change: u32,
}

/// Blocking NETLINK_ROUTE connection for one-shot queries.
pub struct RouteSocket {
    sock: NetlinkSocket,
}

impl RouteSocket {
    pub fn connect() -> Result<Self, Error> {
        let sock = NetlinkSocket::open(libc::NETLINK_ROUTE, 0)?;
        Ok(Self { sock })
    }

    fn get_link_by_name(&self, name: &str) -> Result<Option<ParsedLink>, Error> {
        let mut ifname = name.as_bytes().to_vec();
        ifname.push(0);

        let seq = self.sock.next_seq();
        let msg = MsgBuilder::new(RTM_GETLINK, NLM_F_REQUEST, seq)
            .payload(IfInfoMsg::default().as_bytes())
            .attr(IFLA_IFNAME, &ifname)
            .finish();
        self.sock.send(&msg)?;

        let data = self.sock.recv()?;
        for (header, payload) in Messages::new(&data) {
            match header.kind {
                NLMSG_ERROR => {
                    if payload.len() < 4 {
                        return Err(Error::Truncated);
                    }
                    let errno = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    // A missing link is a classification input, not an error.
                    if -errno == libc::ENODEV {
                        return Ok(None);
                    }
                    if errno != 0 {
                        return Err(Error::from_errno(-errno));
                    }
                }
                RTM_NEWLINK => return Ok(parse_link(payload)),
                _ => {}
            }
        }
        Ok(None)
    }

    fn get_protinfo(&self, index: i32) -> Result<Option<Protinfo>, Error> {
        let info = IfInfoMsg {
            family: libc::AF_BRIDGE as u8,
            ..Default::default()
        };
        let seq = self.sock.next_seq();
        let msg = MsgBuilder::new(RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP, seq)
            .payload(info.as_bytes())
            .finish();
        self.sock.send(&msg)?;

        // AF_BRIDGE link dumps are multipart; scan until DONE for our index.
        let mut found = None;
        'outer: loop {
            let data = self.sock.recv()?;
            for (header, payload) in Messages::new(&data) {
                match header.kind {
                    NLMSG_DONE => break 'outer,
                    NLMSG_ERROR => {
                        if payload.len() < 4 {
                            return Err(Error::Truncated);
                        }
                        let errno =
                            i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
                        if errno != 0 {
                            return Err(Error::from_errno(-errno));
                        }
                    }
                    RTM_NEWLINK => {
                        if let Some(parsed) = parse_link(payload) {
                            if parsed.index == index {
                                found = parsed.hairpin.map(|hairpin| Protinfo { hairpin });
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(found)
    }
}

impl LinkView for RouteSocket {
    fn link_by_name(&self, name: &str) -> Result<Option<Link>> {
        let parsed = self
            .get_link_by_name(name)
            .with_context(|| format!("link lookup {:?}", name))?;
        Ok(parsed.map(ParsedLink::into_link))
    }

    fn protinfo(&self, link: &Link) -> Result<Option<Protinfo>> {
        self.get_protinfo(link.index)
            .with_context(|| format!("link protinfo {:?}", link.name))
    }
}

/// Subscribe to link-state change notifications for the whole link
/// namespace. A dedicated thread pumps the blocking socket into the
/// returned channel; it exits when the receiver is dropped (on the next
/// event) or the socket fails.
pub fn subscribe_links(capacity: usize) -> Result<mpsc::Receiver<LinkUpdate>> {
    let sock =
        NetlinkSocket::open(libc::NETLINK_ROUTE, RTNLGRP_LINK_MASK).context("link subscribe")?;
    let (tx, rx) = mpsc::channel(capacity);

    std::thread::Builder::new()
        .name("meshplane-linkev".to_string())
        .spawn(move || pump_link_events(sock, tx))
        .context("spawn link event pump")?;

    Ok(rx)
}

fn pump_link_events(sock: NetlinkSocket, tx: mpsc::Sender<LinkUpdate>) {
    loop {
        let data = match sock.recv() {
            Ok(data) => data,
            Err(e) => {
                warn!("link event socket failed, stopping pump: {}", e);
                return;
            }
        };
        for (header, payload) in Messages::new(&data) {
            if header.kind != RTM_NEWLINK && header.kind != RTM_DELLINK {
                continue;
            }
            let Some(parsed) = parse_link(payload) else {
                continue;
            };
            let update = LinkUpdate {
                name: parsed.name,
                hairpin: parsed.hairpin,
            };
            if tx.blocking_send(update).is_err() {
                debug!("link event receiver dropped, stopping pump");
                return;
            }
        }
    }
}

struct ParsedLink {
    index: i32,
    name: String,
    kind: Option<String>,
    hairpin: Option<bool>,
}

impl ParsedLink {
    fn into_link(self) -> Link {
        let kind = match self.kind.as_deref() {
            None => LinkKind::Device,
            Some("bridge") => LinkKind::Bridge,
            Some("openvswitch") => LinkKind::Openvswitch,
            Some(other) => LinkKind::Other(other.to_string()),
        };
        Link {
            index: self.index,
            name: self.name,
            kind,
        }
    }
}

fn parse_link(payload: &[u8]) -> Option<ParsedLink> {
    let (info, rest) = IfInfoMsg::read_from_prefix(payload).ok()?;

    let mut name = None;
    let mut kind = None;
    let mut hairpin = None;

    for (attr_kind, attr) in attrs(rest) {
        match attr_kind {
            IFLA_IFNAME => {
                let end = attr.iter().position(|&b| b == 0).unwrap_or(attr.len());
                name = Some(String::from_utf8_lossy(&attr[..end]).into_owned());
            }
            IFLA_LINKINFO => {
                for (nested_kind, nested) in attrs(attr) {
                    if nested_kind == IFLA_INFO_KIND {
                        let end = nested.iter().position(|&b| b == 0).unwrap_or(nested.len());
                        kind = Some(String::from_utf8_lossy(&nested[..end]).into_owned());
                    }
                }
            }
            IFLA_PROTINFO => {
                for (nested_kind, nested) in attrs(attr) {
                    if nested_kind == IFLA_BRPORT_MODE && !nested.is_empty() {
                        hairpin = Some(nested[0] != 0);
                    }
                }
            }
            _ => {}
        }
    }

    Some(ParsedLink {
        index: info.index,
        name: name?,
        kind,
        hairpin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::socket::MsgBuilder;

    fn nested(entries: &[(u16, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (kind, data) in entries {
            let len = 4 + data.len();
            buf.extend_from_slice(&(len as u16).to_ne_bytes());
            buf.extend_from_slice(&kind.to_ne_bytes());
            buf.extend_from_slice(data);
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
        }
        buf
    }

    fn link_message(index: i32, name: &str, kind: Option<&str>, hairpin: Option<bool>) -> Vec<u8> {
        let info = IfInfoMsg {
            index,
            ..Default::default()
        };
        let mut ifname = name.as_bytes().to_vec();
        ifname.push(0);

        let mut msg = MsgBuilder::new(RTM_NEWLINK, 0, 1)
            .payload(info.as_bytes())
            .attr(IFLA_IFNAME, &ifname);
        if let Some(kind) = kind {
            let mut kind_z = kind.as_bytes().to_vec();
            kind_z.push(0);
            msg = msg.attr(IFLA_LINKINFO, &nested(&[(IFLA_INFO_KIND, &kind_z)]));
        }
        if let Some(hairpin) = hairpin {
            msg = msg.attr(
                IFLA_PROTINFO,
                &nested(&[(IFLA_BRPORT_MODE, &[hairpin as u8])]),
            );
        }
        msg.finish()
    }

    fn parse(msg: &[u8]) -> ParsedLink {
        let (_, payload) = Messages::new(msg).next().unwrap();
        parse_link(payload).unwrap()
    }

    #[test]
    fn test_parse_bridge_link() {
        let parsed = parse(&link_message(3, "weave", Some("bridge"), None));
        assert_eq!(parsed.index, 3);
        assert_eq!(parsed.name, "weave");
        assert_eq!(parsed.kind.as_deref(), Some("bridge"));
        assert_eq!(parsed.hairpin, None);

        let link = parsed.into_link();
        assert_eq!(link.kind, LinkKind::Bridge);
    }

    #[test]
    fn test_parse_kindless_link_is_device() {
        let link = parse(&link_message(5, "datapath", None, None)).into_link();
        assert_eq!(link.kind, LinkKind::Device);
    }

    // Attribute numbers from linux/if_link.h. Parsing silently misses
    // attributes if these drift, so pin them the way the xfrm tests pin
    // struct sizes.
    #[test]
    fn test_link_attr_constants_match_kernel() {
        assert_eq!(IFLA_IFNAME, 3);
        assert_eq!(IFLA_PROTINFO, 12);
        assert_eq!(IFLA_LINKINFO, 18);
        assert_eq!(IFLA_INFO_KIND, 1);
        assert_eq!(IFLA_BRPORT_MODE, 4);
    }

    #[test]
    fn test_parse_kernel_shaped_protinfo() {
        // Hand-built with the raw attribute numbers the kernel emits for a
        // bridge port: the protinfo nest under type 12 with NLA_F_NESTED
        // set, IFLA_BRPORT_MODE (4) inside carrying the hairpin flag.
        let info = IfInfoMsg {
            index: 9,
            ..Default::default()
        };
        let msg = MsgBuilder::new(RTM_NEWLINK, 0, 1)
            .payload(info.as_bytes())
            .attr(3, b"vethwepl1\0")
            .attr(0x8000 | 12, &nested(&[(4, &[1u8])]))
            .finish();

        let parsed = parse(&msg);
        assert_eq!(parsed.name, "vethwepl1");
        assert_eq!(parsed.hairpin, Some(true));
    }

    #[test]
    fn test_parse_protinfo_hairpin() {
        let parsed = parse(&link_message(9, "vethwepl1", Some("veth"), Some(true)));
        assert_eq!(parsed.hairpin, Some(true));
        assert_eq!(
            parsed.into_link().kind,
            LinkKind::Other("veth".to_string())
        );

        let parsed = parse(&link_message(9, "vethwepl1", Some("veth"), Some(false)));
        assert_eq!(parsed.hairpin, Some(false));
    }
}
