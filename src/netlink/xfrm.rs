//! NETLINK_XFRM commands against the kernel's security-policy database:
//! SA and policy add/delete plus the two global flushes. Wire structs
//! mirror `linux/xfrm.h`, with explicit padding so the on-wire sizes match
//! what the kernel validates message lengths against.

use std::net::Ipv4Addr;

use anyhow::Result;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::socket::{
    Error, MsgBuilder, NetlinkSocket, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST,
};
use crate::ipsec::{PolicySpec, SaSpec, Spi, XfrmBackend, AEAD_ALG, AEAD_ICV_BITS};

const XFRM_MSG_NEWSA: u16 = 0x10;
const XFRM_MSG_DELSA: u16 = 0x11;
const XFRM_MSG_NEWPOLICY: u16 = 0x13;
const XFRM_MSG_DELPOLICY: u16 = 0x14;
const XFRM_MSG_FLUSHSA: u16 = 0x1C;
const XFRM_MSG_FLUSHPOLICY: u16 = 0x1D;

const XFRMA_TMPL: u16 = 5;
const XFRMA_ALG_AEAD: u16 = 18;

const XFRM_MODE_TRANSPORT: u8 = 0;
const XFRM_POLICY_OUT: u8 = 1;
const XFRM_POLICY_ALLOW: u8 = 0;
const XFRM_SHARE_ANY: u8 = 0;

const IPPROTO_ESP: u8 = 50;
const IPPROTO_UDP: u8 = 17;

const AF_INET: u16 = libc::AF_INET as u16;

// No byte/packet lifetime limits.
const XFRM_INF: u64 = u64::MAX;

/// xfrm_address_t, IPv4 in the first four bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmAddress {
    bytes: [u8; 16],
}

impl XfrmAddress {
    fn from_v4(addr: Ipv4Addr) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&addr.octets());
        Self { bytes }
    }
}

/// struct xfrm_id.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmId {
    daddr: XfrmAddress,
    /// Network byte order.
    spi: u32,
    proto: u8,
    _pad: [u8; 3],
}

/// struct xfrm_selector.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmSelector {
    daddr: XfrmAddress,
    saddr: XfrmAddress,
    dport: u16,
    dport_mask: u16,
    sport: u16,
    sport_mask: u16,
    family: u16,
    prefixlen_d: u8,
    prefixlen_s: u8,
    proto: u8,
    _pad: [u8; 3],
    ifindex: i32,
    user: u32,
}

/// struct xfrm_lifetime_cfg.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmLifetimeCfg {
    soft_byte_limit: u64,
    hard_byte_limit: u64,
    soft_packet_limit: u64,
    hard_packet_limit: u64,
    soft_add_expires_seconds: u64,
    hard_add_expires_seconds: u64,
    soft_use_expires_seconds: u64,
    hard_use_expires_seconds: u64,
}

impl XfrmLifetimeCfg {
    fn unlimited() -> Self {
        Self {
            soft_byte_limit: XFRM_INF,
            hard_byte_limit: XFRM_INF,
            soft_packet_limit: XFRM_INF,
            hard_packet_limit: XFRM_INF,
            ..Default::default()
        }
    }
}

/// struct xfrm_lifetime_cur.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmLifetimeCur {
    bytes: u64,
    packets: u64,
    add_time: u64,
    use_time: u64,
}

/// struct xfrm_stats.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmStats {
    replay_window: u32,
    replay: u32,
    integrity_failed: u32,
}

/// struct xfrm_usersa_info (224 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUsersaInfo {
    sel: XfrmSelector,
    id: XfrmId,
    saddr: XfrmAddress,
    lft: XfrmLifetimeCfg,
    curlft: XfrmLifetimeCur,
    stats: XfrmStats,
    seq: u32,
    reqid: u32,
    family: u16,
    mode: u8,
    replay_window: u8,
    flags: u8,
    _pad: [u8; 7],
}

/// struct xfrm_usersa_id (24 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUsersaId {
    daddr: XfrmAddress,
    spi: u32,
    family: u16,
    proto: u8,
    _pad: u8,
}

/// struct xfrm_userpolicy_info (168 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUserpolicyInfo {
    sel: XfrmSelector,
    lft: XfrmLifetimeCfg,
    curlft: XfrmLifetimeCur,
    priority: u32,
    index: u32,
    dir: u8,
    action: u8,
    flags: u8,
    share: u8,
    _pad: [u8; 4],
}

/// struct xfrm_userpolicy_id (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUserpolicyId {
    sel: XfrmSelector,
    index: u32,
    dir: u8,
    _pad: [u8; 3],
}

/// struct xfrm_user_tmpl (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUserTmpl {
    id: XfrmId,
    family: u16,
    _pad1: [u8; 2],
    saddr: XfrmAddress,
    reqid: u32,
    mode: u8,
    share: u8,
    optional: u8,
    _pad2: u8,
    aalgos: u32,
    ealgos: u32,
    calgos: u32,
}

/// struct xfrm_algo_aead header, followed on the wire by the key bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmAlgoAead {
    alg_name: [u8; 64],
    /// Key length in bits.
    alg_key_len: u32,
    /// ICV length in bits.
    alg_icv_len: u32,
}

fn aead_attr(key: &[u8]) -> Vec<u8> {
    let mut alg_name = [0u8; 64];
    alg_name[..AEAD_ALG.len()].copy_from_slice(AEAD_ALG.as_bytes());
    let header = XfrmAlgoAead {
        alg_name,
        alg_key_len: (key.len() * 8) as u32,
        alg_icv_len: AEAD_ICV_BITS,
    };
    let mut buf = Vec::with_capacity(72 + key.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(key);
    buf
}

fn esp_selector(spec: &PolicySpec) -> XfrmSelector {
    XfrmSelector {
        daddr: XfrmAddress::from_v4(spec.dst),
        saddr: XfrmAddress::from_v4(spec.src),
        family: AF_INET,
        prefixlen_d: 32,
        prefixlen_s: 32,
        proto: IPPROTO_UDP,
        ..Default::default()
    }
}

fn spi_be(spi: Spi) -> u32 {
    spi.0.to_be()
}

/// Blocking NETLINK_XFRM connection implementing the installer command set.
pub struct XfrmSocket {
    sock: NetlinkSocket,
}

impl XfrmSocket {
    pub fn connect() -> Result<Self, Error> {
        let sock = NetlinkSocket::open(libc::NETLINK_XFRM, 0)?;
        Ok(Self { sock })
    }

    fn request(&self, kind: u16, flags: u16, payload: &[u8]) -> Result<(), Error> {
        let seq = self.sock.next_seq();
        let msg = MsgBuilder::new(kind, flags | NLM_F_REQUEST | NLM_F_ACK, seq)
            .payload(payload)
            .finish();
        self.sock.request_ack(msg)
    }

    fn request_with_attr(
        &self,
        kind: u16,
        flags: u16,
        payload: &[u8],
        attr_kind: u16,
        attr: &[u8],
    ) -> Result<(), Error> {
        let seq = self.sock.next_seq();
        let msg = MsgBuilder::new(kind, flags | NLM_F_REQUEST | NLM_F_ACK, seq)
            .payload(payload)
            .attr(attr_kind, attr)
            .finish();
        self.sock.request_ack(msg)
    }
}

impl XfrmBackend for XfrmSocket {
    fn add_sa(&mut self, sa: &SaSpec) -> Result<()> {
        let info = XfrmUsersaInfo {
            id: XfrmId {
                daddr: XfrmAddress::from_v4(sa.dst),
                spi: spi_be(sa.spi),
                proto: IPPROTO_ESP,
                ..Default::default()
            },
            saddr: XfrmAddress::from_v4(sa.src),
            lft: XfrmLifetimeCfg::unlimited(),
            family: AF_INET,
            mode: XFRM_MODE_TRANSPORT,
            ..Default::default()
        };
        self.request_with_attr(
            XFRM_MSG_NEWSA,
            NLM_F_CREATE | NLM_F_EXCL,
            info.as_bytes(),
            XFRMA_ALG_AEAD,
            &aead_attr(&sa.key),
        )?;
        Ok(())
    }

    fn del_sa(&mut self, dst: Ipv4Addr, spi: Spi) -> Result<()> {
        let id = XfrmUsersaId {
            daddr: XfrmAddress::from_v4(dst),
            spi: spi_be(spi),
            family: AF_INET,
            proto: IPPROTO_ESP,
            ..Default::default()
        };
        self.request(XFRM_MSG_DELSA, 0, id.as_bytes())?;
        Ok(())
    }

    fn add_policy(&mut self, policy: &PolicySpec) -> Result<()> {
        let info = XfrmUserpolicyInfo {
            sel: esp_selector(policy),
            lft: XfrmLifetimeCfg::unlimited(),
            dir: XFRM_POLICY_OUT,
            action: XFRM_POLICY_ALLOW,
            ..Default::default()
        };
        let tmpl = XfrmUserTmpl {
            id: XfrmId {
                daddr: XfrmAddress::from_v4(policy.dst),
                spi: spi_be(policy.spi),
                proto: IPPROTO_ESP,
                ..Default::default()
            },
            family: AF_INET,
            saddr: XfrmAddress::from_v4(policy.src),
            mode: XFRM_MODE_TRANSPORT,
            share: XFRM_SHARE_ANY,
            ..Default::default()
        };
        self.request_with_attr(
            XFRM_MSG_NEWPOLICY,
            NLM_F_CREATE | NLM_F_EXCL,
            info.as_bytes(),
            XFRMA_TMPL,
            tmpl.as_bytes(),
        )?;
        Ok(())
    }

    fn del_policy(&mut self, policy: &PolicySpec) -> Result<()> {
        let id = XfrmUserpolicyId {
            sel: esp_selector(policy),
            dir: XFRM_POLICY_OUT,
            ..Default::default()
        };
        self.request(XFRM_MSG_DELPOLICY, 0, id.as_bytes())?;
        Ok(())
    }

    fn flush_sa_esp(&mut self) -> Result<()> {
        // xfrm_usersa_flush is a single protocol byte.
        self.request(XFRM_MSG_FLUSHSA, 0, &[IPPROTO_ESP])?;
        Ok(())
    }

    fn flush_policies(&mut self) -> Result<()> {
        self.request(XFRM_MSG_FLUSHPOLICY, 0, &[])?;
        Ok(())
    }
}
