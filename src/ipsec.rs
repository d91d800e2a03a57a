//! Encrypted tunnel plumbing: SPI derivation and kernel SA/policy installs.
//!
//! All cryptography happens in the kernel. This module only derives the
//! per-peer-pair security parameter indices and issues the narrow command
//! set against the kernel's security-policy database: add SA, add policy,
//! delete, flush. No kernel state is mirrored locally.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use anyhow::{ensure, Context, Result};
use log::info;

/// Short identifier a mesh peer is known by, supplied by the membership
/// layer. Opaque here except for its bit width.
pub type PeerShortId = u16;

/// Bits of a [`PeerShortId`] actually used by the membership layer.
pub const PEER_SHORT_ID_BITS: u32 = 12;

/// AEAD transform installed for every SA.
pub const AEAD_ALG: &str = "rfc4106(gcm(aes))";
/// Key material consumed per SA: 128-bit AES key plus the 4-byte salt
/// rfc4106 appends. Shorter session keys are a contract violation.
pub const AEAD_KEY_LEN: usize = 20;
/// Integrity check value length, in bits.
pub const AEAD_ICV_BITS: u32 = 128;

/// Security parameter index for one direction of a peer pair.
///
/// Layout is `| 0.. src peer | 0.. dst peer |` in the two 16-bit halves.
/// The 8 bits above [`PEER_SHORT_ID_BITS`] in each half stay zero, which
/// makes SPIs predictable and leaves collision headroom unused; the layout
/// is wire-visible, so it stays as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Spi(pub u32);

impl fmt::Display for Spi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Derive the SPI for traffic from `src` to `dst`.
///
/// Pure and deterministic; `new_spi(a, b) != new_spi(b, a)` whenever
/// `a != b`. Fails only if the configured peer-id width no longer fits the
/// reserved 16 bits, which is a configuration bug, not a runtime condition.
pub fn new_spi(src: PeerShortId, dst: PeerShortId) -> Result<Spi> {
    spi_with_width(src, dst, PEER_SHORT_ID_BITS)
}

fn spi_with_width(src: PeerShortId, dst: PeerShortId, bits: u32) -> Result<Spi> {
    ensure!(bits <= 16, "peer short id too long ({} bits)", bits);
    Ok(Spi((src as u32) << 16 | dst as u32))
}

/// One security association to install: encrypts/authenticates traffic from
/// `src` to `dst` under `spi`.
#[derive(Clone, PartialEq, Eq)]
pub struct SaSpec {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub spi: Spi,
    /// Exactly [`AEAD_KEY_LEN`] bytes.
    pub key: Vec<u8>,
}

// Key material must not end up in logs.
impl fmt::Debug for SaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaSpec")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("spi", &self.spi)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// One outbound security policy: UDP traffic `src/32 -> dst/32` must go
/// through the transport-mode ESP transform identified by `spi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySpec {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub spi: Spi,
}

/// Command set against the kernel's security-policy database.
///
/// The real implementation is [`crate::netlink::xfrm::XfrmSocket`]; tests
/// substitute a recording mock.
pub trait XfrmBackend {
    fn add_sa(&mut self, sa: &SaSpec) -> Result<()>;
    fn del_sa(&mut self, dst: Ipv4Addr, spi: Spi) -> Result<()>;
    fn add_policy(&mut self, policy: &PolicySpec) -> Result<()>;
    fn del_policy(&mut self, policy: &PolicySpec) -> Result<()>;
    /// Flush every ESP security association system-wide.
    fn flush_sa_esp(&mut self) -> Result<()>;
    /// Flush every security policy system-wide.
    fn flush_policies(&mut self) -> Result<()>;
}

/// Installer for per-peer-pair security associations and policies.
///
/// All operations are synchronous blocking kernel calls and are serialized
/// by one internal lock: the kernel offers no compare-and-swap across the
/// multi-step install sequence, so overlapping `setup`/`teardown`/`reset`
/// calls must not interleave.
pub struct Ipsec<B> {
    backend: Mutex<B>,
}

impl<B: XfrmBackend> Ipsec<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    /// Flush *all* security policies and *all* ESP security associations,
    /// system-wide. Not scoped to any peer pair.
    ///
    /// A policy-flush success followed by a state-flush failure still
    /// reports failure and leaves the database half-flushed; retry `reset`
    /// to completion.
    pub fn reset(&self) -> Result<()> {
        let mut backend = self.lock();

        backend.flush_policies().context("xfrm policy flush")?;
        backend.flush_sa_esp().context("xfrm state flush")?;

        Ok(())
    }

    /// Establish the kernel state for a bidirectional session with a peer:
    /// inbound SA, then outbound SA, then the outbound policy.
    ///
    /// In that order an arriving packet is decryptable before any outbound
    /// traffic can be routed through the new policy. The first failure
    /// aborts the sequence; already-installed objects are *not* rolled
    /// back, callers run `teardown` or `reset` after an error.
    pub fn setup(
        &self,
        local_peer: PeerShortId,
        remote_peer: PeerShortId,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        session_key: &[u8],
    ) -> Result<()> {
        ensure!(
            session_key.len() >= AEAD_KEY_LEN,
            "session key too short: {} bytes, need at least {}",
            session_key.len(),
            AEAD_KEY_LEN
        );

        let out_spi = new_spi(local_peer, remote_peer).context("new SPI")?;
        let in_spi = new_spi(remote_peer, local_peer).context("new SPI")?;
        let key = session_key[..AEAD_KEY_LEN].to_vec();

        let mut backend = self.lock();

        let in_sa = SaSpec {
            src: remote_addr,
            dst: local_addr,
            spi: in_spi,
            key: key.clone(),
        };
        backend.add_sa(&in_sa).context("xfrm state (in) add")?;

        let out_sa = SaSpec {
            src: local_addr,
            dst: remote_addr,
            spi: out_spi,
            key,
        };
        backend.add_sa(&out_sa).context("xfrm state (out) add")?;

        let policy = PolicySpec {
            src: local_addr,
            dst: remote_addr,
            spi: out_spi,
        };
        backend.add_policy(&policy).context("xfrm policy add")?;

        info!(
            "ipsec session {} -> {} established (out SPI {}, in SPI {})",
            local_peer, remote_peer, out_spi, in_spi
        );
        Ok(())
    }

    /// Remove the outbound policy and the two SAs installed by a matching
    /// `setup`. Policy goes first so no plaintext leaks while the SAs are
    /// being torn down.
    pub fn teardown(
        &self,
        local_peer: PeerShortId,
        remote_peer: PeerShortId,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
    ) -> Result<()> {
        let out_spi = new_spi(local_peer, remote_peer).context("new SPI")?;
        let in_spi = new_spi(remote_peer, local_peer).context("new SPI")?;

        let mut backend = self.lock();

        let policy = PolicySpec {
            src: local_addr,
            dst: remote_addr,
            spi: out_spi,
        };
        backend.del_policy(&policy).context("xfrm policy del")?;
        backend
            .del_sa(remote_addr, out_spi)
            .context("xfrm state (out) del")?;
        backend
            .del_sa(local_addr, in_spi)
            .context("xfrm state (in) del")?;

        info!("ipsec session {} -> {} removed", local_peer, remote_peer);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, B> {
        match self.backend.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.lock())
    }
}
