//! Hairpin-mode watchdog for a bridge port.
//!
//! Hairpin mode reflects traffic back out the port it arrived on and must
//! never be enabled on an overlay bridge port. The watch does a one-time
//! check of the port's current state and then consumes live link-change
//! notifications until cancelled.

use log::{debug, error};
use tokio::sync::{mpsc, watch};

use crate::link::{LinkUpdate, LinkView};

/// One detected policy violation: hairpin mode seen enabled on the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HairpinViolation {
    pub port: String,
}

/// Watch `port_name` for hairpin-mode violations.
///
/// Lookup or protinfo failures on the initial check are logged and the
/// watch proceeds to the live stream anyway. Every matching event with the
/// hairpin flag set produces exactly one `report` call (and an error-level
/// log record); events for other ports are ignored here rather than
/// filtered at the subscription, which covers the whole link namespace.
///
/// Runs until `cancel` flips to `true` (or its sender drops) or the event
/// stream closes. Run it on its own task for the lifetime of the port.
pub async fn watch_hairpin<V, F>(
    view: &V,
    events: &mut mpsc::Receiver<LinkUpdate>,
    port_name: &str,
    mut cancel: watch::Receiver<bool>,
    mut report: F,
) where
    V: LinkView,
    F: FnMut(HairpinViolation),
{
    let link = match view.link_by_name(port_name) {
        Ok(Some(link)) => Some(link),
        Ok(None) => {
            error!("unable to find link {:?}", port_name);
            None
        }
        Err(e) => {
            error!("unable to find link {:?}: {:#}", port_name, e);
            None
        }
    };

    if let Some(link) = link {
        match view.protinfo(&link) {
            Ok(Some(pi)) if pi.hairpin => {
                error!("hairpin mode enabled on {:?}", port_name);
                report(HairpinViolation {
                    port: port_name.to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => error!("unable to get link protinfo {:?}: {:#}", port_name, e),
        }
    }

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!("hairpin watch on {:?} cancelled", port_name);
                    return;
                }
            }
            update = events.recv() => {
                let Some(update) = update else {
                    debug!("link event stream for {:?} closed", port_name);
                    return;
                };
                if update.name == port_name && update.hairpin == Some(true) {
                    error!("hairpin mode enabled on {:?}", port_name);
                    report(HairpinViolation {
                        port: update.name,
                    });
                }
            }
        }
    }
}

/// Watch a real port via netlink: opens the route query socket and the
/// link-change subscription, then runs [`watch_hairpin`] until cancelled.
/// Violations surface as error-level log records.
#[cfg(target_os = "linux")]
pub async fn watch_port(
    port_name: &str,
    event_buffer: usize,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let view = crate::netlink::RouteSocket::connect().context("netlink route connect")?;
    let mut events =
        crate::netlink::route::subscribe_links(event_buffer).context("link subscribe")?;
    watch_hairpin(&view, &mut events, port_name, cancel, |_| {}).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Link, LinkKind, Protinfo};
    use anyhow::Result;

    struct FakeView {
        link: Option<Link>,
        hairpin_now: bool,
    }

    impl LinkView for FakeView {
        fn link_by_name(&self, _name: &str) -> Result<Option<Link>> {
            Ok(self.link.clone())
        }

        fn protinfo(&self, _link: &Link) -> Result<Option<Protinfo>> {
            Ok(Some(Protinfo {
                hairpin: self.hairpin_now,
            }))
        }
    }

    fn port_link() -> Link {
        Link {
            index: 7,
            name: "vethwepl1".to_string(),
            kind: LinkKind::Other("veth".to_string()),
        }
    }

    fn update(name: &str, hairpin: Option<bool>) -> LinkUpdate {
        LinkUpdate {
            name: name.to_string(),
            hairpin,
        }
    }

    async fn run_watch(
        view: FakeView,
        updates: Vec<LinkUpdate>,
    ) -> Vec<HairpinViolation> {
        let (tx, mut rx) = mpsc::channel(16);
        for up in updates {
            tx.send(up).await.unwrap();
        }
        drop(tx); // watch returns once the stream drains

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut seen = Vec::new();
        watch_hairpin(&view, &mut rx, "vethwepl1", cancel_rx, |v| seen.push(v)).await;
        seen
    }

    #[tokio::test]
    async fn test_reports_once_per_matching_event() {
        let view = FakeView {
            link: Some(port_link()),
            hairpin_now: false,
        };
        let seen = run_watch(
            view,
            vec![
                update("vethwepl1", Some(true)),
                update("vethwepl1", Some(false)),
                update("vethwepl1", Some(true)),
            ],
        )
        .await;

        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|v| v.port == "vethwepl1"));
    }

    #[tokio::test]
    async fn test_ignores_other_ports_and_missing_protinfo() {
        let view = FakeView {
            link: Some(port_link()),
            hairpin_now: false,
        };
        let seen = run_watch(
            view,
            vec![
                update("eth0", Some(true)),
                update("vethwepl2", Some(true)),
                update("vethwepl1", None),
            ],
        )
        .await;

        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_initial_state_violation() {
        let view = FakeView {
            link: Some(port_link()),
            hairpin_now: true,
        };
        let seen = run_watch(view, vec![]).await;
        assert_eq!(seen, vec![HairpinViolation {
            port: "vethwepl1".to_string(),
        }]);
    }

    #[tokio::test]
    async fn test_missing_link_still_watches_stream() {
        // Resolution fails, the subscription is consumed regardless.
        let view = FakeView {
            link: None,
            hairpin_now: true,
        };
        let seen = run_watch(view, vec![update("vethwepl1", Some(true))]).await;
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_watch() {
        let view = FakeView {
            link: Some(port_link()),
            hairpin_now: false,
        };
        let (_tx, mut rx) = mpsc::channel::<LinkUpdate>(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            watch_hairpin(&view, &mut rx, "vethwepl1", cancel_rx, |v| seen.push(v)).await;
            seen
        });

        cancel_tx.send(true).unwrap();
        let seen = handle.await.unwrap();
        assert!(seen.is_empty());
    }
}
