//! Routing of notifications, indications and Service Changed events.

use std::sync::Arc;

use crate::{
    adapter::{Adapter, ConfirmFn},
    att::{Handle, HandleRange},
    peers::{PeerId, PeerStateTable},
    store::{AttributeStore, ObserverId, ServiceHook},
};

/// Kind of value push towards subscribed peers.
#[derive(Clone)]
pub enum NotifyKind {
    /// Unacknowledged notification; requires CCC bit 0.
    Notify,
    /// Acknowledged indication; requires CCC bit 1.
    ///
    /// The optional callback is invoked per peer when its ATT confirmation
    /// arrives.
    Indicate(Option<ConfirmFn>),
}

impl std::fmt::Debug for NotifyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Notify => write!(f, "Notify"),
            Self::Indicate(confirm) => write!(f, "Indicate {{ confirm: {} }}", confirm.is_some()),
        }
    }
}

/// Observes structural database changes and pushes value changes to
/// subscribed peers.
pub(crate) struct ChangeNotifier {
    adapter: Arc<dyn Adapter>,
    peers: Arc<PeerStateTable>,
    /// Value handle of the Service Changed characteristic.
    svc_chngd: Handle,
    /// Handle of the Service Changed CCC descriptor.
    svc_chngd_ccc: Handle,
}

impl ChangeNotifier {
    pub fn new(
        adapter: Arc<dyn Adapter>, peers: Arc<PeerStateTable>, svc_chngd: Handle, svc_chngd_ccc: Handle,
    ) -> Arc<Self> {
        Arc::new(Self { adapter, peers, svc_chngd, svc_chngd_ccc })
    }

    /// Subscribes to the store's structural hooks.
    ///
    /// Service Changed is indicated after the mutation is visible in the
    /// store; on removal, stale CCC entries of the vanished range are purged
    /// after the indication went out.
    pub fn register(self: Arc<Self>, store: &AttributeStore) -> ObserverId {
        let added = {
            let this = self.clone();
            Box::new(move |range: HandleRange| {
                log::debug!("GATT service added to local database");
                this.send_service_changed(range);
            }) as ServiceHook
        };
        let removed = {
            let this = self;
            Box::new(move |range: HandleRange| {
                log::debug!("local GATT service removed");
                this.send_service_changed(range);
                this.peers.remove_ccc_in_range(range);
            }) as ServiceHook
        };
        store.register_observer(added, removed)
    }

    fn send_service_changed(&self, range: HandleRange) {
        let value = range.to_le_bytes();
        let confirm: ConfirmFn = Arc::new(|| {
            log::debug!("GATT server received Service Changed confirmation");
        });
        self.notify(self.svc_chngd, &value, self.svc_chngd_ccc, NotifyKind::Indicate(Some(confirm)));
    }

    /// Pushes a value to every peer subscribed through the given CCC
    /// descriptor handle.
    ///
    /// Peers without a matching CCC entry, or with the relevant bit clear,
    /// are skipped. Delivery failures are logged and do not affect the
    /// remaining peers. Peers that are bonded but currently disconnected do
    /// not receive queued values.
    pub fn notify(&self, handle: Handle, value: &[u8], ccc_handle: Handle, kind: NotifyKind) {
        let mut targets: Vec<PeerId> = Vec::new();
        self.peers.for_each_peer(|peer, state| {
            let Some(entry) = state.ccc(ccc_handle) else { return };
            let subscribed = match &kind {
                NotifyKind::Notify => entry.notifications_enabled(),
                NotifyKind::Indicate(_) => entry.indications_enabled(),
            };
            if subscribed {
                targets.push(peer);
            }
        });

        for peer in targets {
            let Some(bearer) = self.adapter.att_bearer(peer) else {
                continue;
            };
            let result = match &kind {
                NotifyKind::Notify => {
                    log::debug!("GATT server sending notification for handle {handle}");
                    bearer.send_notification(handle, value)
                }
                NotifyKind::Indicate(confirm) => {
                    log::debug!("GATT server sending indication for handle {handle}");
                    let confirm = confirm.clone().unwrap_or_else(|| {
                        Arc::new(|| log::debug!("GATT server received confirmation"))
                    });
                    bearer.send_indication(handle, value, confirm)
                }
            };
            if let Err(err) = result {
                log::error!("delivery to {} failed: {}", peer.address, err);
            }
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("svc_chngd", &self.svc_chngd)
            .field("svc_chngd_ccc", &self.svc_chngd_ccc)
            .finish()
    }
}
