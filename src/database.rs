//! The local GATT server database.

use dbus::{message::MatchRule, nonblock::SyncConnection, Path};
use dbus_crossroads::Crossroads;
use futures::StreamExt;
use std::{
    fmt,
    sync::{Arc, Mutex},
};
use tokio::task::JoinHandle;

use crate::{
    adapter::Adapter,
    att::{Handle, ATT_CID, ATT_PSM},
    core_services::{self, CoreServices},
    l2cap::{Security, SecurityLevel, Socket, SocketAddr, StreamListener},
    notifier::{ChangeNotifier, NotifyKind},
    peers::PeerStateTable,
    registry::ExternalServiceRegistry,
    store::{AttributeStore, ServiceId},
    AddressType, Error, ErrorKind, Result,
};

const LISTEN_BACKLOG: u32 = 5;

/// The GATT server database of one Bluetooth adapter.
///
/// Construction populates the attribute store with the mandatory GAP and
/// GATT services, publishes their SDP records and wires the Service Changed
/// machinery. [attach_transports](Self::attach_transports) opens the ATT
/// listening sockets and [serve](Self::serve) exposes the management
/// interface on the bus.
///
/// The database owns its listening sockets, SDP records and imported
/// external services; dropping it releases all of them.
#[derive(Clone)]
pub struct GattDatabase {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    adapter: Arc<dyn Adapter>,
    store: Arc<AttributeStore>,
    peers: Arc<PeerStateTable>,
    notifier: Arc<ChangeNotifier>,
    core: CoreServices,
    registry: Mutex<Option<Arc<ExternalServiceRegistry>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for GattDatabase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GattDatabase")
            .field("adapter", &self.inner.adapter.name())
            .field("store", &self.inner.store)
            .finish()
    }
}

impl GattDatabase {
    /// Creates the database for the given adapter.
    ///
    /// The GAP and GATT services are present and active when this returns.
    /// On failure all partial state is torn down.
    pub fn new(adapter: Arc<dyn Adapter>) -> Result<Self> {
        let store = Arc::new(AttributeStore::new());
        let peers = Arc::new(PeerStateTable::new());

        let core = core_services::register_core_services(&store, &peers, &adapter)?;
        let notifier =
            ChangeNotifier::new(adapter.clone(), peers.clone(), core.svc_chngd, core.svc_chngd_ccc);
        notifier.clone().register(&store);

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                adapter,
                store,
                peers,
                notifier,
                core,
                registry: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The attribute store.
    ///
    /// The connection layer dispatches peer reads and writes through it, and
    /// daemon-internal services may register additional attributes.
    pub fn store(&self) -> &Arc<AttributeStore> {
        &self.inner.store
    }

    /// The per-peer subscription state table.
    pub fn peers(&self) -> &Arc<PeerStateTable> {
        &self.inner.peers
    }

    /// The GAP service.
    pub fn gap_service(&self) -> ServiceId {
        self.inner.core.gap
    }

    /// The GATT service.
    pub fn gatt_service(&self) -> ServiceId {
        self.inner.core.gatt
    }

    /// Value handle of the Service Changed characteristic.
    pub fn service_changed_handle(&self) -> Handle {
        self.inner.core.svc_chngd
    }

    /// Handle of the Service Changed CCC descriptor.
    pub fn service_changed_ccc_handle(&self) -> Handle {
        self.inner.core.svc_chngd_ccc
    }

    /// Adds a Client Characteristic Configuration descriptor, backed by the
    /// per-peer state table, to the most recently added characteristic of
    /// the service.
    pub fn add_ccc(&self, service: ServiceId) -> Result<Handle> {
        core_services::add_ccc(&self.inner.store, &self.inner.peers, service)
    }

    /// Pushes a characteristic value to every peer subscribed through the
    /// given CCC descriptor handle.
    ///
    /// Peers whose CCC entry is missing or whose relevant bit is clear are
    /// skipped. Delivery failures affect only the peer concerned.
    pub fn notify(&self, handle: Handle, value: &[u8], ccc_handle: Handle, kind: NotifyKind) {
        self.inner.notifier.notify(handle, value, ccc_handle, kind);
    }

    /// Opens the ATT listening sockets: LE on the fixed ATT channel and
    /// BR/EDR on the ATT PSM, both with low security.
    ///
    /// Accepted connections are resolved and attached to the adapter's
    /// device objects. The sockets are owned by the database and closed
    /// when it is dropped.
    pub fn attach_transports(&self) -> Result<()> {
        let addr = self.inner.adapter.address();

        let le = Socket::new()?;
        le.bind(SocketAddr::new_fixed(addr, AddressType::LePublic, ATT_CID))?;
        le.set_security(Security { level: SecurityLevel::Low, key_size: 0 })?;
        let le = le.listen(LISTEN_BACKLOG)?;

        let bredr = Socket::new()?;
        bredr.bind(SocketAddr::new(addr, AddressType::BrEdr, ATT_PSM))?;
        bredr.set_security(Security { level: SecurityLevel::Low, key_size: 0 })?;
        let bredr = bredr.listen(LISTEN_BACKLOG)?;

        let mut tasks = self.inner.tasks.lock().unwrap();
        for listener in [le, bredr] {
            let adapter = self.inner.adapter.clone();
            tasks.push(tokio::spawn(accept_loop(listener, adapter)));
        }
        Ok(())
    }

    /// Connects to the D-Bus system bus and serves the management interface
    /// on it.
    ///
    /// The connection is returned so the embedding daemon can share it.
    pub async fn serve_system_bus(&self) -> Result<Arc<SyncConnection>> {
        let (resource, connection) = tokio::task::spawn_blocking(dbus_tokio::connection::new_system_sync).await??;
        log::debug!("connected to D-Bus with unique name {}", connection.unique_name());

        let resource_task = tokio::spawn(async move {
            let err = resource.await;
            log::error!("D-Bus connection terminated: {err}");
        });
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.push(resource_task);
        }

        self.serve(connection.clone()).await?;
        Ok(connection)
    }

    /// Registers the `org.bluez.GattManager1` interface on the adapter
    /// object and starts handling its method calls.
    pub async fn serve(&self, connection: Arc<SyncConnection>) -> Result<()> {
        let registry = ExternalServiceRegistry::new(connection.clone(), self.inner.store.clone());

        let mut cr = Crossroads::new();
        cr.set_async_support(Some((
            connection.clone(),
            Box::new(|x| {
                tokio::spawn(x);
            }),
        )));
        let manager_token = ExternalServiceRegistry::register_interface(&mut cr);
        let path = adapter_dbus_path(&self.inner.adapter.name())?;
        cr.insert(path.clone(), &[manager_token], registry.clone());

        let mc = connection.add_match(MatchRule::new_method_call()).await?;
        let mc_connection = connection.clone();
        let task = tokio::spawn(async move {
            let (_mc, mut mc_stream) = mc.msg_stream();
            while let Some(msg) = mc_stream.next().await {
                let _ = cr.handle_message(msg, &*mc_connection);
            }
        });

        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.push(task);
        }
        *self.inner.registry.lock().unwrap() = Some(registry);

        log::debug!("GATT manager registered for adapter {}", path);
        Ok(())
    }
}

async fn accept_loop(listener: StreamListener, adapter: Arc<dyn Adapter>) {
    let src = adapter.address();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("new incoming ATT connection from {}", peer.addr);
                adapter.attach_att(stream, src, peer.addr, peer.addr_type);
            }
            // a connection aborted before accept only affects that peer
            Err(err) if err.raw_os_error() == Some(libc::ECONNABORTED) => {
                log::debug!("incoming ATT connection aborted: {err}");
            }
            Err(err) => {
                log::error!("ATT listener failed: {err}");
                break;
            }
        }
    }
}

fn adapter_dbus_path(adapter_name: &str) -> Result<Path<'static>> {
    Path::new(format!("/org/bluez/{adapter_name}"))
        .map_err(|_| Error::new(ErrorKind::InvalidName(adapter_name.to_string())))
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let tasks = self.tasks.lock().unwrap();
        for task in tasks.iter() {
            task.abort();
        }

        if let Some(registry) = self.registry.lock().unwrap().take() {
            registry.clear();
        }

        if let Some(record) = self.core.gatt_record {
            self.adapter.remove_service_record(record);
        }
        if let Some(record) = self.core.gap_record {
            self.adapter.remove_service_record(record);
        }

        // TODO: persistently store CCC states before purging them
        self.peers.clear();
    }
}
