//! Registration of external GATT services over D-Bus.
//!
//! Out-of-process publishers register a service through the
//! `org.bluez.GattManager1` interface on the adapter object. The registry
//! imports the published attribute subtree into the attribute store, keeps
//! the registration reply pending until the publisher's object tree has been
//! enumerated, and watches the publisher so the imported service disappears
//! the moment its owner does.

use dbus::{
    arg::{prop_cast, PropMap},
    channel::Token,
    message::{MatchRule, SignalArgs},
    nonblock::{
        stdintf::org_freedesktop_dbus::{ObjectManager, ObjectManagerInterfacesRemoved},
        Proxy, SyncConnection,
    },
    strings::BusName,
    MethodErr, Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use futures::channel::mpsc;
use futures::StreamExt;
use std::{
    collections::HashMap,
    fmt,
    mem::take,
    sync::{Arc, Mutex, Weak},
};
use uuid::Uuid;

use crate::{
    att::{UUID_GAP, UUID_GATT},
    dbus_method,
    store::{AttributeStore, ServiceId},
    DbusResult, UuidExt, ERR_PREFIX, TIMEOUT,
};

pub(crate) const MANAGER_INTERFACE: &str = "org.bluez.GattManager1";
pub(crate) const SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub(crate) const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub(crate) const DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";

fn err_invalid_args() -> MethodErr {
    MethodErr::from((ERR_PREFIX.to_string() + "InvalidArguments", "Invalid arguments"))
}

fn err_already_exists() -> MethodErr {
    MethodErr::from((ERR_PREFIX.to_string() + "AlreadyExists", "Already exists"))
}

fn err_failed(message: &str) -> MethodErr {
    MethodErr::from((ERR_PREFIX.to_string() + "Failed", message))
}

/// Lifecycle of an external service registration.
///
/// Transitions are one-way; no state is revisited.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
enum ServiceState {
    /// Registration in flight; the method reply is pending until the
    /// publisher's object tree has been enumerated.
    Registering,
    /// Imported into the attribute store and active.
    Registered,
    /// Being torn down; the record is destroyed on a later scheduler turn.
    Dying,
}

/// Registration key: publisher plus the object path it registered.
type ServiceKey = (String, Path<'static>);

/// Record of one registered external service.
pub(crate) struct ExternalService {
    /// Unique bus name of the publisher.
    owner: String,
    /// Path of the `GattService1` root object in the publisher's namespace.
    path: Path<'static>,
    state: Mutex<ServiceState>,
    /// Handle of the imported service definition, once present.
    attrib: Mutex<Option<ServiceId>>,
    /// Match tokens of the liveness and tree watches.
    watches: Mutex<Vec<Token>>,
}

impl ExternalService {
    fn new(owner: String, path: Path<'static>) -> Arc<Self> {
        Arc::new(Self {
            owner,
            path,
            state: Mutex::new(ServiceState::Registering),
            attrib: Mutex::new(None),
            watches: Mutex::new(Vec::new()),
        })
    }
}

impl fmt::Debug for ExternalService {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ExternalService")
            .field("owner", &self.owner)
            .field("path", &self.path)
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}

/// Broker of external GATT service registrations.
pub struct ExternalServiceRegistry {
    connection: Arc<SyncConnection>,
    store: Arc<AttributeStore>,
    services: Mutex<HashMap<ServiceKey, Arc<ExternalService>>>,
    teardown_tx: mpsc::UnboundedSender<ServiceKey>,
}

impl fmt::Debug for ExternalServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let services = self.services.lock().unwrap();
        f.debug_struct("ExternalServiceRegistry").field("services", &services.len()).finish()
    }
}

impl ExternalServiceRegistry {
    /// Creates the registry and spawns its teardown queue.
    ///
    /// Publisher watches enqueue removals instead of tearing the record down
    /// inside their own callback; the queue drains on later scheduler turns.
    pub(crate) fn new(connection: Arc<SyncConnection>, store: Arc<AttributeStore>) -> Arc<Self> {
        let (teardown_tx, mut teardown_rx) = mpsc::unbounded();
        let registry = Arc::new(Self {
            connection,
            store,
            services: Mutex::new(HashMap::new()),
            teardown_tx,
        });

        let weak: Weak<Self> = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(key) = teardown_rx.next().await {
                let Some(registry) = weak.upgrade() else { break };
                registry.teardown(&key);
            }
        });

        registry
    }

    /// Registers the `GattManager1` interface.
    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(MANAGER_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async(
                "RegisterService",
                ("service", "options"),
                (),
                |ctx, cr, (path, options): (Path<'static>, PropMap)| {
                    let sender = ctx.message().sender().map(|s| s.to_string()).unwrap_or_default();
                    dbus_method(ctx, cr, move |reg: Arc<Self>| async move {
                        reg.register_service(sender, path, options).await
                    })
                },
            );
            ib.method_with_cr_async(
                "UnregisterService",
                ("service",),
                (),
                |ctx, cr, (path,): (Path<'static>,)| {
                    let sender = ctx.message().sender().map(|s| s.to_string()).unwrap_or_default();
                    dbus_method(ctx, cr, move |reg: Arc<Self>| async move {
                        reg.unregister_service(sender, path).await
                    })
                },
            );
        })
    }

    /// Handles a `RegisterService` call.
    ///
    /// The reply stays pending until the publisher's object tree has been
    /// enumerated and the service was imported, or the import failed.
    async fn register_service(
        self: Arc<Self>, sender: String, path: Path<'static>, _options: PropMap,
    ) -> DbusResult<()> {
        if sender.is_empty() || !path.starts_with('/') {
            return Err(err_invalid_args());
        }

        let key: ServiceKey = (sender.clone(), path.clone());
        let service = ExternalService::new(sender, path);
        {
            let mut services = self.services.lock().unwrap();
            if services.contains_key(&key) {
                return Err(err_already_exists());
            }
            services.insert(key.clone(), service.clone());
        }
        log::debug!("registering service {} for {}", service.path, service.owner);

        match self.import_service(&service).await {
            Ok(()) => {
                log::debug!("GATT service registered: {}", service.path);
                Ok(())
            }
            Err(message) => {
                log::error!("registration of {} failed: {}", service.path, message);
                self.teardown(&key);
                Err(err_failed(&message))
            }
        }
    }

    /// Handles an `UnregisterService` call: authoritative removal, same
    /// teardown path as a publisher-initiated one.
    async fn unregister_service(self: Arc<Self>, sender: String, path: Path<'static>) -> DbusResult<()> {
        log::debug!("unregistering service {} for {}", path, sender);
        let key: ServiceKey = (sender, path);
        if self.teardown(&key) {
            Ok(())
        } else {
            Err(err_failed("Service is not registered"))
        }
    }

    /// Watches the publisher, enumerates its tree and imports the service.
    ///
    /// Returns the failure message for the deferred reply on error.
    async fn import_service(&self, service: &Arc<ExternalService>) -> Result<(), String> {
        self.watch_publisher(service)
            .await
            .map_err(|_| "Failed to watch service owner".to_string())?;

        let proxy =
            Proxy::new(service.owner.clone(), service.path.clone(), TIMEOUT, self.connection.clone());
        let objects: HashMap<Path<'static>, HashMap<String, PropMap>> = proxy
            .get_managed_objects()
            .await
            .map_err(|_| "No service object found".to_string())?;

        let (_, props) =
            service_object(&objects, &service.path).ok_or_else(|| "No service object found".to_string())?;
        let (uuid, primary) = parse_service_properties(props)?;
        let reserved = count_reserved_handles(&objects, &service.path);

        if *service.state.lock().unwrap() == ServiceState::Dying {
            return Err("Service owner disconnected".to_string());
        }

        let id = self
            .store
            .add_service(uuid, primary, reserved)
            .map_err(|_| "Failed to create entry in database".to_string())?;
        if let Err(err) = self.store.set_active(id, true) {
            log::error!("failed to activate imported service: {err}");
            let _ = self.store.remove_service(id);
            return Err("Failed to create entry in database".to_string());
        }
        *service.attrib.lock().unwrap() = Some(id);

        // The publisher may have vanished while the service was imported;
        // in that case the teardown queue wins and the reply is a failure.
        let mut state = service.state.lock().unwrap();
        if *state == ServiceState::Dying {
            drop(state);
            if let Some(id) = service.attrib.lock().unwrap().take() {
                let _ = self.store.remove_service(id);
            }
            return Err("Service owner disconnected".to_string());
        }
        *state = ServiceState::Registered;
        Ok(())
    }

    /// Observes the publisher's liveness and its object tree.
    ///
    /// A dropped bus name or a removed object below the service path queues
    /// the record for teardown.
    async fn watch_publisher(&self, service: &Arc<ExternalService>) -> crate::Result<()> {
        let mut tokens = Vec::new();
        let key: ServiceKey = (service.owner.clone(), service.path.clone());

        let disconnect_rule = MatchRule::new_signal("org.freedesktop.DBus", "NameOwnerChanged");
        let owner = service.owner.clone();
        let tx = self.teardown_tx.clone();
        let disconnect_key = key.clone();
        let m = self.connection.add_match(disconnect_rule).await?.cb(
            move |_msg, (name, _old, new_owner): (String, String, String)| {
                if name == owner && new_owner.is_empty() {
                    log::debug!("client {} disconnected", name);
                    let _ = tx.unbounded_send(disconnect_key.clone());
                }
                true
            },
        );
        tokens.push(m.token());

        let owner_bus = BusName::new(service.owner.clone())
            .map_err(|_| crate::Error::new(crate::ErrorKind::InvalidArguments))?;
        let removed_rule = ObjectManagerInterfacesRemoved::match_rule(Some(&owner_bus), None).static_clone();
        let path = service.path.clone();
        let prefix = format!("{}/", service.path);
        let tx = self.teardown_tx.clone();
        let m = self.connection.add_match(removed_rule).await?.cb(
            move |_msg, (object, _interfaces): (Path<'static>, Vec<String>)| {
                if object == path || object.starts_with(&prefix) {
                    log::debug!("object {} removed, dropping service {}", object, path);
                    let _ = tx.unbounded_send(key.clone());
                }
                true
            },
        );
        tokens.push(m.token());

        *service.watches.lock().unwrap() = tokens;
        Ok(())
    }

    /// Removes the record and its imported attributes.
    ///
    /// The watches are released from a freshly spawned task so that a watch
    /// callback triggering the teardown is never destroyed from within
    /// itself. Returns whether a record existed.
    fn teardown(&self, key: &ServiceKey) -> bool {
        let service = {
            let mut services = self.services.lock().unwrap();
            match services.remove(key) {
                Some(service) => service,
                None => return false,
            }
        };

        let previous = {
            let mut state = service.state.lock().unwrap();
            let previous = *state;
            *state = ServiceState::Dying;
            previous
        };
        log::debug!("tearing down service {} (was {})", service.path, previous);

        if let Some(id) = service.attrib.lock().unwrap().take() {
            if let Err(err) = self.store.remove_service(id) {
                log::warn!("failed to remove imported service: {err}");
            }
        }

        let tokens = take(&mut *service.watches.lock().unwrap());
        if !tokens.is_empty() {
            // Release the watches on a later turn; this may run from a watch
            // callback, which must return before its match is removed.
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                let connection = self.connection.clone();
                rt.spawn(async move {
                    for token in tokens {
                        let _ = connection.remove_match(token).await;
                    }
                    drop(service);
                });
            }
        }
        true
    }

    /// Tears down every registration, publisher-side objects untouched.
    pub(crate) fn clear(&self) {
        let keys: Vec<ServiceKey> = {
            let services = self.services.lock().unwrap();
            services.keys().cloned().collect()
        };
        for key in keys {
            self.teardown(&key);
        }
    }

    /// Number of registered or in-flight services.
    pub fn len(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    /// Whether no service is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Finds the `GattService1` object of the registration: the root object
/// itself or, failing that, the shallowest object below it.
fn service_object<'a>(
    objects: &'a HashMap<Path<'static>, HashMap<String, PropMap>>, root: &Path<'static>,
) -> Option<(&'a Path<'static>, &'a PropMap)> {
    let prefix = format!("{}/", root);
    objects
        .iter()
        .filter(|(path, interfaces)| {
            (*path == root || path.starts_with(&prefix)) && interfaces.contains_key(SERVICE_INTERFACE)
        })
        .min_by_key(|(path, _)| path.len())
        .map(|(path, interfaces)| (path, &interfaces[SERVICE_INTERFACE]))
}

/// Reads and validates the `UUID` and `Primary` properties of the service
/// object.
fn parse_service_properties(props: &PropMap) -> Result<(Uuid, bool), String> {
    let uuid_str: &String =
        prop_cast(props, "UUID").ok_or_else(|| r#"Failed to read "UUID" property of service"#.to_string())?;
    let uuid =
        Uuid::parse_bt(uuid_str).ok_or_else(|| format!(r#"Invalid service UUID "{uuid_str}""#))?;

    // GAP and GATT are owned by the daemon.
    if uuid.as_u16() == Some(UUID_GAP) || uuid.as_u16() == Some(UUID_GATT) {
        return Err("GAP and GATT services must be handled by the daemon".to_string());
    }

    let primary: bool = prop_cast(props, "Primary")
        .copied()
        .ok_or_else(|| r#"Failed to read "Primary" property of service"#.to_string())?;

    Ok((uuid, primary))
}

/// Number of handles to reserve for the imported service: one for the
/// service definition, two per characteristic sub-object and one per
/// descriptor sub-object of the tree.
///
/// Detailed import of the sub-object schemas is not performed; they are
/// tracked by path prefix only.
fn count_reserved_handles(
    objects: &HashMap<Path<'static>, HashMap<String, PropMap>>, root: &Path<'static>,
) -> u16 {
    let prefix = format!("{}/", root);
    let mut reserved: u16 = 1;
    for (path, interfaces) in objects {
        if !path.starts_with(&prefix) {
            continue;
        }
        if interfaces.contains_key(CHARACTERISTIC_INTERFACE) {
            reserved = reserved.saturating_add(2);
        }
        if interfaces.contains_key(DESCRIPTOR_INTERFACE) {
            reserved = reserved.saturating_add(1);
        }
    }
    reserved
}

#[cfg(test)]
mod test {
    use super::*;
    use dbus::arg::{RefArg, Variant};

    fn props(entries: &[(&str, Box<dyn RefArg>)]) -> PropMap {
        let mut map = PropMap::new();
        for (name, value) in entries {
            map.insert(name.to_string(), Variant(value.box_clone()));
        }
        map
    }

    fn service_props(uuid: &str, primary: bool) -> PropMap {
        props(&[
            ("UUID", Box::new(uuid.to_string())),
            ("Primary", Box::new(primary)),
        ])
    }

    fn tree(
        entries: Vec<(&str, &str, PropMap)>,
    ) -> HashMap<Path<'static>, HashMap<String, PropMap>> {
        let mut objects = HashMap::new();
        for (path, interface, properties) in entries {
            let ifaces: &mut HashMap<String, PropMap> =
                objects.entry(Path::from(path.to_string())).or_insert_with(HashMap::new);
            ifaces.insert(interface.to_string(), properties);
        }
        objects
    }

    #[test]
    fn service_object_prefers_root() {
        let root = Path::from("/com/example/service0");
        let objects = tree(vec![
            ("/com/example/service0", SERVICE_INTERFACE, service_props("180d", true)),
            ("/com/example/service0/char0", CHARACTERISTIC_INTERFACE, props(&[])),
            ("/com/example/other", SERVICE_INTERFACE, service_props("181a", true)),
        ]);

        let (path, found) = service_object(&objects, &root).unwrap();
        assert_eq!(*path, root);
        let (uuid, primary) = parse_service_properties(found).unwrap();
        assert_eq!(uuid, Uuid::from_u16(0x180d));
        assert!(primary);
    }

    #[test]
    fn service_object_missing() {
        let root = Path::from("/com/example/service0");
        let objects = tree(vec![(
            "/com/example/unrelated",
            SERVICE_INTERFACE,
            service_props("180d", true),
        )]);
        assert!(service_object(&objects, &root).is_none());
    }

    #[test]
    fn gap_and_gatt_uuids_are_rejected() {
        for uuid in ["1800", "1801", "00001800-0000-1000-8000-00805f9b34fb"] {
            let err = parse_service_properties(&service_props(uuid, true)).unwrap_err();
            assert!(err.contains("handled by the daemon"), "{err}");
        }
    }

    #[test]
    fn malformed_properties_are_rejected() {
        let missing_uuid = props(&[("Primary", Box::new(true))]);
        assert!(parse_service_properties(&missing_uuid).unwrap_err().contains("UUID"));

        let bad_uuid = service_props("zz", true);
        assert!(parse_service_properties(&bad_uuid).unwrap_err().contains("Invalid"));

        let missing_primary = props(&[("UUID", Box::new("180d".to_string()))]);
        assert!(parse_service_properties(&missing_primary).unwrap_err().contains("Primary"));
    }

    #[test]
    fn reserved_handle_count() {
        let root = Path::from("/com/example/service0");
        let objects = tree(vec![
            ("/com/example/service0", SERVICE_INTERFACE, service_props("180d", true)),
            ("/com/example/service0/char0", CHARACTERISTIC_INTERFACE, props(&[])),
            ("/com/example/service0/char1", CHARACTERISTIC_INTERFACE, props(&[])),
            ("/com/example/service0/char1/desc0", DESCRIPTOR_INTERFACE, props(&[])),
            ("/com/example/elsewhere/char7", CHARACTERISTIC_INTERFACE, props(&[])),
        ]);

        // definition + 2 characteristics x 2 + 1 descriptor
        assert_eq!(count_reserved_handles(&objects, &root), 6);
    }

    #[test]
    fn bare_service_reserves_definition_only() {
        let root = Path::from("/com/example/service0");
        let objects =
            tree(vec![("/com/example/service0", SERVICE_INTERFACE, service_props("180d", true))]);
        assert_eq!(count_reserved_handles(&objects, &root), 1);
    }
}
