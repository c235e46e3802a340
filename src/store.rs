//! Attribute database.
//!
//! The store owns every attribute exposed by the local GATT server: service
//! definitions, characteristic declarations and values, and descriptors.
//! Handles are allocated in ascending order from contiguous per-service runs
//! and are never reused during the lifetime of a database.
//!
//! Reads and writes of callback-backed attributes are dispatched with a
//! tagged request and a reply sink; the owning subsystem completes the
//! request by echoing the request id into the sink. This allows values to be
//! materialized from asynchronous sources without blocking the dispatch
//! path.

use futures::channel::oneshot;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use uuid::Uuid;

use crate::{
    att::{
        AttError, CharacteristicProperties, Handle, HandleRange, Permissions, MAX_VALUE_LEN,
        UUID_CHARACTERISTIC, UUID_PRIMARY_SERVICE, UUID_SECONDARY_SERVICE,
    },
    peers::PeerId,
    Error, ErrorKind, Result, UuidExt,
};

/// Identifier of an in-flight attribute request.
///
/// The reply sink only accepts a completion that echoes this id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read request dispatched to a callback-backed attribute.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    /// Request id to echo into the reply sink.
    pub id: RequestId,
    /// Handle of the attribute being read.
    pub handle: Handle,
    /// Requesting peer, if its address could be resolved.
    pub peer: Option<PeerId>,
    /// Value offset to read from.
    pub offset: u16,
}

/// Write request dispatched to a callback-backed attribute.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Request id to echo into the reply sink.
    pub id: RequestId,
    /// Handle of the attribute being written.
    pub handle: Handle,
    /// Requesting peer, if its address could be resolved.
    pub peer: Option<PeerId>,
    /// Value offset to write at.
    pub offset: u16,
    /// Bytes to write.
    pub value: Vec<u8>,
}

/// Reply sink of a read request.
pub struct ReadReply {
    id: RequestId,
    tx: oneshot::Sender<std::result::Result<Vec<u8>, AttError>>,
}

impl ReadReply {
    /// Completes the read with the value or an ATT error.
    ///
    /// `id` must echo the id of the dispatched request; a mismatched reply
    /// is discarded and the request fails.
    pub fn reply(self, id: RequestId, result: std::result::Result<Vec<u8>, AttError>) {
        if id != self.id {
            log::error!("read reply with mismatched request id {} (expected {})", id, self.id);
            return;
        }
        let _ = self.tx.send(result);
    }
}

impl fmt::Debug for ReadReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ReadReply {{ id: {} }}", self.id)
    }
}

/// Reply sink of a write request.
pub struct WriteReply {
    id: RequestId,
    tx: oneshot::Sender<std::result::Result<(), AttError>>,
}

impl WriteReply {
    /// Completes the write.
    ///
    /// `id` must echo the id of the dispatched request; a mismatched reply
    /// is discarded and the request fails.
    pub fn reply(self, id: RequestId, result: std::result::Result<(), AttError>) {
        if id != self.id {
            log::error!("write reply with mismatched request id {} (expected {})", id, self.id);
            return;
        }
        let _ = self.tx.send(result);
    }
}

impl fmt::Debug for WriteReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "WriteReply {{ id: {} }}", self.id)
    }
}

/// Read handler of a callback-backed attribute.
pub type ReadFun = Arc<dyn Fn(ReadRequest, ReadReply) + Send + Sync>;

/// Write handler of a callback-backed attribute.
pub type WriteFun = Arc<dyn Fn(WriteRequest, WriteReply) + Send + Sync>;

/// Value backing of an attribute.
///
/// An attribute either carries an inline value blob or read/write handlers,
/// never both.
pub enum AttributeValue {
    /// Inline value of up to 512 bytes, served and updated by the store.
    Static(Vec<u8>),
    /// Value materialized on demand by the owning subsystem.
    Callback {
        /// Read handler; required iff the attribute is readable.
        read: Option<ReadFun>,
        /// Write handler; required iff the attribute is writable.
        write: Option<WriteFun>,
    },
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(&value.len()).finish(),
            Self::Callback { read, write } => f
                .debug_struct("Callback")
                .field("read", &read.is_some())
                .field("write", &write.is_some())
                .finish(),
        }
    }
}

/// Reference to a service in the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceId(Handle);

impl ServiceId {
    /// Handle of the service definition attribute.
    pub fn definition_handle(&self) -> Handle {
        self.0
    }
}

/// Registered observer of structural changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ObserverId(u64);

/// Description of a service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceInfo {
    /// Service type.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
    /// Whether the service is exposed to remote peers.
    pub active: bool,
    /// Reserved handle range.
    pub range: HandleRange,
}

/// Peer-visible description of an attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeInfo {
    /// Attribute handle.
    pub handle: Handle,
    /// Attribute type.
    pub uuid: Uuid,
    /// Permission set.
    pub permissions: Permissions,
    /// Handle range of the containing service.
    pub service_range: HandleRange,
}

/// Hook invoked with the handle range of an added or removed service.
pub type ServiceHook = Box<dyn Fn(HandleRange) + Send + Sync>;

struct Attribute {
    uuid: Uuid,
    permissions: Permissions,
    value: AttributeValue,
    /// Definition handle of the containing service.
    service: Handle,
}

struct Service {
    uuid: Uuid,
    primary: bool,
    active: bool,
    range: HandleRange,
    /// Next unoccupied handle within the reserved range.
    next: u16,
    /// Number of characteristics added so far.
    characteristics: u16,
}

#[derive(Default)]
struct Inner {
    next_handle: u16,
    services: BTreeMap<u16, Service>,
    attributes: BTreeMap<u16, Attribute>,
}

struct Observer {
    id: u64,
    on_added: ServiceHook,
    on_removed: ServiceHook,
}

/// The attribute database of a local GATT server.
pub struct AttributeStore {
    inner: Mutex<Inner>,
    observers: Mutex<Vec<Observer>>,
    next_observer: AtomicU64,
    next_request: AtomicU64,
}

impl fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("AttributeStore")
            .field("services", &inner.services.len())
            .field("attributes", &inner.attributes.len())
            .finish()
    }
}

impl Default for AttributeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeStore {
    /// Creates an empty attribute database.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { next_handle: 1, ..Default::default() }),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
        }
    }

    /// Adds an inactive service, reserving a contiguous run of handles.
    ///
    /// `reserved_handles` is the caller's capacity hint including the service
    /// definition itself; it is rounded up to hold at least the definition.
    /// The service stays invisible to peers until
    /// [set_active](Self::set_active) marks it active.
    pub fn add_service(&self, uuid: Uuid, primary: bool, reserved_handles: u16) -> Result<ServiceId> {
        let count = reserved_handles.max(1);
        let mut inner = self.inner.lock().unwrap();

        let start = inner.next_handle;
        let end = (start as u32) + (count as u32) - 1;
        if start == 0 || end > u16::MAX as u32 {
            return Err(Error::new(ErrorKind::Failed).with_message("attribute handles exhausted"));
        }
        let end = end as u16;

        let range = HandleRange { start: Handle(start), end: Handle(end) };
        let definition = if primary { UUID_PRIMARY_SERVICE } else { UUID_SECONDARY_SERVICE };
        inner.attributes.insert(
            start,
            Attribute {
                uuid: Uuid::from_u16(definition),
                permissions: Permissions::read_only(),
                value: AttributeValue::Static(uuid_le_bytes(&uuid)),
                service: Handle(start),
            },
        );
        inner.services.insert(
            start,
            Service { uuid, primary, active: false, range, next: start + 1, characteristics: 0 },
        );
        inner.next_handle = end.wrapping_add(1);

        log::debug!("added {} service {} at {}", if primary { "primary" } else { "secondary" }, uuid, range);
        Ok(ServiceId(Handle(start)))
    }

    /// Adds a characteristic to a service, occupying two handles for the
    /// declaration and value attributes.
    ///
    /// Returns the handle of the value attribute.
    pub fn add_characteristic(
        &self, service: ServiceId, uuid: Uuid, permissions: Permissions,
        properties: CharacteristicProperties, value: AttributeValue,
    ) -> Result<Handle> {
        validate_value(&permissions, &value)?;
        let mut inner = self.inner.lock().unwrap();

        let svc = inner
            .services
            .get_mut(&service.0 .0)
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("no such service"))?;
        if svc.next.checked_add(1).map_or(true, |value_handle| value_handle > svc.range.end.0) {
            return Err(Error::new(ErrorKind::Failed).with_message("no free handles left in service"));
        }
        let decl_handle = svc.next;
        let value_handle = svc.next + 1;
        svc.next += 2;
        svc.characteristics += 1;

        let mut decl = vec![properties.to_bits()];
        decl.extend_from_slice(&value_handle.to_le_bytes());
        decl.extend_from_slice(&uuid_le_bytes(&uuid));

        inner.attributes.insert(
            decl_handle,
            Attribute {
                uuid: Uuid::from_u16(UUID_CHARACTERISTIC),
                permissions: Permissions::read_only(),
                value: AttributeValue::Static(decl),
                service: service.0,
            },
        );
        inner.attributes.insert(
            value_handle,
            Attribute { uuid, permissions, value, service: service.0 },
        );

        log::debug!("added characteristic {} with value handle 0x{:04x}", uuid, value_handle);
        Ok(Handle(value_handle))
    }

    /// Adds a descriptor to the most recently added characteristic of a
    /// service.
    pub fn add_descriptor(
        &self, service: ServiceId, uuid: Uuid, permissions: Permissions, value: AttributeValue,
    ) -> Result<Handle> {
        validate_value(&permissions, &value)?;
        let mut inner = self.inner.lock().unwrap();

        let svc = inner
            .services
            .get_mut(&service.0 .0)
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("no such service"))?;
        if svc.characteristics == 0 {
            return Err(Error::new(ErrorKind::InvalidArguments)
                .with_message("descriptor requires a preceding characteristic"));
        }
        if svc.next > svc.range.end.0 {
            return Err(Error::new(ErrorKind::Failed).with_message("no free handles left in service"));
        }
        let handle = svc.next;
        svc.next += 1;

        inner
            .attributes
            .insert(handle, Attribute { uuid, permissions, value, service: service.0 });

        log::debug!("added descriptor {} at handle 0x{:04x}", uuid, handle);
        Ok(Handle(handle))
    }

    /// Sets whether the service is exposed to remote peers.
    ///
    /// Activation announces the service to the registered observers.
    pub fn set_active(&self, service: ServiceId, active: bool) -> Result<()> {
        let range = {
            let mut inner = self.inner.lock().unwrap();
            let svc = inner
                .services
                .get_mut(&service.0 .0)
                .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("no such service"))?;
            if svc.active == active {
                return Ok(());
            }
            svc.active = active;
            svc.range
        };

        if active {
            log::debug!("service {} activated", range);
            let observers = self.observers.lock().unwrap();
            for observer in observers.iter() {
                (observer.on_added)(range);
            }
        }
        Ok(())
    }

    /// Removes a service and every attribute in its range.
    ///
    /// If the service was active, the removal is announced to the registered
    /// observers after the attributes are gone. The freed handles are not
    /// reused.
    pub fn remove_service(&self, service: ServiceId) -> Result<()> {
        let (range, was_active) = {
            let mut inner = self.inner.lock().unwrap();
            let svc = inner
                .services
                .remove(&service.0 .0)
                .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("no such service"))?;
            let handles: Vec<u16> =
                inner.attributes.range(svc.range.start.0..=svc.range.end.0).map(|(h, _)| *h).collect();
            for handle in handles {
                inner.attributes.remove(&handle);
            }
            (svc.range, svc.active)
        };

        log::debug!("service {} removed", range);
        if was_active {
            let observers = self.observers.lock().unwrap();
            for observer in observers.iter() {
                (observer.on_removed)(range);
            }
        }
        Ok(())
    }

    /// Looks up an attribute by handle.
    ///
    /// Attributes of inactive services are not visible.
    pub fn find_by_handle(&self, handle: Handle) -> Option<AttributeInfo> {
        let inner = self.inner.lock().unwrap();
        let attr = inner.attributes.get(&handle.0)?;
        let svc = inner.services.get(&attr.service.0)?;
        if !svc.active {
            return None;
        }
        Some(AttributeInfo {
            handle,
            uuid: attr.uuid,
            permissions: attr.permissions,
            service_range: svc.range,
        })
    }

    /// Handle range reserved for the service.
    pub fn service_range(&self, service: ServiceId) -> Result<HandleRange> {
        self.service_info(service).map(|info| info.range)
    }

    /// Describes a service.
    pub fn service_info(&self, service: ServiceId) -> Result<ServiceInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .services
            .get(&service.0 .0)
            .map(|svc| ServiceInfo {
                uuid: svc.uuid,
                primary: svc.primary,
                active: svc.active,
                range: svc.range,
            })
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("no such service"))
    }

    /// All attributes of active services in handle order.
    pub fn attributes(&self) -> Vec<AttributeInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .attributes
            .iter()
            .filter_map(|(handle, attr)| {
                let svc = inner.services.get(&attr.service.0)?;
                if !svc.active {
                    return None;
                }
                Some(AttributeInfo {
                    handle: Handle(*handle),
                    uuid: attr.uuid,
                    permissions: attr.permissions,
                    service_range: svc.range,
                })
            })
            .collect()
    }

    /// Registers hooks observing service activation and removal.
    pub fn register_observer(&self, on_added: ServiceHook, on_removed: ServiceHook) -> ObserverId {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        let mut observers = self.observers.lock().unwrap();
        observers.push(Observer { id, on_added, on_removed });
        ObserverId(id)
    }

    /// Removes a previously registered observer.
    pub fn unregister_observer(&self, id: ObserverId) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|observer| observer.id != id.0);
    }

    /// Reads an attribute value on behalf of a peer.
    ///
    /// Inline values are served directly, honoring the offset. Callback
    /// reads are dispatched to the owning subsystem and awaited.
    pub async fn read(
        &self, handle: Handle, peer: Option<PeerId>, offset: u16,
    ) -> std::result::Result<Vec<u8>, AttError> {
        enum Dispatch {
            Ready(std::result::Result<Vec<u8>, AttError>),
            Call(ReadFun, ReadRequest, oneshot::Receiver<std::result::Result<Vec<u8>, AttError>>, ReadReply),
        }

        let dispatch = {
            let inner = self.inner.lock().unwrap();
            match lookup_active(&inner, handle) {
                Err(err) => Dispatch::Ready(Err(err)),
                Ok(attr) if !attr.permissions.read => Dispatch::Ready(Err(AttError::ReadNotPermitted)),
                Ok(attr) => match &attr.value {
                    AttributeValue::Static(value) => Dispatch::Ready(read_static(value, offset)),
                    AttributeValue::Callback { read: Some(fun), .. } => {
                        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
                        let (tx, rx) = oneshot::channel();
                        let request = ReadRequest { id, handle, peer, offset };
                        Dispatch::Call(fun.clone(), request, rx, ReadReply { id, tx })
                    }
                    AttributeValue::Callback { read: None, .. } => {
                        Dispatch::Ready(Err(AttError::ReadNotPermitted))
                    }
                },
            }
        };

        match dispatch {
            Dispatch::Ready(result) => result,
            Dispatch::Call(fun, request, rx, reply) => {
                fun(request, reply);
                rx.await.unwrap_or(Err(AttError::UnlikelyError))
            }
        }
    }

    /// Writes an attribute value on behalf of a peer.
    ///
    /// Inline values are updated in place, up to the 512-byte value limit.
    /// Callback writes are dispatched to the owning subsystem and awaited.
    pub async fn write(
        &self, handle: Handle, peer: Option<PeerId>, offset: u16, value: &[u8],
    ) -> std::result::Result<(), AttError> {
        enum Dispatch {
            Ready(std::result::Result<(), AttError>),
            Call(WriteFun, WriteRequest, oneshot::Receiver<std::result::Result<(), AttError>>, WriteReply),
        }

        let dispatch = {
            let mut inner = self.inner.lock().unwrap();
            let denied = match lookup_active(&inner, handle) {
                Err(err) => Some(err),
                Ok(attr) if !attr.permissions.write => Some(AttError::WriteNotPermitted),
                Ok(_) => None,
            };
            match denied {
                Some(err) => Dispatch::Ready(Err(err)),
                None => {
                    let attr = inner.attributes.get_mut(&handle.0).unwrap();
                    match &mut attr.value {
                        AttributeValue::Static(stored) => Dispatch::Ready(write_static(stored, offset, value)),
                        AttributeValue::Callback { write: Some(fun), .. } => {
                            let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
                            let (tx, rx) = oneshot::channel();
                            let request =
                                WriteRequest { id, handle, peer, offset, value: value.to_vec() };
                            Dispatch::Call(fun.clone(), request, rx, WriteReply { id, tx })
                        }
                        AttributeValue::Callback { write: None, .. } => {
                            Dispatch::Ready(Err(AttError::WriteNotPermitted))
                        }
                    }
                }
            }
        };

        match dispatch {
            Dispatch::Ready(result) => result,
            Dispatch::Call(fun, request, rx, reply) => {
                fun(request, reply);
                rx.await.unwrap_or(Err(AttError::UnlikelyError))
            }
        }
    }
}

fn lookup_active<'a>(inner: &'a Inner, handle: Handle) -> std::result::Result<&'a Attribute, AttError> {
    let attr = inner.attributes.get(&handle.0).ok_or(AttError::InvalidHandle)?;
    let svc = inner.services.get(&attr.service.0).ok_or(AttError::InvalidHandle)?;
    if !svc.active {
        return Err(AttError::InvalidHandle);
    }
    Ok(attr)
}

fn read_static(value: &[u8], offset: u16) -> std::result::Result<Vec<u8>, AttError> {
    let offset = offset as usize;
    if offset > value.len() {
        return Err(AttError::InvalidOffset);
    }
    Ok(value[offset..].to_vec())
}

fn write_static(stored: &mut Vec<u8>, offset: u16, value: &[u8]) -> std::result::Result<(), AttError> {
    let offset = offset as usize;
    if offset > stored.len() {
        return Err(AttError::InvalidOffset);
    }
    let end = offset + value.len();
    if end > MAX_VALUE_LEN {
        return Err(AttError::InvalidAttributeValueLen);
    }
    if end > stored.len() {
        stored.resize(end, 0);
    }
    stored[offset..end].copy_from_slice(value);
    Ok(())
}

fn validate_value(permissions: &Permissions, value: &AttributeValue) -> Result<()> {
    match value {
        AttributeValue::Static(bytes) => {
            if bytes.len() > MAX_VALUE_LEN {
                return Err(Error::new(ErrorKind::InvalidLength)
                    .with_message("attribute value exceeds 512 bytes"));
            }
        }
        AttributeValue::Callback { read, write } => {
            if permissions.read != read.is_some() {
                return Err(Error::new(ErrorKind::InvalidArguments)
                    .with_message("read permission and read callback must be given together"));
            }
            if permissions.write != write.is_some() {
                return Err(Error::new(ErrorKind::InvalidArguments)
                    .with_message("write permission and write callback must be given together"));
            }
        }
    }
    Ok(())
}

fn uuid_le_bytes(uuid: &Uuid) -> Vec<u8> {
    match uuid.as_u16() {
        Some(short) => short.to_le_bytes().to_vec(),
        None => uuid.as_u128().to_le_bytes().to_vec(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn store_with_service(reserved: u16) -> (AttributeStore, ServiceId) {
        let store = AttributeStore::new();
        let service = store.add_service(Uuid::from_u16(0x180d), true, reserved).unwrap();
        (store, service)
    }

    #[test]
    fn handles_are_unique_and_ascending() {
        let store = AttributeStore::new();
        let mut handles = Vec::new();

        for _ in 0..3 {
            let service = store.add_service(Uuid::from_u16(0x180d), true, 5).unwrap();
            handles.push(service.definition_handle().0);
            let value = store
                .add_characteristic(
                    service,
                    Uuid::from_u16(0x2a37),
                    Permissions::read_only(),
                    CharacteristicProperties::read_only(),
                    AttributeValue::Static(vec![0]),
                )
                .unwrap();
            handles.push(value.0 - 1);
            handles.push(value.0);
            let desc = store
                .add_descriptor(
                    service,
                    Uuid::from_u16(0x2901),
                    Permissions::read_only(),
                    AttributeValue::Static(vec![b'x']),
                )
                .unwrap();
            handles.push(desc.0);
        }

        let mut sorted = handles.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), handles.len());
        let mut ascending = handles.clone();
        ascending.sort_unstable();
        assert_eq!(handles, ascending);
    }

    #[test]
    fn attributes_lie_within_service_range() {
        let (store, service) = store_with_service(10);
        store.set_active(service, true).unwrap();
        let range = store.service_range(service).unwrap();
        let info = store.service_info(service).unwrap();
        assert!(info.primary && info.active);
        assert_eq!(info.uuid, Uuid::from_u16(0x180d));
        assert_eq!(info.range, range);

        let value = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_write(),
                CharacteristicProperties::read_only(),
                AttributeValue::Static(vec![1, 2]),
            )
            .unwrap();
        let desc = store
            .add_descriptor(
                service,
                Uuid::from_u16(0x2902),
                Permissions::read_write(),
                AttributeValue::Static(vec![0, 0]),
            )
            .unwrap();

        for handle in [value, desc] {
            let info = store.find_by_handle(handle).unwrap();
            assert!(range.contains(handle));
            assert_eq!(info.service_range, range);
        }
        // value attribute directly follows its declaration
        let decl = store.find_by_handle(Handle(value.0 - 1)).unwrap();
        assert_eq!(decl.uuid, Uuid::from_u16(UUID_CHARACTERISTIC));
    }

    #[test]
    fn handles_are_not_reused_after_removal() {
        let store = AttributeStore::new();
        let first = store.add_service(Uuid::from_u16(0x180d), true, 4).unwrap();
        let first_range = store.service_range(first).unwrap();
        store.remove_service(first).unwrap();

        let second = store.add_service(Uuid::from_u16(0x181a), true, 4).unwrap();
        assert!(second.definition_handle() > first_range.end);
    }

    #[test]
    fn service_capacity_is_enforced() {
        let (store, service) = store_with_service(3);

        store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_only(),
                CharacteristicProperties::read_only(),
                AttributeValue::Static(vec![0]),
            )
            .unwrap();
        let err = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a38),
                Permissions::read_only(),
                CharacteristicProperties::read_only(),
                AttributeValue::Static(vec![0]),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Failed);
    }

    #[test]
    fn descriptor_requires_characteristic() {
        let (store, service) = store_with_service(5);
        let err = store
            .add_descriptor(
                service,
                Uuid::from_u16(0x2902),
                Permissions::read_write(),
                AttributeValue::Static(vec![0, 0]),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
    }

    #[test]
    fn permission_conflicts_are_registration_errors() {
        let (store, service) = store_with_service(10);

        // readable without a read callback
        let err = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_only(),
                CharacteristicProperties::read_only(),
                AttributeValue::Callback { read: None, write: None },
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);

        // write callback on a read-only attribute
        let write: WriteFun = Arc::new(|req, reply| reply.reply(req.id, Ok(())));
        let err = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_only(),
                CharacteristicProperties::read_only(),
                AttributeValue::Callback { read: None, write: Some(write) },
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
    }

    #[tokio::test]
    async fn static_read_honors_offset() {
        let (store, service) = store_with_service(5);
        let value = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_only(),
                CharacteristicProperties::read_only(),
                AttributeValue::Static(vec![1, 2, 3]),
            )
            .unwrap();
        store.set_active(service, true).unwrap();

        assert_eq!(store.read(value, None, 0).await, Ok(vec![1, 2, 3]));
        assert_eq!(store.read(value, None, 2).await, Ok(vec![3]));
        assert_eq!(store.read(value, None, 3).await, Ok(vec![]));
        assert_eq!(store.read(value, None, 4).await, Err(AttError::InvalidOffset));
    }

    #[tokio::test]
    async fn inactive_service_is_invisible() {
        let (store, service) = store_with_service(5);
        let value = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_only(),
                CharacteristicProperties::read_only(),
                AttributeValue::Static(vec![1]),
            )
            .unwrap();

        assert_eq!(store.find_by_handle(value), None);
        assert_eq!(store.read(value, None, 0).await, Err(AttError::InvalidHandle));

        store.set_active(service, true).unwrap();
        assert!(store.find_by_handle(value).is_some());
    }

    #[tokio::test]
    async fn callback_read_round_trip() {
        let (store, service) = store_with_service(5);
        let read: ReadFun = Arc::new(|req, reply| {
            let value = b"hello"[req.offset as usize..].to_vec();
            reply.reply(req.id, Ok(value));
        });
        let value = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_only(),
                CharacteristicProperties::read_only(),
                AttributeValue::Callback { read: Some(read), write: None },
            )
            .unwrap();
        store.set_active(service, true).unwrap();

        assert_eq!(store.read(value, None, 0).await, Ok(b"hello".to_vec()));
        assert_eq!(store.read(value, None, 3).await, Ok(b"lo".to_vec()));
    }

    #[tokio::test]
    async fn mismatched_reply_id_fails_request() {
        let (store, service) = store_with_service(5);
        let read: ReadFun = Arc::new(|_req, reply| {
            reply.reply(RequestId(u64::MAX), Ok(vec![1]));
        });
        let value = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_only(),
                CharacteristicProperties::read_only(),
                AttributeValue::Callback { read: Some(read), write: None },
            )
            .unwrap();
        store.set_active(service, true).unwrap();

        assert_eq!(store.read(value, None, 0).await, Err(AttError::UnlikelyError));
    }

    #[tokio::test]
    async fn static_write_and_limits() {
        let (store, service) = store_with_service(5);
        let value = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_write(),
                CharacteristicProperties::read_only(),
                AttributeValue::Static(vec![0, 0]),
            )
            .unwrap();
        store.set_active(service, true).unwrap();

        store.write(value, None, 0, &[7, 8]).await.unwrap();
        assert_eq!(store.read(value, None, 0).await, Ok(vec![7, 8]));

        assert_eq!(store.write(value, None, 5, &[1]).await, Err(AttError::InvalidOffset));
        let oversize = vec![0u8; MAX_VALUE_LEN + 1];
        assert_eq!(
            store.write(value, None, 0, &oversize).await,
            Err(AttError::InvalidAttributeValueLen)
        );
    }

    #[tokio::test]
    async fn write_not_permitted() {
        let (store, service) = store_with_service(5);
        let value = store
            .add_characteristic(
                service,
                Uuid::from_u16(0x2a37),
                Permissions::read_only(),
                CharacteristicProperties::read_only(),
                AttributeValue::Static(vec![0]),
            )
            .unwrap();
        store.set_active(service, true).unwrap();

        assert_eq!(store.write(value, None, 0, &[1]).await, Err(AttError::WriteNotPermitted));
    }

    #[test]
    fn observers_fire_on_activation_and_removal() {
        let store = Arc::new(AttributeStore::new());
        let added = Arc::new(Mutex::new(Vec::new()));
        let removed = Arc::new(Mutex::new(Vec::new()));
        let (added2, removed2) = (added.clone(), removed.clone());
        let id = store.register_observer(
            Box::new(move |range| added2.lock().unwrap().push(range)),
            Box::new(move |range| removed2.lock().unwrap().push(range)),
        );

        let service = store.add_service(Uuid::from_u16(0x180d), true, 4).unwrap();
        let range = store.service_range(service).unwrap();
        assert!(added.lock().unwrap().is_empty());

        store.set_active(service, true).unwrap();
        assert_eq!(added.lock().unwrap().as_slice(), &[range]);

        store.remove_service(service).unwrap();
        assert_eq!(removed.lock().unwrap().as_slice(), &[range]);
        assert_eq!(store.find_by_handle(range.start), None);

        store.unregister_observer(id);
        let other = store.add_service(Uuid::from_u16(0x181a), true, 2).unwrap();
        store.set_active(other, true).unwrap();
        assert_eq!(added.lock().unwrap().len(), 1);
    }

    #[test]
    fn removing_inactive_service_is_silent() {
        let store = AttributeStore::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        store.register_observer(
            Box::new(|_| {}),
            Box::new(move |_| fired2.store(true, Ordering::Relaxed)),
        );

        let service = store.add_service(Uuid::from_u16(0x180d), true, 4).unwrap();
        store.remove_service(service).unwrap();
        assert!(!fired.load(Ordering::Relaxed));
    }
}
