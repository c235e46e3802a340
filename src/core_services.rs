//! The mandatory GAP and GATT services.

use std::sync::Arc;

use crate::{
    adapter::{Adapter, RecordHandle, ServiceRecord},
    att::{
        AttError, CharacteristicProperties, Handle, Permissions, ATT_PSM, UUID_APPEARANCE,
        UUID_CLIENT_CHARACTERISTIC_CONFIGURATION, UUID_DEVICE_NAME, UUID_GAP, UUID_GATT,
        UUID_SERVICE_CHANGED,
    },
    peers::PeerStateTable,
    store::{AttributeStore, AttributeValue, ReadFun, ServiceId, WriteFun},
    Result, UuidExt,
};
use uuid::Uuid;

/// Handles of the installed core services.
#[derive(Debug)]
pub(crate) struct CoreServices {
    pub gap: ServiceId,
    pub gatt: ServiceId,
    /// Value handle of the Service Changed characteristic.
    pub svc_chngd: Handle,
    /// Handle of the Service Changed CCC descriptor.
    pub svc_chngd_ccc: Handle,
    pub gap_record: Option<RecordHandle>,
    pub gatt_record: Option<RecordHandle>,
}

/// Installs the GAP (0x1800) and GATT (0x1801) services and publishes their
/// SDP records.
///
/// Both services are active when this returns and stay present for the
/// lifetime of the database.
pub(crate) fn register_core_services(
    store: &AttributeStore, peers: &Arc<PeerStateTable>, adapter: &Arc<dyn Adapter>,
) -> Result<CoreServices> {
    let (gap, gap_record) = populate_gap_service(store, adapter)?;
    let (gatt, svc_chngd, svc_chngd_ccc, gatt_record) = populate_gatt_service(store, peers, adapter)?;
    Ok(CoreServices { gap, gatt, svc_chngd, svc_chngd_ccc, gap_record, gatt_record })
}

fn populate_gap_service(
    store: &AttributeStore, adapter: &Arc<dyn Adapter>,
) -> Result<(ServiceId, Option<RecordHandle>)> {
    let service = store.add_service(Uuid::from_u16(UUID_GAP), true, 5)?;
    let record = add_record(store, adapter, UUID_GAP, service, "Generic Access Profile");

    // Device Name characteristic.
    let name_adapter = adapter.clone();
    let read_name: ReadFun = Arc::new(move |req, reply| {
        log::debug!("GAP Device Name read request");
        let name = name_adapter.alias();
        let bytes = name.as_bytes();
        let result = if req.offset as usize > bytes.len() {
            Err(AttError::InvalidOffset)
        } else {
            Ok(bytes[req.offset as usize..].to_vec())
        };
        reply.reply(req.id, result);
    });
    store.add_characteristic(
        service,
        Uuid::from_u16(UUID_DEVICE_NAME),
        Permissions::read_only(),
        CharacteristicProperties::read_only(),
        AttributeValue::Callback { read: Some(read_name), write: None },
    )?;

    // Device Appearance characteristic.
    let appearance_adapter = adapter.clone();
    let read_appearance: ReadFun = Arc::new(move |req, reply| {
        log::debug!("GAP Appearance read request");
        let dev_class = appearance_adapter.device_class();
        let appearance = [(dev_class & 0x00ff) as u8, ((dev_class >> 8) & 0x001f) as u8];
        let result = if req.offset > 2 {
            Err(AttError::InvalidOffset)
        } else {
            Ok(appearance[req.offset as usize..].to_vec())
        };
        reply.reply(req.id, result);
    });
    store.add_characteristic(
        service,
        Uuid::from_u16(UUID_APPEARANCE),
        Permissions::read_only(),
        CharacteristicProperties::read_only(),
        AttributeValue::Callback { read: Some(read_appearance), write: None },
    )?;

    store.set_active(service, true)?;
    Ok((service, record))
}

fn populate_gatt_service(
    store: &AttributeStore, peers: &Arc<PeerStateTable>, adapter: &Arc<dyn Adapter>,
) -> Result<(ServiceId, Handle, Handle, Option<RecordHandle>)> {
    let service = store.add_service(Uuid::from_u16(UUID_GATT), true, 4)?;
    let record = add_record(store, adapter, UUID_GATT, service, "Generic Attribute Profile");

    // Service Changed characteristic carries no readable value.
    let svc_chngd = store.add_characteristic(
        service,
        Uuid::from_u16(UUID_SERVICE_CHANGED),
        Permissions::default(),
        CharacteristicProperties::indicate_only(),
        AttributeValue::Callback { read: None, write: None },
    )?;

    let svc_chngd_ccc = add_ccc(store, peers, service)?;

    store.set_active(service, true)?;
    Ok((service, svc_chngd, svc_chngd_ccc, record))
}

/// Adds a Client Characteristic Configuration descriptor to the most
/// recently added characteristic of the service.
///
/// The descriptor value is kept per remote peer in the peer state table:
/// reads and writes are resolved against the requesting peer's own entry,
/// which is created on first access.
pub(crate) fn add_ccc(
    store: &AttributeStore, peers: &Arc<PeerStateTable>, service: ServiceId,
) -> Result<Handle> {
    let read_peers = peers.clone();
    let read: ReadFun = Arc::new(move |req, reply| {
        log::debug!("CCC read for handle {}", req.handle);
        let result = (|| {
            if req.offset > 2 {
                return Err(AttError::InvalidOffset);
            }
            let peer = req.peer.ok_or(AttError::UnlikelyError)?;
            let entry = read_peers.ccc_get_or_create(peer, req.handle);
            Ok(entry.value[req.offset as usize..].to_vec())
        })();
        reply.reply(req.id, result);
    });

    let write_peers = peers.clone();
    let write: WriteFun = Arc::new(move |req, reply| {
        log::debug!("CCC write for handle {}", req.handle);
        let result = (|| {
            if req.value.len() != 2 {
                return Err(AttError::InvalidAttributeValueLen);
            }
            if req.offset > 2 {
                return Err(AttError::InvalidOffset);
            }
            let peer = req.peer.ok_or(AttError::UnlikelyError)?;
            write_peers.ccc_write(peer, req.handle, [req.value[0], req.value[1]]);
            Ok(())
        })();
        reply.reply(req.id, result);
    });

    store.add_descriptor(
        service,
        Uuid::from_u16(UUID_CLIENT_CHARACTERISTIC_CONFIGURATION),
        Permissions::read_write(),
        AttributeValue::Callback { read: Some(read), write: Some(write) },
    )
}

/// Publishes the SDP record of a core service.
///
/// Failure to publish is logged but does not prevent the service from being
/// served over LE.
fn add_record(
    store: &AttributeStore, adapter: &Arc<dyn Adapter>, uuid: u16, service: ServiceId, name: &str,
) -> Option<RecordHandle> {
    let range = store.service_range(service).ok()?;
    let url = (uuid == UUID_GAP).then(|| "http://www.bluez.org/".to_string());
    let record =
        ServiceRecord { service_class: uuid, name: Some(name.to_string()), url, range, psm: ATT_PSM };
    match adapter.add_service_record(record) {
        Ok(handle) => Some(handle),
        Err(err) => {
            log::error!("failed to publish SDP record for 0x{uuid:04x}: {err}");
            None
        }
    }
}
