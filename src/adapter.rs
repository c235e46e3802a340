//! Collaborator interfaces of the owning adapter.
//!
//! The database does not speak the ATT wire protocol and does not encode
//! SDP records itself. Both concerns live with the embedding daemon, which
//! implements [Adapter] and hands out per-device [AttBearer] objects.

use std::{fmt, sync::Arc};

use crate::{att::{Handle, HandleRange}, l2cap::Stream, peers::PeerId, Address, AddressType, Result};

/// Handle of a published SDP record.
pub type RecordHandle = u32;

/// Callback invoked when the peer confirms an indication.
///
/// The callback receives no payload; retransmissions and confirmation
/// timeouts are handled by the connection's ATT server.
pub type ConfirmFn = Arc<dyn Fn() + Send + Sync>;

/// Description of an SDP record announcing an ATT service range over
/// classic Bluetooth.
///
/// The record encoder lives outside the database; this only names the
/// pieces of the ATT protocol descriptor list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceRecord {
    /// 16-bit service class UUID.
    pub service_class: u16,
    /// Display name of the service.
    pub name: Option<String>,
    /// Documentation URL, if any.
    pub url: Option<String>,
    /// Attribute handle range served over ATT.
    pub range: HandleRange,
    /// L2CAP PSM of the ATT server.
    pub psm: u16,
}

/// Per-connection ATT server of a remote device.
///
/// Implemented by the daemon's connection layer, which runs the wire-level
/// ATT state machine and dispatches peer requests into the attribute store.
pub trait AttBearer: Send + Sync {
    /// Sends an unacknowledged handle value notification.
    fn send_notification(&self, handle: Handle, value: &[u8]) -> Result<()>;

    /// Sends a handle value indication.
    ///
    /// `confirm` is invoked once the peer's confirmation arrives.
    fn send_indication(&self, handle: Handle, value: &[u8], confirm: ConfirmFn) -> Result<()>;
}

impl fmt::Debug for dyn AttBearer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AttBearer")
    }
}

/// The Bluetooth adapter owning this database.
///
/// Implemented by the embedding daemon.
pub trait Adapter: Send + Sync {
    /// Adapter name, for example `hci0`.
    fn name(&self) -> String;

    /// Friendly device name announced through the GAP Device Name
    /// characteristic.
    fn alias(&self) -> String;

    /// Adapter address.
    fn address(&self) -> Address;

    /// Class of device.
    fn device_class(&self) -> u32;

    /// Publishes an SDP record and returns its handle.
    fn add_service_record(&self, record: ServiceRecord) -> Result<RecordHandle>;

    /// Removes a previously published SDP record.
    fn remove_service_record(&self, handle: RecordHandle);

    /// Attaches an accepted ATT channel to the device object of the remote
    /// peer, creating it if necessary.
    fn attach_att(&self, io: Stream, src: Address, dst: Address, dst_type: AddressType);

    /// Returns the ATT server of the peer's current connection, or [None]
    /// if the peer is not connected.
    fn att_bearer(&self, peer: PeerId) -> Option<Arc<dyn AttBearer>>;
}

impl fmt::Debug for dyn Adapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Adapter {{ name: {} }}", self.name())
    }
}
