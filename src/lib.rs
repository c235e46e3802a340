//! # gattdb — local GATT server database
//!
//! This library implements the server-side GATT database of a Linux
//! Bluetooth daemon. It maintains the adapter's authoritative attribute
//! table, accepts incoming ATT connections over both LE and BR/EDR
//! transports, brokers registration of externally-defined GATT services by
//! out-of-process publishers over D-Bus, and tracks per-peer Client
//! Characteristic Configuration state so that value changes can be pushed
//! as notifications and indications.
//!
//! The following functionality is provided.
//!
//! * [Attribute store](store::AttributeStore)
//!     * services, characteristics and descriptors with contiguous handle
//!       ranges
//!     * inline values or callback-backed values with tagged requests and
//!       reply sinks
//!     * observers of structural changes
//! * [Per-peer subscription state](peers::PeerStateTable)
//!     * CCC entries surviving reconnection
//!     * bulk purge per handle range when services disappear
//! * [Core services](GattDatabase): GAP (`0x1800`) with Device Name and
//!   Appearance, GATT (`0x1801`) with Service Changed and its CCC
//! * [External service registration](ExternalServiceRegistry) through
//!   `org.bluez.GattManager1` with publisher liveness tracking
//! * [Change notification](NotifyKind): Service Changed indications on
//!   structural changes and value pushes to subscribed peers
//! * [ATT transport listeners](l2cap) for LE (CID 4) and BR/EDR (PSM 31)
//!
//! The wire-level ATT state machine, the SDP record encoder and the device
//! objects live with the embedding daemon, which provides them through the
//! [Adapter] and [AttBearer] traits.
//!
//! This library depends on the [tokio] asynchronous runtime.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("gattdb only supports the Linux operating system.");

use dbus::arg::AppendAll;
use dbus_crossroads::{Context, Crossroads};
use futures::Future;
use macaddr::MacAddr6;
use num_derive::FromPrimitive;
use std::{
    fmt::{self, Debug, Display, Formatter},
    marker::PhantomData,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use strum::{Display, EnumString};

pub(crate) const ERR_PREFIX: &str = "org.bluez.Error.";
pub(crate) const TIMEOUT: Duration = Duration::from_secs(120);

mod adapter;
pub mod att;
mod core_services;
mod database;
pub mod l2cap;
mod notifier;
pub mod peers;
mod registry;
pub mod store;
mod uuid_ext;

pub use crate::{
    adapter::{Adapter, AttBearer, ConfirmFn, RecordHandle, ServiceRecord},
    database::GattDatabase,
    notifier::NotifyKind,
    registry::ExternalServiceRegistry,
};

#[doc(no_inline)]
pub use uuid::Uuid;
pub use uuid_ext::UuidExt;

/// Bluetooth error.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// Bluetooth error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bluetooth object already exists
    AlreadyExists,
    /// Bluetooth object does not exist
    DoesNotExist,
    /// Bluetooth operation failed
    Failed,
    /// Bluetooth operation in progress
    InProgress,
    /// Invalid arguments for Bluetooth operation
    InvalidArguments,
    /// the data provided is of invalid length
    InvalidLength,
    /// Bluetooth operation not available
    NotAvailable,
    /// Bluetooth operation not authorized
    NotAuthorized,
    /// Bluetooth device not ready
    NotReady,
    /// Bluetooth operation not supported
    NotSupported,
    /// Bluetooth operation not permitted
    NotPermitted,
    /// invalid offset for Bluetooth GATT property
    InvalidOffset,
    /// invalid Bluetooth address: {0}
    #[strum(disabled)]
    InvalidAddress(String),
    /// invalid Bluetooth adapter name: {0}
    #[strum(disabled)]
    InvalidName(String),
    /// the target object was either not present or removed
    #[strum(disabled)]
    NotFound,
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal Bluetooth error kind.
///
/// This is most likely caused by incompatibilities between this library
/// and the embedding daemon or the message bus.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid UUID: {0}
    InvalidUuid(String),
    /// invalid value
    InvalidValue,
    /// key {0} is missing
    MissingKey(String),
    /// join error
    JoinError,
    /// IO error {0:?}
    Io(std::io::ErrorKind),
    /// D-Bus error {0}
    DBus(String),
    /// lost connection to D-Bus
    DBusConnectionLost,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        log::trace!("DBus error {}: {}", err.name().unwrap_or_default(), err.message().unwrap_or_default());
        if err.name() == Some("org.freedesktop.DBus.Error.UnknownObject") {
            return Self::new(ErrorKind::NotFound);
        }
        let kind = match err
            .name()
            .and_then(|name| name.strip_prefix(ERR_PREFIX))
            .and_then(|s| ErrorKind::from_str(s).ok())
        {
            Some(kind) => kind,
            _ => ErrorKind::Internal(InternalErrorKind::DBus(err.name().unwrap_or_default().to_string())),
        };
        Self { kind, message: err.message().unwrap_or_default().to_string() }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

impl From<strum::ParseError> for Error {
    fn from(_: strum::ParseError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::InvalidValue), message: String::new() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())), message: err.to_string() }
    }
}

/// Bluetooth result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth device address.
///
/// Octets are kept in display order, most significant first; the string
/// form is colon-separated hexadecimal.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates an address from its octets in display order.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The unassigned address `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }

    /// Octets in Bluetooth transmission order, least significant first.
    pub(crate) fn to_le_bytes(self) -> [u8; 6] {
        let mut octets = self.0;
        octets.reverse();
        octets
    }

    /// Address from octets in Bluetooth transmission order.
    pub(crate) fn from_le_bytes(mut octets: [u8; 6]) -> Self {
        octets.reverse();
        Self(octets)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (i, octet) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{octet:02X}")?;
        }
        Ok(())
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::new(ErrorKind::InvalidAddress(s.to_string()));
        let mut octets = [0; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            *octet = parts
                .next()
                .filter(|part| part.len() == 2)
                .and_then(|part| u8::from_str_radix(part, 16).ok())
                .ok_or_else(invalid)?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl From<[u8; 6]> for Address {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Bluetooth device address type.
///
/// The discriminants match the kernel's `BDADDR_*` constants, which is
/// also how the type arrives in an L2CAP socket address.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString, FromPrimitive)]
#[repr(u8)]
pub enum AddressType {
    /// Classic Bluetooth (BR/EDR) address.
    #[strum(serialize = "br/edr")]
    BrEdr = 0,
    /// Bluetooth Low Energy (LE) public address.
    #[strum(serialize = "public")]
    LePublic = 1,
    /// Bluetooth Low Energy (LE) random address.
    #[strum(serialize = "random")]
    LeRandom = 2,
}

impl Default for AddressType {
    fn default() -> Self {
        Self::LePublic
    }
}

/// Result of a method call on an object we serve.
pub(crate) type DbusResult<T> = std::result::Result<T, dbus::MethodErr>;

/// Runs an async method handler against the Arc-held object registered at
/// the called path and replies once the handler resolves.
pub(crate) fn dbus_method<T, R, F>(
    mut ctx: Context, cr: &mut Crossroads, handler: impl FnOnce(Arc<T>) -> F,
) -> impl Future<Output = PhantomData<R>>
where
    T: Send + Sync + 'static,
    R: AppendAll,
    F: Future<Output = DbusResult<R>> + Send + 'static,
{
    let object = cr.data_mut::<Arc<T>>(ctx.path()).map(|object| object.clone());
    async move {
        let result = match object {
            Some(object) => {
                log::trace!(
                    "{}: {} called by {}",
                    ctx.path(),
                    ctx.method(),
                    ctx.message().sender().map(|s| s.to_string()).unwrap_or_default()
                );
                handler(object).await
            }
            None => Err(dbus::MethodErr::failed(&"object is no longer served")),
        };
        ctx.reply(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_display_and_parse() {
        let addr = Address::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]);
        assert_eq!(addr.to_string(), "00:1A:7D:DA:71:13");
        assert_eq!("00:1a:7d:da:71:13".parse::<Address>().unwrap(), addr);

        for bad in ["", "00:1A:7D:DA:71", "00:1A:7D:DA:71:13:37", "00:1A:7D:DA:71:GG", "0:1A:7D:DA:71:13"] {
            assert!(bad.parse::<Address>().is_err(), "{bad}");
        }
    }

    #[test]
    fn address_byte_orders() {
        let addr = Address::new([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]);
        assert_eq!(addr.to_le_bytes(), [0x13, 0x71, 0xda, 0x7d, 0x1a, 0x00]);
        assert_eq!(Address::from_le_bytes(addr.to_le_bytes()), addr);
    }

    #[test]
    fn address_type_strings() {
        assert_eq!(AddressType::LePublic.to_string(), "public");
        assert_eq!("random".parse::<AddressType>().unwrap(), AddressType::LeRandom);
    }
}
