use uuid::Uuid;

/// Tail of the Bluetooth base UUID, `xxxxxxxx-0000-1000-8000-00805f9b34fb`.
///
/// A UUID is a short-form alias exactly when all fields other than the
/// leading 32 bits match the base.
const BASE_NODE: [u8; 8] = [0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb];

/// UUID extension trait to convert to and from Bluetooth short UUIDs.
pub trait UuidExt {
    /// 32-bit short form of Bluetooth UUID.
    fn as_u32(&self) -> Option<u32>;
    /// 16-bit short form of Bluetooth UUID.
    fn as_u16(&self) -> Option<u16>;
    /// Long form of 32-bit short form Bluetooth UUID.
    fn from_u32(v: u32) -> Uuid;
    /// Long form of 16-bit short form Bluetooth UUID.
    fn from_u16(v: u16) -> Uuid;
    /// Parses a Bluetooth UUID string.
    ///
    /// Both the canonical 128-bit form and the 16-bit or 32-bit
    /// hexadecimal short forms are accepted.
    fn parse_bt(s: &str) -> Option<Uuid>;
}

impl UuidExt for Uuid {
    fn as_u32(&self) -> Option<u32> {
        let (short, mid, version, node) = self.as_fields();
        (mid == 0 && version == 0x1000 && *node == BASE_NODE).then_some(short)
    }

    fn as_u16(&self) -> Option<u16> {
        self.as_u32().and_then(|short| u16::try_from(short).ok())
    }

    fn from_u32(v: u32) -> Uuid {
        Uuid::from_fields(v, 0x0000, 0x1000, &BASE_NODE)
    }

    fn from_u16(v: u16) -> Uuid {
        Self::from_u32(v.into())
    }

    fn parse_bt(s: &str) -> Option<Uuid> {
        match s.parse::<Uuid>() {
            Ok(uuid) => Some(uuid),
            Err(_) => match s.len() {
                4 => u16::from_str_radix(s, 16).ok().map(Uuid::from_u16),
                8 => u32::from_str_radix(s, 16).ok().map(Uuid::from_u32),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn short_forms() {
        let gap = Uuid::from_u16(0x1800);
        assert_eq!(gap.to_string(), "00001800-0000-1000-8000-00805f9b34fb");
        assert_eq!(gap.as_u16(), Some(0x1800));
        assert_eq!(gap.as_u32(), Some(0x1800));
        assert_eq!(Uuid::from_u32(0xdead_beef).as_u32(), Some(0xdead_beef));
        assert_eq!(Uuid::from_u32(0xdead_beef).as_u16(), None);
    }

    #[test]
    fn off_base_uuids_have_no_short_form() {
        let custom: Uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();
        assert_eq!(custom.as_u32(), None);
        assert_eq!(custom.as_u16(), None);
    }

    #[test]
    fn parse() {
        assert_eq!(Uuid::parse_bt("180d"), Some(Uuid::from_u16(0x180d)));
        assert_eq!(Uuid::parse_bt("0000180d"), Some(Uuid::from_u16(0x180d)));
        assert_eq!(Uuid::parse_bt("00001800-0000-1000-8000-00805f9b34fb"), Some(Uuid::from_u16(0x1800)));
        assert_eq!(Uuid::parse_bt("not-a-uuid"), None);
    }
}
