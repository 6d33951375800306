use bitflags::bitflags;

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Prop: u8 {
        /// Permits broadcasts of the Characteristic Value using Server
        /// Characteristic Configuration Descriptor.
        const BROADCAST = 0x01;
        /// Permits reads of the Characteristic Value.
        const READ = 0x02;
        /// Permits writes of the Characteristic Value without response.
        const WRITE_WITHOUT_RESPONSE = 0x04;
        /// Permits writes of the Characteristic Value with response.
        const WRITE = 0x08;
        /// Permits notifications of a Characteristic Value without
        /// acknowledgment. If set, the Client Characteristic Configuration
        /// Descriptor shall exist.
        const NOTIFY = 0x10;
        /// Permits indications of a Characteristic Value with acknowledgment.
        /// If set, the Client Characteristic Configuration Descriptor shall
        /// exist.
        const INDICATE = 0x20;
        /// Permits signed writes to the Characteristic Value.
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        /// Additional characteristic properties are defined in the
        /// Characteristic Extended Properties Descriptor.
        const EXTENDED_PROPERTIES = 0x80;
    }
}

bitflags! {
    /// Characteristic extended properties
    /// ([Vol 3] Part G, Section 3.3.3.1).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct ExtProp: u16 {
        /// Permits reliable writes of the Characteristic Value.
        const RELIABLE_WRITE = 1 << 0;
        /// Permits writes to the characteristic descriptor.
        const WRITABLE_AUXILIARIES = 1 << 1;
    }
}

bitflags! {
    /// Client Characteristic Configuration descriptor value
    /// ([Vol 3] Part G, Section 3.3.3.3).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    #[repr(transparent)]
    pub struct Cccd: u16 {
        /// The Characteristic Value shall be notified. This value can only be
        /// set if the characteristic's properties have the `NOTIFY` bit set.
        const NOTIFY = 1 << 0;
        /// The Characteristic Value shall be indicated. This value can only be
        /// set if the characteristic's properties have the `INDICATE` bit set.
        const INDICATE = 1 << 1;
    }
}

impl Cccd {
    /// Returns the configuration bits allowed by characteristic properties.
    #[inline]
    #[must_use]
    pub const fn allowed_by(p: Prop) -> Self {
        let mut v = 0;
        if p.contains(Prop::NOTIFY) {
            v |= Self::NOTIFY.bits();
        }
        if p.contains(Prop::INDICATE) {
            v |= Self::INDICATE.bits();
        }
        Self::from_bits_retain(v)
    }
}

bitflags! {
    /// Client Supported Features characteristic value
    /// ([Vol 3] Part G, Section 7.2).
    #[derive(
        Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize,
    )]
    #[repr(transparent)]
    #[serde(transparent)]
    pub struct ClientFeatures: u8 {
        /// The client supports Robust Caching.
        const ROBUST_CACHING = 1 << 0;
        /// The client supports Enhanced ATT bearer.
        const EATT = 1 << 1;
        /// The client supports receiving `ATT_MULTIPLE_HANDLE_VALUE_NTF` PDUs.
        const MULTI_NTF = 1 << 2;
    }
}

bitflags! {
    /// Server Supported Features characteristic value
    /// ([Vol 3] Part G, Section 7.4).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct ServerFeatures: u8 {
        /// The server supports Enhanced ATT bearer.
        const EATT = 1 << 0;
    }
}

/// Iteration control returned by discovery and notification callbacks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Iter {
    #[default]
    Continue,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cccd_allowed() {
        assert_eq!(Cccd::allowed_by(Prop::READ), Cccd::empty());
        assert_eq!(Cccd::allowed_by(Prop::NOTIFY | Prop::READ), Cccd::NOTIFY);
        assert_eq!(
            Cccd::allowed_by(Prop::NOTIFY | Prop::INDICATE),
            Cccd::NOTIFY | Cccd::INDICATE
        );
    }
}
