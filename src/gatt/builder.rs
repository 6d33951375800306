use std::mem;

use bitflags::bitflags;
use smallvec::SmallVec;

use gattic_const::{Declaration, Descriptor};

use crate::att::Perms;

use super::*;

bitflags! {
    /// Characteristic builder state.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    struct Bld: u8 {
        const NEED_EXT_PROPS = 1 << 0;
        const HAVE_CCCD = 1 << 1;
        const HAVE_AGGREGATE_FMT = 1 << 2;
    }
}

/// Characteristic Presentation Format descriptor value
/// ([Vol 3] Part G, Section 3.3.3.5).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Format {
    /// Format type ([Assigned Numbers] Section 2.4.1).
    pub fmt: u8,
    pub exp: i8,
    /// Unit UUID ([Assigned Numbers] Section 3.5).
    pub unit: u16,
    /// Description namespace.
    pub ns: u8,
    pub desc: u16,
}

impl ServiceDef {
    /// Defines a primary service ([Vol 3] Part G, Section 3.1).
    #[inline]
    pub fn primary(uuid: impl Into<Uuid>, f: impl FnOnce(&mut ServiceBuilder)) -> Self {
        Self::new(Declaration::PrimaryService.uuid(), uuid.into(), f)
    }

    /// Defines a secondary service ([Vol 3] Part G, Section 3.1).
    #[inline]
    pub fn secondary(uuid: impl Into<Uuid>, f: impl FnOnce(&mut ServiceBuilder)) -> Self {
        Self::new(Declaration::SecondaryService.uuid(), uuid.into(), f)
    }

    fn new(typ: Uuid, uuid: Uuid, f: impl FnOnce(&mut ServiceBuilder)) -> Self {
        let mut b = ServiceBuilder {
            attrs: Vec::with_capacity(8),
        };
        b.push(typ, Perms::new(Access::READ), Val::Service(uuid));
        f(&mut b);
        Self {
            attrs: b.attrs,
            start: None,
            data: None,
        }
    }
}

/// Service builder used to define includes and characteristics.
#[derive(Debug)]
pub struct ServiceBuilder {
    attrs: Vec<Attr>,
}

impl ServiceBuilder {
    /// Includes a registered service ([Vol 3] Part G, Section 3.2). Includes
    /// must precede characteristics.
    pub fn include(&mut self, id: ServiceId) -> AttrIdx {
        self.push(Declaration::Include.uuid(), Access::READ.into(), Val::Include(id))
    }

    /// Includes a service by its raw handle range and optional 16-bit UUID.
    pub fn include_raw(&mut self, start: u16, end: u16, uuid: Option<u16>) -> AttrIdx {
        let mut v = Vec::with_capacity(6);
        v.extend_from_slice(&start.to_le_bytes());
        v.extend_from_slice(&end.to_le_bytes());
        if let Some(u) = uuid {
            v.extend_from_slice(&u.to_le_bytes());
        }
        let val = Val::IncludeRaw(v.into_boxed_slice());
        self.push(Declaration::Include.uuid(), Access::READ.into(), val)
    }

    /// Defines a characteristic with a callback-provided value
    /// ([Vol 3] Part G, Section 3.3). Returns the value attribute position.
    pub fn characteristic<T>(
        &mut self,
        uuid: impl Into<Uuid>,
        props: Prop,
        perms: impl Into<Perms>,
        io: impl Into<Io>,
        descs: impl FnOnce(&mut CharBuilder) -> T,
    ) -> (AttrIdx, T) {
        self.char_with(uuid.into(), props, perms.into(), Val::Io(io.into()), descs)
    }

    /// Defines a read-only characteristic with a database-stored value
    /// ([Vol 3] Part G, Section 3.3).
    pub fn ro_characteristic<T>(
        &mut self,
        uuid: impl Into<Uuid>,
        perms: impl Into<Perms>,
        val: impl AsRef<[u8]>,
        descs: impl FnOnce(&mut CharBuilder) -> T,
    ) -> (AttrIdx, T) {
        let val = Val::Static(val.as_ref().into());
        self.char_with(uuid.into(), Prop::READ, perms.into(), val, descs)
    }

    /// Defines a characteristic whose value is managed by the host.
    pub(crate) fn builtin(
        &mut self,
        uuid: impl Into<Uuid>,
        props: Prop,
        perms: impl Into<Perms>,
        b: Builtin,
        descs: impl FnOnce(&mut CharBuilder),
    ) -> AttrIdx {
        self.char_with(uuid.into(), props, perms.into(), Val::Builtin(b), descs).0
    }

    /// Adds characteristic and characteristic value declarations followed by
    /// descriptors.
    fn char_with<T>(
        &mut self,
        uuid: Uuid,
        props: Prop,
        perms: Perms,
        val: Val,
        descs: impl FnOnce(&mut CharBuilder) -> T,
    ) -> (AttrIdx, T) {
        let decl = Val::Char { props, uuid };
        self.push(Declaration::Characteristic.uuid(), Access::READ.into(), decl);
        let idx = self.push(uuid, perms, val);
        let mut flag = Bld::empty();
        flag.set(Bld::NEED_EXT_PROPS, props.contains(Prop::EXTENDED_PROPERTIES));
        let mut b = CharBuilder {
            svc: self,
            props,
            flag,
            fmt: SmallVec::new(),
        };
        let v = descs(&mut b);
        b.finalize();
        (idx, v)
    }

    /// Appends an attribute.
    fn push(&mut self, typ: Uuid, perms: Perms, val: Val) -> AttrIdx {
        assert!(self.attrs.len() < usize::from(u16::MAX), "too many attributes");
        #[allow(clippy::cast_possible_truncation)]
        let i = AttrIdx(self.attrs.len() as u16);
        self.attrs.push(Attr { typ, perms, val });
        i
    }
}

/// Characteristic descriptor builder.
#[derive(Debug)]
pub struct CharBuilder<'a> {
    svc: &'a mut ServiceBuilder,
    props: Prop,
    flag: Bld,
    fmt: SmallVec<[u16; 4]>,
}

impl CharBuilder<'_> {
    /// Declares a non-GATT profile characteristic descriptor
    /// ([Vol 3] Part G, Section 3.3.3).
    #[inline]
    pub fn descriptor(
        &mut self,
        uuid: impl Into<Uuid>,
        perms: impl Into<Perms>,
        io: impl Into<Io>,
    ) -> AttrIdx {
        self.svc.push(uuid.into(), perms.into(), Val::Io(io.into()))
    }

    /// Declares a read-only descriptor with the value stored in the database
    /// ([Vol 3] Part G, Section 3.3.3).
    #[inline]
    pub fn ro_descriptor(
        &mut self,
        uuid: impl Into<Uuid>,
        perms: impl Into<Perms>,
        val: impl AsRef<[u8]>,
    ) -> AttrIdx {
        let val = Val::Static(val.as_ref().into());
        self.svc.push(uuid.into(), perms.into(), val)
    }

    /// Declares a Characteristic Extended Properties descriptor
    /// ([Vol 3] Part G, Section 3.3.3.1).
    ///
    /// This descriptor will be added automatically if the characteristic
    /// properties contain `EXTENDED_PROPERTIES` flag.
    pub fn ext_props(&mut self, props: ExtProp) {
        assert!(
            self.flag.contains(Bld::NEED_EXT_PROPS),
            "EXTENDED_PROPERTIES not set or descriptor already exists"
        );
        self.flag.remove(Bld::NEED_EXT_PROPS);
        let uuid = Descriptor::CharacteristicExtendedProperties.uuid();
        let val = Val::Static(props.bits().to_le_bytes().into());
        self.svc.push(uuid, Access::READ.into(), val);
    }

    /// Declares a Client Characteristic Configuration descriptor
    /// ([Vol 3] Part G, Section 3.3.3.3).
    pub fn client_cfg(&mut self, perms: impl Into<Perms>, cfg: Ccc) -> AttrIdx {
        assert!(
            !self.flag.contains(Bld::HAVE_CCCD),
            "descriptor already exists"
        );
        assert!(
            !Cccd::allowed_by(self.props).is_empty(),
            "NOTIFY or INDICATE property required"
        );
        self.flag.insert(Bld::HAVE_CCCD);
        let uuid = Descriptor::ClientCharacteristicConfiguration.uuid();
        self.svc.push(uuid, perms.into(), Val::Ccc(Box::new(cfg)))
    }

    /// Declares a Characteristic User Description descriptor
    /// ([Vol 3] Part G, Section 3.3.3.2).
    #[inline]
    pub fn user_desc(&mut self, perms: impl Into<Perms>, desc: impl AsRef<str>) -> AttrIdx {
        let uuid = Descriptor::CharacteristicUserDescription.uuid();
        self.ro_descriptor(uuid, perms, desc.as_ref())
    }

    /// Declares a Characteristic Presentation Format descriptor
    /// ([Vol 3] Part G, Section 3.3.3.5).
    pub fn presentation_fmt(&mut self, f: Format) -> AttrIdx {
        let mut v = Vec::with_capacity(7);
        v.push(f.fmt);
        v.extend_from_slice(&f.exp.to_le_bytes());
        v.extend_from_slice(&f.unit.to_le_bytes());
        v.push(f.ns);
        v.extend_from_slice(&f.desc.to_le_bytes());
        let uuid = Descriptor::CharacteristicPresentationFormat.uuid();
        let i = self.ro_descriptor(uuid, Access::READ, v);
        self.fmt.push(i.0);
        i
    }

    /// Declares a Characteristic Aggregate Format descriptor
    /// ([Vol 3] Part G, Section 3.3.3.6).
    ///
    /// This descriptor will be added automatically when more than one
    /// Presentation Format descriptor is present.
    pub fn aggregate_fmt(&mut self, fmts: impl AsRef<[AttrIdx]>) {
        assert!(
            !self.flag.contains(Bld::HAVE_AGGREGATE_FMT),
            "descriptor already exists"
        );
        self.flag.insert(Bld::HAVE_AGGREGATE_FMT);
        let idx = fmts.as_ref().iter().map(|i| i.0).collect();
        let uuid = Descriptor::CharacteristicAggregateFormat.uuid();
        self.svc.push(uuid, Access::READ.into(), Val::Aggregate(idx));
    }

    /// Finalizes characteristic definition by adding required descriptors.
    fn finalize(&mut self) {
        if self.flag.contains(Bld::NEED_EXT_PROPS) {
            self.ext_props(ExtProp::empty());
        }
        if !self.flag.contains(Bld::HAVE_AGGREGATE_FMT) && self.fmt.len() > 1 {
            let fmt: SmallVec<[AttrIdx; 4]> = (mem::take(&mut self.fmt).into_iter())
                .map(AttrIdx)
                .collect();
            self.aggregate_fmt(&fmt);
        }
    }
}

/// Returns the GATT service definition ([Vol 3] Part G, Section 7). Server
/// Supported Features are only present when enhanced channels are enabled.
#[must_use]
pub fn service(eatt: bool) -> ServiceDef {
    use gattic_const::{Characteristic, Service};
    ServiceDef::primary(Service::GenericAttribute, |s| {
        s.builtin(
            Characteristic::ServiceChanged,
            Prop::INDICATE,
            Access::NONE,
            Builtin::ServiceChanged,
            |d| {
                d.client_cfg(Access::READ_WRITE, Ccc::default());
            },
        );
        s.builtin(
            Characteristic::ClientSupportedFeatures,
            Prop::READ | Prop::WRITE,
            Access::READ_WRITE,
            Builtin::ClientFeatures,
            |_| {},
        );
        s.builtin(
            Characteristic::DatabaseHash,
            Prop::READ,
            Access::READ,
            Builtin::DbHash,
            |_| {},
        );
        if eatt {
            s.builtin(
                Characteristic::ServerSupportedFeatures,
                Prop::READ,
                Access::READ,
                Builtin::ServerFeatures(ServerFeatures::EATT),
                |_| {},
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use gattic_const::{Characteristic, Service};
    use matches::assert_matches;

    use super::*;

    #[test]
    fn descriptors() {
        let def = ServiceDef::primary(Service::Battery, |s| {
            let (v, _) = s.characteristic(
                Characteristic::BatteryLevel,
                Prop::READ | Prop::NOTIFY | Prop::EXTENDED_PROPERTIES,
                Access::READ,
                SharedValue::new([100]),
                |d| {
                    d.client_cfg(Access::READ_WRITE, Ccc::default().sticky(Cccd::NOTIFY));
                    d.user_desc(Access::READ, "Battery");
                    d.presentation_fmt(Format { fmt: 0x04, unit: 0x27AD, ..Format::default() });
                    d.presentation_fmt(Format { fmt: 0x04, unit: 0x2700, ..Format::default() });
                },
            );
            assert_eq!(v, AttrIdx(2));
        });
        let typ: Vec<_> = def.attrs.iter().map(|at| at.typ.as_u16().unwrap()).collect();
        assert_eq!(
            typ,
            [0x2800, 0x2803, 0x2A19, 0x2902, 0x2901, 0x2904, 0x2904, 0x2900, 0x2905]
        );
        assert_matches!(def.attrs[8].val, Val::Aggregate(ref v) if v[..] == [5, 6]);
        assert_matches!(def.attrs[7].val, Val::Static(ref v) if v[..] == [0, 0]);
    }

    #[test]
    fn gatt_service() {
        assert_eq!(service(false).len(), 8);
        assert_eq!(service(true).len(), 10);
    }

    #[test]
    #[should_panic(expected = "NOTIFY or INDICATE property required")]
    fn ccc_without_notify() {
        let _ = ServiceDef::primary(Service::Battery, |s| {
            s.ro_characteristic(Characteristic::BatteryLevel, Access::READ, [0], |d| {
                d.client_cfg(Access::READ_WRITE, Ccc::default());
            });
        });
    }
}
