use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use gattic_const::{Declaration, Descriptor, UuidType, UuidVec};

use crate::att::{Error, Perms, Result};

use super::*;

/// Opaque owner data attached to a service.
pub type Data = Arc<dyn Any + Send + Sync>;

/// Registered service identifier. Identifiers are never reused.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ServiceId(u32);

/// Attribute position within a service definition. Resolved to a handle with
/// [`Db::handle`] once the service is registered.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct AttrIdx(pub(crate) u16);

/// Attribute value source.
pub(crate) enum Val {
    /// Primary or secondary service declaration.
    Service(Uuid),
    /// Include declaration of a registered service.
    Include(ServiceId),
    /// Include declaration with a fixed value.
    IncludeRaw(Box<[u8]>),
    /// Characteristic declaration. The value attribute follows immediately.
    Char { props: Prop, uuid: Uuid },
    /// Value stored in the database.
    Static(Box<[u8]>),
    /// Value provided by an application callback.
    Io(Io),
    /// Characteristic Aggregate Format descriptor referencing Presentation
    /// Format descriptors by position.
    Aggregate(SmallVec<[u16; 4]>),
    /// Client Characteristic Configuration descriptor.
    Ccc(Box<Ccc>),
    /// GATT service value managed by the host.
    Builtin(Builtin),
}

/// Host-managed GATT service values ([Vol 3] Part G, Section 7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Builtin {
    ServiceChanged,
    ClientFeatures,
    DbHash,
    ServerFeatures(ServerFeatures),
}

impl Debug for Val {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Service(u) => f.debug_tuple("Service").field(&u).finish(),
            Self::Include(id) => f.debug_tuple("Include").field(&id).finish(),
            Self::IncludeRaw(ref v) => f.debug_tuple("IncludeRaw").field(v).finish(),
            Self::Char { props, uuid } => (f.debug_struct("Char"))
                .field("props", &props)
                .field("uuid", &uuid)
                .finish(),
            Self::Static(ref v) => f.debug_tuple("Static").field(v).finish(),
            Self::Io(ref io) => f.debug_tuple("Io").field(io).finish(),
            Self::Aggregate(ref v) => f.debug_tuple("Aggregate").field(v).finish(),
            Self::Ccc(ref c) => f.debug_tuple("Ccc").field(c).finish(),
            Self::Builtin(b) => f.debug_tuple("Builtin").field(&b).finish(),
        }
    }
}

/// Attribute definition ([Vol 3] Part F, Section 3.2).
#[derive(Debug)]
pub struct Attr {
    pub(crate) typ: Uuid,
    pub(crate) perms: Perms,
    pub(crate) val: Val,
}

impl Attr {
    /// Returns the attribute type.
    #[inline(always)]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.typ
    }

    /// Returns the attribute permissions.
    #[inline(always)]
    pub const fn perms(&self) -> Perms {
        self.perms
    }

    /// Returns whether this is a service declaration.
    #[inline]
    #[must_use]
    pub fn is_service(&self) -> bool {
        matches!(self.val, Val::Service(_))
    }

    /// Returns whether this is a characteristic declaration.
    #[inline]
    #[must_use]
    pub fn is_char(&self) -> bool {
        matches!(self.val, Val::Char { .. })
    }

    /// Returns the Client Characteristic Configuration state.
    #[inline]
    pub(crate) fn ccc(&self) -> Option<&Ccc> {
        match self.val {
            Val::Ccc(ref c) => Some(c),
            _ => None,
        }
    }

    /// Returns the Client Characteristic Configuration state.
    #[inline]
    pub(crate) fn ccc_mut(&mut self) -> Option<&mut Ccc> {
        match self.val {
            Val::Ccc(ref mut c) => Some(c),
            _ => None,
        }
    }

    /// Returns the contribution of this attribute to the database hash
    /// ([Vol 3] Part G, Section 7.3.1): `Some(true)` for attributes hashed
    /// with their value, `Some(false)` for handle and type only.
    fn hash_kind(&self) -> Option<bool> {
        use Descriptor::*;
        match self.typ.typ() {
            UuidType::Declaration(_)
            | UuidType::Descriptor(CharacteristicExtendedProperties) => Some(true),
            UuidType::Descriptor(
                CharacteristicUserDescription
                | ClientCharacteristicConfiguration
                | ServerCharacteristicConfiguration
                | CharacteristicPresentationFormat
                | CharacteristicAggregateFormat,
            ) => Some(false),
            _ => None,
        }
    }
}

/// Service definition. Created with [`ServiceDef::primary`] or
/// [`ServiceDef::secondary`] and returned by [`Db::unregister`] so that it
/// can be registered again.
#[derive(Debug)]
pub struct ServiceDef {
    pub(crate) attrs: Vec<Attr>,
    pub(crate) start: Option<Handle>,
    pub(crate) data: Option<Data>,
}

impl ServiceDef {
    /// Assigns an explicit starting handle.
    #[inline]
    #[must_use]
    pub fn with_handle(mut self, start: Handle) -> Self {
        self.start = Some(start);
        self
    }

    /// Attaches owner data that can be used as a lookup filter.
    #[inline]
    #[must_use]
    pub fn with_data(mut self, data: Data) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns the number of attributes in the service.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Returns whether the service has no attributes.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

/// Registered service.
#[derive(Debug)]
pub(crate) struct Service {
    pub id: ServiceId,
    pub start: Handle,
    pub end: Handle,
    pub def: ServiceDef,
}

impl Service {
    /// Returns the handle range of the service.
    #[inline(always)]
    pub fn range(&self) -> HandleRange {
        HandleRange::new(self.start, self.end)
    }

    /// Returns the handle of attribute `i`. Registration guarantees that the
    /// result does not overflow.
    #[inline]
    pub fn handle(&self, i: usize) -> Handle {
        #[allow(clippy::cast_possible_truncation)]
        let h = self.start.get().saturating_add(i as u16);
        Handle::new(h).unwrap_or(Handle::MAX)
    }

    /// Returns the index of handle `h`.
    #[inline]
    fn index(&self, h: Handle) -> Option<usize> {
        (self.start <= h && h <= self.end).then(|| usize::from(h.get() - self.start.get()))
    }

    /// Returns all attributes with their handles.
    #[inline]
    pub fn attrs(&self) -> impl Iterator<Item = (Handle, &Attr)> {
        (self.def.attrs.iter().enumerate()).map(|(i, at)| (self.handle(i), at))
    }
}

/// Attribute database ([Vol 3] Part G, Section 3). Services are kept in
/// ascending handle order. Handles of registered services are never reused.
#[derive(Debug, Default)]
pub struct Db {
    svcs: Vec<Service>,
    next_id: u32,
}

impl Db {
    /// Registers a service. The service receives handles following the last
    /// registered service unless it has an explicit starting handle.
    pub(crate) fn register(&mut self, def: ServiceDef) -> Result<(ServiceId, HandleRange)> {
        if def.attrs.is_empty() {
            return Err(Error::InvalidParam);
        }
        for at in &def.attrs {
            if let Val::Include(id) = at.val {
                if !self.service_is_registered(id) {
                    return Err(Error::NotFound);
                }
            }
        }
        let start = match def.start {
            Some(h) => h,
            None => match self.svcs.last() {
                None => Handle::MIN,
                Some(s) => s.end.next().ok_or(Error::NoResources)?,
            },
        };
        let end = usize::from(start.get()) + def.attrs.len() - 1;
        let end = (u16::try_from(end).ok().and_then(Handle::new)).ok_or(Error::NoResources)?;
        if (self.svcs.iter()).any(|s| s.start <= end && start <= s.end) {
            return Err(Error::AlreadyExists);
        }
        let id = ServiceId(self.next_id);
        self.next_id += 1;
        let i = self.svcs.partition_point(|s| s.start < start);
        self.svcs.insert(i, Service { id, start, end, def });
        let r = HandleRange::new(start, end);
        debug!("Registered {id:?} at {start}..={end}");
        Ok((id, r))
    }

    /// Unregisters a service, returning its definition and former handle
    /// range. Automatically assigned handles are released so the definition
    /// can be registered again.
    pub(crate) fn unregister(&mut self, id: ServiceId) -> Result<(ServiceDef, HandleRange)> {
        let i = (self.svcs.iter().position(|s| s.id == id)).ok_or(Error::NotFound)?;
        let s = self.svcs.remove(i);
        let r = s.range();
        debug!("Unregistered {id:?} from {}..={}", r.start(), r.end());
        Ok((s.def, r))
    }

    /// Returns whether the service is registered.
    #[inline]
    #[must_use]
    pub fn service_is_registered(&self, id: ServiceId) -> bool {
        self.svcs.iter().any(|s| s.id == id)
    }

    /// Returns the handle range of a registered service.
    #[inline]
    #[must_use]
    pub fn service_range(&self, id: ServiceId) -> Option<HandleRange> {
        (self.svcs.iter().find(|s| s.id == id)).map(Service::range)
    }

    /// Returns the handle of attribute `idx` of a registered service.
    #[inline]
    #[must_use]
    pub fn handle(&self, id: ServiceId, idx: AttrIdx) -> Option<Handle> {
        let s = self.svcs.iter().find(|s| s.id == id)?;
        let i = usize::from(idx.0);
        (i < s.def.attrs.len()).then(|| s.handle(i))
    }

    /// Returns the service containing handle `h`.
    #[inline]
    pub(crate) fn service_of(&self, h: Handle) -> Option<&Service> {
        let i = self.svcs.partition_point(|s| s.start <= h).checked_sub(1)?;
        (self.svcs.get(i)).filter(|s| h <= s.end)
    }

    /// Returns the attribute at handle `h`.
    #[must_use]
    pub fn attr(&self, h: Handle) -> Option<&Attr> {
        let s = self.service_of(h)?;
        s.def.attrs.get(s.index(h)?)
    }

    /// Returns the attribute at handle `h`.
    pub(crate) fn attr_mut(&mut self, h: Handle) -> Option<&mut Attr> {
        let i = self.svcs.partition_point(|s| s.start <= h).checked_sub(1)?;
        let s = self.svcs.get_mut(i)?;
        let j = s.index(h)?;
        s.def.attrs.get_mut(j)
    }

    /// Returns all attributes in the specified range in ascending handle
    /// order.
    pub fn iter(&self, r: HandleRange) -> impl Iterator<Item = (Handle, &Attr)> {
        (self.svcs.iter())
            .skip_while(move |s| s.end < r.start())
            .take_while(move |s| s.start <= r.end())
            .flat_map(Service::attrs)
            .filter(move |&(h, _)| r.contains(h))
    }

    /// Finds attributes within a range that match optional type and owner
    /// data filters. All filters must match. Callers limit the number of
    /// matches with [`Iterator::take`].
    pub fn find<'a>(
        &'a self,
        r: HandleRange,
        uuid: Option<Uuid>,
        data: Option<&'a Data>,
    ) -> impl Iterator<Item = (Handle, &'a Attr)> + 'a {
        (self.svcs.iter())
            .skip_while(move |s| s.end < r.start())
            .take_while(move |s| s.start <= r.end())
            .filter(move |s| match (data, s.def.data.as_ref()) {
                (None, _) => true,
                (Some(want), Some(have)) => Arc::ptr_eq(want, have),
                (Some(_), None) => false,
            })
            .flat_map(Service::attrs)
            .filter(move |&(h, at)| r.contains(h) && uuid.map_or(true, |u| at.typ == u))
    }

    /// Returns the first attribute after `h`.
    #[inline]
    #[must_use]
    pub fn attr_next(&self, h: Handle) -> Option<Handle> {
        let r = HandleRange::ALL.after(h)?;
        self.iter(r).next().map(|(h, _)| h)
    }

    /// Returns the characteristic value handle for a characteristic
    /// declaration or value handle.
    #[must_use]
    pub fn attr_value_handle(&self, h: Handle) -> Option<Handle> {
        match self.attr(h)?.val {
            Val::Char { .. } => h.next(),
            _ => self.char_of(h).and_then(|(d, _, _)| d.next()).filter(|&v| v == h),
        }
    }

    /// Returns the characteristic declaration handle, properties, and value
    /// type of the characteristic that owns attribute `h` (its value or one
    /// of its descriptors).
    pub(crate) fn char_of(&self, h: Handle) -> Option<(Handle, Prop, Uuid)> {
        let s = self.service_of(h)?;
        let i = s.index(h)?;
        (s.def.attrs[..=i].iter().enumerate().rev())
            .take_while(|(_, at)| !at.is_service())
            .find_map(|(j, at)| match at.val {
                Val::Char { props, uuid } if j < i => Some((s.handle(j), props, uuid)),
                _ => None,
            })
    }

    /// Returns the descriptors of the characteristic whose value handle is
    /// `val`.
    pub(crate) fn descriptors(&self, val: Handle) -> impl Iterator<Item = (Handle, &Attr)> {
        let r = HandleRange::ALL.after(val);
        let s = self.service_of(val);
        (r.into_iter())
            .flat_map(move |r| self.iter(r))
            .take_while(move |&(h, at)| {
                !at.is_char() && !at.is_service() && s.is_some_and(|s| h <= s.end)
            })
    }

    /// Returns the Client Characteristic Configuration descriptor handle of
    /// the characteristic value `val`.
    #[inline]
    pub(crate) fn ccc_of(&self, val: Handle) -> Option<Handle> {
        (self.descriptors(val)).find_map(|(h, at)| at.ccc().map(|_| h))
    }

    /// Returns the extended properties of the characteristic value `val`.
    pub(crate) fn ext_props(&self, val: Handle) -> ExtProp {
        let cep = Descriptor::CharacteristicExtendedProperties.uuid();
        (self.descriptors(val))
            .find_map(|(_, at)| match at.val {
                Val::Static(ref v) if at.typ == cep && v.len() == 2 => {
                    Some(ExtProp::from_bits_truncate(u16::from_le_bytes([v[0], v[1]])))
                }
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Returns the last handle of the group that starts at `h`
    /// ([Vol 3] Part F, Section 3.2.3).
    #[inline]
    pub(crate) fn group_end(&self, h: Handle) -> Handle {
        self.service_of(h).map_or(h, |s| if s.start == h { s.end } else { h })
    }

    /// Returns all CCC descriptors.
    pub(crate) fn cccs(&self) -> impl Iterator<Item = (Handle, &Ccc)> {
        (self.svcs.iter().flat_map(Service::attrs)).filter_map(|(h, at)| at.ccc().map(|c| (h, c)))
    }

    /// Returns all CCC descriptors in the specified range.
    pub(crate) fn cccs_mut(&mut self, r: HandleRange) -> impl Iterator<Item = (Handle, &mut Ccc)> {
        self.svcs.iter_mut().flat_map(move |s| {
            let (start, attrs) = (s.start, &mut s.def.attrs);
            (attrs.iter_mut().enumerate()).filter_map(move |(i, at)| {
                #[allow(clippy::cast_possible_truncation)]
                let h = Handle::new(start.get().saturating_add(i as u16))?;
                (r.contains(h)).then_some(())?;
                at.ccc_mut().map(|c| (h, c))
            })
        })
    }

    /// Returns the value of a declaration or a database-stored value. Returns
    /// `None` for values that are provided by callbacks or the host.
    pub(crate) fn stored_value(&self, h: Handle) -> Option<Vec<u8>> {
        let s = self.service_of(h)?;
        let at = s.def.attrs.get(s.index(h)?)?;
        Some(match at.val {
            Val::Service(u) => UuidVec::new(u).to_vec(),
            Val::Include(id) => {
                let inc = self.svcs.iter().find(|s| s.id == id)?;
                let mut v = Vec::with_capacity(6);
                v.extend_from_slice(&inc.start.get().to_le_bytes());
                v.extend_from_slice(&inc.end.get().to_le_bytes());
                if let Some(Val::Service(u)) = inc.def.attrs.first().map(|at| &at.val) {
                    if let Some(u) = u.as_uuid16() {
                        v.extend_from_slice(&u.to_bytes());
                    }
                }
                v
            }
            Val::IncludeRaw(ref v) | Val::Static(ref v) => v.to_vec(),
            Val::Char { props, uuid } => {
                let mut v = Vec::with_capacity(19);
                v.push(props.bits());
                v.extend_from_slice(&h.next()?.get().to_le_bytes());
                v.extend_from_slice(&UuidVec::new(uuid));
                v
            }
            Val::Aggregate(ref idx) => {
                (idx.iter()).flat_map(|&i| s.handle(usize::from(i)).get().to_le_bytes()).collect()
            }
            Val::Io(_) | Val::Ccc(_) | Val::Builtin(_) => return None,
        })
    }

    /// Calculates the database hash ([Vol 3] Part G, Section 7.3).
    #[must_use]
    pub fn hash(&self) -> u128 {
        let mut m = gattic_crypto::AesCmac::db_hash();
        for (h, at) in self.svcs.iter().flat_map(Service::attrs) {
            let Some(with_val) = at.hash_kind() else { continue };
            let val = if with_val { self.stored_value(h) } else { None };
            m.attr(h.get(), &UuidVec::new(at.typ), val.as_deref());
        }
        m.finalize()
    }

    /// Returns the handle of a host-managed GATT service value.
    pub(crate) fn builtin(&self, b: Builtin) -> Option<Handle> {
        (self.svcs.iter().flat_map(Service::attrs))
            .find_map(|(h, at)| matches!(at.val, Val::Builtin(v) if v == b).then_some(h))
    }

    /// Returns whether `u` is a service grouping type.
    #[inline]
    pub(crate) fn is_group_type(u: Uuid) -> bool {
        u == Declaration::PrimaryService || u == Declaration::SecondaryService
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use gattic_const::{Characteristic, Service as Svc};

    use super::*;
    use crate::att::Access;

    fn h(v: u16) -> Handle {
        Handle::new(v).unwrap()
    }

    /// Example database ([Vol 3] Part G, Appendix B).
    pub(crate) fn appendix_b() -> Vec<ServiceDef> {
        let io = || Io::from(|_: IoReq| Err(ErrorCode::UnlikelyError));
        vec![
            ServiceDef::primary(Svc::GenericAccess, |s| {
                s.characteristic(
                    Characteristic::DeviceName,
                    Prop::READ | Prop::WRITE,
                    Access::READ_WRITE,
                    io(),
                    |_| {},
                );
                s.characteristic(Characteristic::Appearance, Prop::READ, Access::READ, io(), |_| {});
            }),
            service(false),
            ServiceDef::primary(Svc::Glucose, |s| {
                s.include_raw(0x0014, 0x0016, Some(0x180F));
                s.characteristic(
                    Characteristic::GlucoseMeasurement,
                    Prop::READ | Prop::INDICATE | Prop::EXTENDED_PROPERTIES,
                    Access::READ,
                    io(),
                    |d| d.client_cfg(Access::READ_WRITE, Ccc::default()),
                );
            }),
            ServiceDef::secondary(Svc::Battery, |s| {
                s.characteristic(Characteristic::BatteryLevel, Prop::READ, Access::READ, io(), |_| {});
            }),
        ]
    }

    fn db() -> Db {
        let mut db = Db::default();
        for s in appendix_b() {
            db.register(s).unwrap();
        }
        db
    }

    /// Example database hash ([Vol 3] Part G, Appendix B).
    #[test]
    fn hash() {
        let mut db = db();
        assert_eq!(db.hash(), 0xF1_CA_2D_48_EC_F5_8B_AC_8A_88_30_BB_B9_FB_A9_90);
        assert_eq!(db.hash(), db.hash());

        let extra = ServiceDef::primary(Svc::Battery, |s| {
            s.ro_characteristic(Characteristic::BatteryLevel, Access::READ, [100], |_| {});
        });
        let (id, r) = db.register(extra).unwrap();
        assert_eq!(r, HandleRange::new(h(0x17), h(0x19)));
        assert_ne!(db.hash(), 0xF1_CA_2D_48_EC_F5_8B_AC_8A_88_30_BB_B9_FB_A9_90);
        let (def, _) = db.unregister(id).unwrap();
        assert_eq!(db.hash(), 0xF1_CA_2D_48_EC_F5_8B_AC_8A_88_30_BB_B9_FB_A9_90);

        // Handles after the last service are available again
        assert_eq!(db.register(def).unwrap().1.start(), h(0x17));
    }

    #[test]
    fn register() {
        let mut db = db();
        let svc = || {
            ServiceDef::primary(Svc::TxPower, |s| {
                s.ro_characteristic(Characteristic::TxPowerLevel, Access::READ, [0], |_| {});
            })
        };
        assert_eq!(
            db.register(svc().with_handle(h(0x0015))).unwrap_err(),
            Error::AlreadyExists
        );
        let (_, r) = db.register(svc().with_handle(h(0x0100))).unwrap();
        assert_eq!(r, HandleRange::new(h(0x0100), h(0x0102)));
        let (_, r) = db.register(svc()).unwrap();
        assert_eq!(r.start(), h(0x0103));
        assert_eq!(
            db.register(svc().with_handle(h(0xFFFE))).unwrap_err(),
            Error::NoResources
        );
        let (_, r) = db.register(svc().with_handle(h(0x0020))).unwrap();
        assert_eq!(r.start(), h(0x0020));
        let order: Vec<_> = db.svcs.iter().map(|s| s.start.get()).collect();
        assert_eq!(order, [0x01, 0x06, 0x0E, 0x14, 0x20, 0x100, 0x103]);
    }

    #[test]
    fn lookup() {
        let db = db();
        let ccc = Descriptor::ClientCharacteristicConfiguration.uuid();
        let found: Vec<_> = (db.find(HandleRange::ALL, Some(ccc), None)).map(|(h, _)| h.get()).collect();
        assert_eq!(found, [0x09, 0x12]);
        assert_eq!(db.find(HandleRange::ALL, Some(ccc), None).take(1).count(), 1);
        assert_eq!(db.attr_value_handle(h(0x10)), Some(h(0x11)));
        assert_eq!(db.attr_value_handle(h(0x11)), Some(h(0x11)));
        assert_eq!(db.attr_value_handle(h(0x12)), None);
        assert_eq!(db.ccc_of(h(0x11)), Some(h(0x12)));
        assert_eq!(db.ccc_of(h(0x03)), None);
        assert_eq!(db.char_of(h(0x13)).map(|c| c.0), Some(h(0x10)));
        assert_eq!(db.group_end(h(0x0E)), h(0x13));
        assert_eq!(db.group_end(h(0x0F)), h(0x0F));
        assert_eq!(db.attr_next(h(0x05)), Some(h(0x06)));
        assert_eq!(db.attr_next(h(0x16)), None);
        assert_eq!(
            db.stored_value(h(0x10)).unwrap(),
            [0xA2, 0x11, 0x00, 0x18, 0x2A]
        );
        assert!(db.attr(h(0x17)).is_none());

        let data: Data = Arc::new(1_u8);
        let mut db = Db::default();
        let mut defs = appendix_b();
        let last = defs.pop().unwrap().with_data(Arc::clone(&data));
        for s in defs {
            db.register(s).unwrap();
        }
        db.register(last).unwrap();
        let owned: Vec<_> = (db.find(HandleRange::ALL, None, Some(&data))).map(|(h, _)| h.get()).collect();
        assert_eq!(owned, [0x14, 0x15, 0x16]);
    }
}
