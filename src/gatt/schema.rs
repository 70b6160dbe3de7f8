use std::sync::Arc;

use super::*;

/// Service definition ([Vol 3] Part G, Section 3.1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Service {
    hdl: Handle,
    end: Handle,
    uuid: Uuid,
    primary: bool,
    chars: Vec<Characteristic>,
}

impl Service {
    /// Returns the service declaration handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the last handle in the service group.
    #[inline(always)]
    #[must_use]
    pub const fn end_handle(&self) -> Handle {
        self.end
    }

    /// Returns the service UUID.
    #[inline(always)]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns whether this is a primary service.
    #[inline(always)]
    #[must_use]
    pub const fn is_primary(&self) -> bool {
        self.primary
    }

    /// Returns service characteristics in handle order.
    #[inline(always)]
    #[must_use]
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.chars
    }

    /// Returns whether `hdl` belongs to the service group.
    #[inline]
    #[must_use]
    pub fn contains(&self, hdl: Handle) -> bool {
        self.hdl <= hdl && hdl <= self.end
    }
}

/// Characteristic definition ([Vol 3] Part G, Section 3.3).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Characteristic {
    hdl: Handle,
    uuid: Uuid,
    props: Prop,
    descs: Vec<Descriptor>,
}

impl Characteristic {
    /// Returns the characteristic value handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the characteristic UUID.
    #[inline(always)]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the characteristic properties.
    #[inline(always)]
    #[must_use]
    pub const fn properties(&self) -> Prop {
        self.props
    }

    /// Returns characteristic descriptors in handle order.
    #[inline(always)]
    #[must_use]
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descs
    }

    /// Returns the Client Characteristic Configuration descriptor handle, if
    /// one is defined.
    #[inline]
    #[must_use]
    pub fn cccd(&self) -> Option<Handle> {
        (self.descs.iter())
            .find(|d| d.uuid == Uuid::CLIENT_CHARACTERISTIC_CONFIGURATION)
            .map(|d| d.hdl)
    }
}

/// Characteristic descriptor definition ([Vol 3] Part G, Section 3.3.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Descriptor {
    hdl: Handle,
    uuid: Uuid,
}

impl Descriptor {
    /// Returns the descriptor handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the descriptor UUID.
    #[inline(always)]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// Attribute addressed by a value handle.
#[derive(Clone, Copy, Debug)]
pub enum Attr<'a> {
    Characteristic(&'a Characteristic),
    Descriptor(&'a Characteristic, &'a Descriptor),
}

/// Immutable attribute list of a GATT server. This is the snapshot that a
/// client receives from service discovery.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Schema {
    services: Vec<Service>,
}

impl Schema {
    /// Returns a new schema builder.
    #[inline]
    #[must_use]
    pub fn build() -> Builder {
        Builder::default()
    }

    /// Returns all services in handle order.
    #[inline(always)]
    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Returns whether the schema has no services.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Returns an iterator over all characteristics.
    #[inline]
    pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.services.iter().flat_map(|s| s.chars.iter())
    }

    /// Returns the characteristic or descriptor with value handle `hdl`.
    #[must_use]
    pub fn attr(&self, hdl: Handle) -> Option<Attr> {
        let s = self.services.iter().find(|s| s.contains(hdl))?;
        // Characteristic value handles are strictly increasing, and each
        // characteristic owns every handle up to the next declaration.
        let i = s.chars.partition_point(|c| c.hdl <= hdl).checked_sub(1)?;
        let c = &s.chars[i];
        if c.hdl == hdl {
            return Some(Attr::Characteristic(c));
        }
        (c.descs.iter().find(|d| d.hdl == hdl)).map(|d| Attr::Descriptor(c, d))
    }

    /// Returns the characteristic with value handle `hdl`.
    #[inline]
    #[must_use]
    pub fn characteristic(&self, hdl: Handle) -> Option<&Characteristic> {
        match self.attr(hdl)? {
            Attr::Characteristic(c) => Some(c),
            Attr::Descriptor(..) => None,
        }
    }

    /// Returns the descriptor with handle `hdl` and its characteristic.
    #[inline]
    #[must_use]
    pub fn descriptor(&self, hdl: Handle) -> Option<(&Characteristic, &Descriptor)> {
        match self.attr(hdl)? {
            Attr::Descriptor(c, d) => Some((c, d)),
            Attr::Characteristic(_) => None,
        }
    }

    /// Returns the first characteristic with UUID `char` within the first
    /// service with UUID `service`.
    #[must_use]
    pub fn find(&self, service: Uuid, char: Uuid) -> Option<&Characteristic> {
        (self.services.iter().find(|s| s.uuid == service))
            .and_then(|s| s.chars.iter().find(|c| c.uuid == char))
    }
}

/// Schema builder used to define services, characteristics, and descriptors.
/// Handles are assigned sequentially in definition order, and initial values
/// are collected into a [`ValueStore`].
#[derive(Debug)]
pub struct Builder {
    next: Option<Handle>,
    services: Vec<Service>,
    vals: ValueStore,
}

impl Default for Builder {
    #[inline]
    fn default() -> Self {
        Self {
            next: Some(Handle::MIN),
            services: Vec::with_capacity(4),
            vals: ValueStore::default(),
        }
    }
}

impl Builder {
    /// Defines a primary service.
    #[inline]
    pub fn primary_service<T>(
        &mut self,
        uuid: Uuid,
        f: impl FnOnce(&mut ServiceBuilder) -> T,
    ) -> (Handle, T) {
        self.service(uuid, true, f)
    }

    /// Defines a secondary service.
    #[inline]
    pub fn secondary_service<T>(
        &mut self,
        uuid: Uuid,
        f: impl FnOnce(&mut ServiceBuilder) -> T,
    ) -> (Handle, T) {
        self.service(uuid, false, f)
    }

    /// Returns the final read-only schema and initial attribute values.
    #[inline]
    #[must_use]
    pub fn freeze(self) -> (Arc<Schema>, ValueStore) {
        let schema = Schema {
            services: self.services,
        };
        (Arc::new(schema), self.vals)
    }

    fn service<T>(
        &mut self,
        uuid: Uuid,
        primary: bool,
        f: impl FnOnce(&mut ServiceBuilder) -> T,
    ) -> (Handle, T) {
        let hdl = self.alloc();
        self.services.push(Service {
            hdl,
            end: hdl,
            uuid,
            primary,
            chars: Vec::new(),
        });
        let v = f(&mut ServiceBuilder(self));
        (hdl, v)
    }

    /// Allocates the next attribute handle and extends the current service
    /// group to include it.
    fn next_handle(&mut self) -> Handle {
        let hdl = self.alloc();
        self.current_service().end = hdl;
        hdl
    }

    /// Allocates the next attribute handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle space is exhausted.
    #[inline]
    fn alloc(&mut self) -> Handle {
        let hdl = self.next.expect("attribute handle overflow");
        self.next = hdl.next();
        hdl
    }

    #[inline]
    fn current_service(&mut self) -> &mut Service {
        self.services.last_mut().expect("no service defined")
    }
}

/// Service builder used to define characteristics.
#[derive(Debug)]
pub struct ServiceBuilder<'a>(&'a mut Builder);

impl ServiceBuilder<'_> {
    /// Defines a characteristic with an initial value, calling `f` to define
    /// its descriptors. A Client Characteristic Configuration descriptor is
    /// added automatically for characteristics that support notifications or
    /// indications, unless `f` defines one. Returns the value handle.
    pub fn characteristic<T>(
        &mut self,
        uuid: Uuid,
        props: Prop,
        val: impl Into<Vec<u8>>,
        f: impl FnOnce(&mut CharacteristicBuilder) -> T,
    ) -> (Handle, T) {
        let _decl = self.0.next_handle();
        let hdl = self.0.next_handle();
        self.0.vals.insert(hdl, val);
        self.0.current_service().chars.push(Characteristic {
            hdl,
            uuid,
            props,
            descs: Vec::new(),
        });
        let v = f(&mut CharacteristicBuilder(self.0));
        if props.can_subscribe() && self.current_char().cccd().is_none() {
            CharacteristicBuilder(self.0).descriptor(
                Uuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
                Cccd::empty().to_bytes(),
            );
        }
        (hdl, v)
    }

    fn current_char(&mut self) -> &Characteristic {
        let s = self.0.current_service();
        s.chars.last().expect("no characteristic defined")
    }
}

/// Characteristic builder used to define descriptors.
#[derive(Debug)]
pub struct CharacteristicBuilder<'a>(&'a mut Builder);

impl CharacteristicBuilder<'_> {
    /// Defines a descriptor with an initial value and returns its handle.
    pub fn descriptor(&mut self, uuid: Uuid, val: impl Into<Vec<u8>>) -> Handle {
        let hdl = self.0.next_handle();
        self.0.vals.insert(hdl, val);
        let s = self.0.current_service();
        let c = s.chars.last_mut().expect("no characteristic defined");
        c.descs.push(Descriptor { hdl, uuid });
        hdl
    }
}
