//! Type-keyed storage for every pooled object in the mix graph.
//!
//! [`ObjectPool`] owns one [`Pool`] per concrete node type. The [`Pooled`]
//! trait routes generic access to the right pool, and [`SourceRef`] /
//! [`EffectRef`] are the typed sums that the graph and the command protocol
//! traffic in. The whole structure lives behind the engine's mix mutex.

use crate::bus::Bus;
use crate::constants::{DEFAULT_EFFECT_CAPACITY, DEFAULT_SOURCE_CAPACITY};
use crate::effects::{DelayEffect, Effect, PanEffect, ParamValue, VolumeEffect};
use crate::pcm::PcmSource;
use crate::pool::{Handle, Pool};
use crate::source::SourceBase;
use crate::stream::StreamSource;

/// User-supplied effect stored behind a box; the built-in chain stays
/// monomorphic.
pub type UserEffect = Box<dyn Effect>;

/// One pool per concrete type. Pools never shrink during a session.
pub struct ObjectPool {
    pub(crate) pcm: Pool<PcmSource>,
    pub(crate) streams: Pool<StreamSource>,
    pub(crate) buses: Pool<Bus>,
    pub(crate) pans: Pool<PanEffect>,
    pub(crate) volumes: Pool<VolumeEffect>,
    pub(crate) delays: Pool<DelayEffect>,
    pub(crate) users: Pool<UserEffect>,
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectPool {
    pub fn new() -> Self {
        Self {
            pcm: Pool::with_capacity(DEFAULT_SOURCE_CAPACITY),
            streams: Pool::with_capacity(DEFAULT_SOURCE_CAPACITY),
            buses: Pool::with_capacity(DEFAULT_SOURCE_CAPACITY),
            pans: Pool::with_capacity(DEFAULT_EFFECT_CAPACITY),
            volumes: Pool::with_capacity(DEFAULT_EFFECT_CAPACITY),
            delays: Pool::with_capacity(DEFAULT_EFFECT_CAPACITY),
            users: Pool::with_capacity(DEFAULT_EFFECT_CAPACITY),
        }
    }

    pub fn insert<T: Pooled>(&mut self, value: T) -> Handle<T> {
        T::pool_mut(self).insert(value)
    }

    pub fn remove<T: Pooled>(&mut self, handle: Handle<T>) -> Option<T> {
        T::pool_mut(self).remove(handle)
    }

    #[inline]
    pub fn get<T: Pooled>(&self, handle: Handle<T>) -> Option<&T> {
        T::pool(self).get(handle)
    }

    #[inline]
    pub fn get_mut<T: Pooled>(&mut self, handle: Handle<T>) -> Option<&mut T> {
        T::pool_mut(self).get_mut(handle)
    }

    #[inline]
    pub fn is_valid<T: Pooled>(&self, handle: Handle<T>) -> bool {
        T::pool(self).is_valid(handle)
    }
}

/// Routes a concrete type to its pool inside [`ObjectPool`].
pub trait Pooled: Sized {
    fn pool(objects: &ObjectPool) -> &Pool<Self>;
    fn pool_mut(objects: &mut ObjectPool) -> &mut Pool<Self>;
}

macro_rules! impl_pooled {
    ($ty:ty, $field:ident) => {
        impl Pooled for $ty {
            fn pool(objects: &ObjectPool) -> &Pool<Self> {
                &objects.$field
            }
            fn pool_mut(objects: &mut ObjectPool) -> &mut Pool<Self> {
                &mut objects.$field
            }
        }
    };
}

impl_pooled!(PcmSource, pcm);
impl_pooled!(StreamSource, streams);
impl_pooled!(Bus, buses);
impl_pooled!(PanEffect, pans);
impl_pooled!(VolumeEffect, volumes);
impl_pooled!(DelayEffect, delays);
impl_pooled!(UserEffect, users);

/// Typed reference to any source node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceRef {
    Pcm(Handle<PcmSource>),
    Stream(Handle<StreamSource>),
    Bus(Handle<Bus>),
}

impl From<Handle<PcmSource>> for SourceRef {
    fn from(handle: Handle<PcmSource>) -> Self {
        Self::Pcm(handle)
    }
}

impl From<Handle<StreamSource>> for SourceRef {
    fn from(handle: Handle<StreamSource>) -> Self {
        Self::Stream(handle)
    }
}

impl From<Handle<Bus>> for SourceRef {
    fn from(handle: Handle<Bus>) -> Self {
        Self::Bus(handle)
    }
}

impl SourceRef {
    pub fn is_valid(&self, objects: &ObjectPool) -> bool {
        match *self {
            Self::Pcm(h) => objects.is_valid(h),
            Self::Stream(h) => objects.is_valid(h),
            Self::Bus(h) => objects.is_valid(h),
        }
    }

    pub fn as_bus(&self) -> Option<Handle<Bus>> {
        match *self {
            Self::Bus(h) => Some(h),
            _ => None,
        }
    }

    pub(crate) fn base<'p>(&self, objects: &'p ObjectPool) -> Option<&'p SourceBase> {
        match *self {
            Self::Pcm(h) => objects.get(h).map(|s| &s.base),
            Self::Stream(h) => objects.get(h).map(|s| &s.base),
            Self::Bus(h) => objects.get(h).map(|s| &s.base),
        }
    }

    pub(crate) fn base_mut<'p>(&self, objects: &'p mut ObjectPool) -> Option<&'p mut SourceBase> {
        match *self {
            Self::Pcm(h) => objects.get_mut(h).map(|s| &mut s.base),
            Self::Stream(h) => objects.get_mut(h).map(|s| &mut s.base),
            Self::Bus(h) => objects.get_mut(h).map(|s| &mut s.base),
        }
    }
}

/// Typed reference to any effect in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectRef {
    Pan(Handle<PanEffect>),
    Volume(Handle<VolumeEffect>),
    Delay(Handle<DelayEffect>),
    User(Handle<UserEffect>),
}

impl From<Handle<PanEffect>> for EffectRef {
    fn from(handle: Handle<PanEffect>) -> Self {
        Self::Pan(handle)
    }
}

impl From<Handle<VolumeEffect>> for EffectRef {
    fn from(handle: Handle<VolumeEffect>) -> Self {
        Self::Volume(handle)
    }
}

impl From<Handle<DelayEffect>> for EffectRef {
    fn from(handle: Handle<DelayEffect>) -> Self {
        Self::Delay(handle)
    }
}

impl From<Handle<UserEffect>> for EffectRef {
    fn from(handle: Handle<UserEffect>) -> Self {
        Self::User(handle)
    }
}

impl EffectRef {
    pub fn is_valid(&self, objects: &ObjectPool) -> bool {
        match *self {
            Self::Pan(h) => objects.is_valid(h),
            Self::Volume(h) => objects.is_valid(h),
            Self::Delay(h) => objects.is_valid(h),
            Self::User(h) => objects.is_valid(h),
        }
    }

    /// Run the effect. `None` when the handle went stale; `Some(false)` means
    /// the effect bypassed and the output buffer was not written.
    pub(crate) fn process(
        &self,
        objects: &mut ObjectPool,
        input: &[f32],
        output: &mut [f32],
    ) -> Option<bool> {
        match *self {
            Self::Pan(h) => objects.get_mut(h).map(|e| e.process(input, output)),
            Self::Volume(h) => objects.get_mut(h).map(|e| e.process(input, output)),
            Self::Delay(h) => objects.get_mut(h).map(|e| e.process(input, output)),
            Self::User(h) => objects.get_mut(h).map(|e| e.process(input, output)),
        }
    }

    /// Route a mailbox parameter to the effect's `receive_*` methods.
    pub(crate) fn deliver(&self, objects: &mut ObjectPool, index: usize, value: &ParamValue) {
        match *self {
            Self::Pan(h) => {
                if let Some(e) = objects.get_mut(h) {
                    crate::effects::deliver(e, index, value);
                }
            }
            Self::Volume(h) => {
                if let Some(e) = objects.get_mut(h) {
                    crate::effects::deliver(e, index, value);
                }
            }
            Self::Delay(h) => {
                if let Some(e) = objects.get_mut(h) {
                    crate::effects::deliver(e, index, value);
                }
            }
            Self::User(h) => {
                if let Some(e) = objects.get_mut(h) {
                    crate::effects::deliver(e.as_mut(), index, value);
                }
            }
        }
    }

    /// Return the effect's slot to its pool.
    pub(crate) fn remove(&self, objects: &mut ObjectPool) {
        match *self {
            Self::Pan(h) => {
                objects.remove(h);
            }
            Self::Volume(h) => {
                objects.remove(h);
            }
            Self::Delay(h) => {
                objects.remove(h);
            }
            Self::User(h) => {
                objects.remove(h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_types_to_distinct_pools() {
        let mut objects = ObjectPool::new();
        let pan = objects.insert(PanEffect::new());
        let volume = objects.insert(VolumeEffect::default());

        // Index collision across pools must not confuse validity.
        assert_eq!(pan.index(), volume.index());
        assert!(objects.is_valid(pan));
        assert!(objects.is_valid(volume));

        objects.remove(pan);
        assert!(!objects.is_valid(pan));
        assert!(objects.is_valid(volume));
    }

    #[test]
    fn effect_ref_survives_and_dies_with_its_handle() {
        let mut objects = ObjectPool::new();
        let delay = objects.insert(DelayEffect::new(512, 0.5, 0.3));
        let eref = EffectRef::from(delay);

        assert!(eref.is_valid(&objects));
        eref.remove(&mut objects);
        assert!(!eref.is_valid(&objects));

        let input = [0.0; 8];
        let mut output = [0.0; 8];
        assert_eq!(eref.process(&mut objects, &input, &mut output), None);
    }
}
