//! Name based KMS property resolution
//!
//! The kernel hands out property ids per boot and per driver. Only the property names are a
//! stable contract, so each object class gets a static table of the properties we care about,
//! keyed by a [`PropertyKind`] enum. [`PropertyTable::populate`] fills in the ids the running
//! driver assigned, and [`PropertyTable::value`] turns a live property list back into values.
//! Enum properties never leak raw kernel values: they are reported as the index of the
//! matching symbolic name in the static table.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Index;

use log::{debug, trace};

use crate::backend::{ObjectKind, ObjectProperties, PropertyDef};
use crate::{KmsError, Result};

/// A statically known property of one KMS object class.
pub trait PropertyKind: Copy + Eq + fmt::Debug + 'static {
    /// The object class the property belongs to
    const OBJECT: ObjectKind;
    /// Every property of the class, in table order
    const ALL: &'static [Self];

    /// The kernel name of the property
    fn name(self) -> &'static str;
    /// Looks up a property by its kernel name
    fn from_name(name: &str) -> Option<Self>;
    /// Symbolic values of enum properties, `None` for every other property
    fn enum_values(self) -> Option<&'static [&'static str]>;
    /// Position in [`PropertyKind::ALL`]
    fn index(self) -> usize;
}

macro_rules! property_kind {
    (@values) => { None };
    (@values [$($value:literal),+]) => { Some(&[$($value),+]) };
    (
        $(#[$meta:meta])*
        $vis:vis enum $ty:ident for $object:ident {
            $($variant:ident = $name:literal $([$($value:literal),+ $(,)?])?,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $ty {
            $($variant,)+
        }

        impl PropertyKind for $ty {
            const OBJECT: ObjectKind = ObjectKind::$object;
            const ALL: &'static [Self] = &[$(Self::$variant,)+];

            fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)+
                    _ => None,
                }
            }

            fn enum_values(self) -> Option<&'static [&'static str]> {
                match self {
                    $(Self::$variant => property_kind!(@values $([$($value),+])?),)+
                }
            }

            fn index(self) -> usize {
                self as usize
            }
        }
    };
}

property_kind! {
    /// Plane properties
    pub enum PlaneProperty for Plane {
        Type = "type" ["Overlay", "Primary", "Cursor"],
        FbId = "FB_ID",
        CrtcId = "CRTC_ID",
        SrcX = "SRC_X",
        SrcY = "SRC_Y",
        SrcW = "SRC_W",
        SrcH = "SRC_H",
        CrtcX = "CRTC_X",
        CrtcY = "CRTC_Y",
        CrtcW = "CRTC_W",
        CrtcH = "CRTC_H",
        InFormats = "IN_FORMATS",
        InFenceFd = "IN_FENCE_FD",
        Zpos = "zpos",
        Alpha = "alpha",
    }
}

property_kind! {
    /// CRTC properties
    pub enum CrtcProperty for Crtc {
        Active = "ACTIVE",
        ModeId = "MODE_ID",
        OutFencePtr = "OUT_FENCE_PTR",
        VrrEnabled = "VRR_ENABLED",
        GammaLut = "GAMMA_LUT",
        GammaLutSize = "GAMMA_LUT_SIZE",
    }
}

property_kind! {
    /// Connector properties
    pub enum ConnectorProperty for Connector {
        CrtcId = "CRTC_ID",
        Edid = "EDID",
        Dpms = "DPMS" ["On", "Standby", "Suspend", "Off"],
        LinkStatus = "link-status" ["Good", "Bad"],
        NonDesktop = "non-desktop",
        VrrCapable = "vrr_capable",
        MaxBpc = "max bpc",
        ContentProtection = "Content Protection" ["Undesired", "Desired", "Enabled"],
    }
}

/// Symbolic values of the plane `type` enum
pub mod plane_type {
    pub const OVERLAY: u64 = 0;
    pub const PRIMARY: u64 = 1;
    pub const CURSOR: u64 = 2;
}

/// One symbolic value of an enum property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumEntry {
    pub name: &'static str,
    /// Whether the kernel exposes this value
    pub valid: bool,
    /// Raw kernel value, meaningless unless `valid`
    pub value: u64,
}

/// Resolution state of one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropInfo {
    pub name: &'static str,
    /// Kernel assigned id, 0 when the driver does not expose the property
    pub prop_id: u32,
    /// Whether the property is expected to be an enum
    pub is_enum: bool,
    pub enums: Vec<EnumEntry>,
}

impl PropInfo {
    /// Reads this property from `live`.
    ///
    /// Returns `default` if the property was never resolved or `live` does not carry it. Enum
    /// properties yield the index of the matching symbolic value, or `default` when the raw
    /// value matches none of them.
    pub fn value(&self, live: &ObjectProperties, default: u64) -> u64 {
        if self.prop_id == 0 {
            return default;
        }
        let Some(raw) = live.value_of(self.prop_id) else {
            return default;
        };
        if !self.is_enum {
            return raw;
        }

        self.enums
            .iter()
            .position(|e| e.valid && e.value == raw)
            .map_or(default, |index| index as u64)
    }

    /// Raw kernel value of the symbolic enum value at `index`, if the driver exposes it.
    pub fn enum_raw(&self, index: usize) -> Option<u64> {
        self.enums
            .get(index)
            .filter(|e| e.valid)
            .map(|e| e.value)
    }

    pub fn is_resolved(&self) -> bool {
        self.prop_id != 0
    }
}

/// The properties of one KMS object, indexed by `K`.
#[derive(Clone, PartialEq, Eq)]
pub struct PropertyTable<K> {
    entries: Vec<PropInfo>,
    _kind: PhantomData<K>,
}

impl<K: PropertyKind> PropertyTable<K> {
    /// Creates a table with every property of `K` unresolved.
    pub fn new() -> Self {
        let entries = K::ALL
            .iter()
            .map(|&kind| PropInfo {
                name: kind.name(),
                prop_id: 0,
                is_enum: kind.enum_values().is_some(),
                enums: Vec::new(),
            })
            .collect();

        Self {
            entries,
            _kind: PhantomData,
        }
    }

    /// Resolves ids and enum values from the definitions the kernel reports for the object.
    ///
    /// Kernel properties without a table entry are ignored. An entry whose enum-ness disagrees
    /// with the kernel is a table bug and fails the whole call. Returns the number of resolved
    /// properties.
    pub fn populate(&mut self, kernel: &[PropertyDef]) -> Result<usize> {
        let mut resolved = 0;

        for def in kernel {
            let Some(kind) = K::from_name(&def.name) else {
                trace!("Ignoring unknown {} property {}", K::OBJECT, def.name);
                continue;
            };
            let entry = &mut self.entries[kind.index()];

            if entry.is_enum != def.is_enum {
                return Err(KmsError::PropertyKindMismatch {
                    object: K::OBJECT,
                    property: entry.name,
                });
            }

            entry.prop_id = def.id;
            resolved += 1;

            let Some(names) = kind.enum_values() else {
                continue;
            };
            entry.enums.clear();
            entry
                .enums
                .try_reserve_exact(names.len())
                .map_err(|_| KmsError::AllocationFailure("property enum table"))?;
            for &name in names {
                let raw = def
                    .enum_values
                    .iter()
                    .find(|(kernel_name, _)| kernel_name == name)
                    .map(|&(_, value)| value);
                entry.enums.push(EnumEntry {
                    name,
                    valid: raw.is_some(),
                    value: raw.unwrap_or_default(),
                });
            }
        }

        debug!(
            "Resolved {} of {} {} properties",
            resolved,
            K::ALL.len(),
            K::OBJECT
        );

        Ok(resolved)
    }

    /// Reads property `kind` from `live`, see [`PropInfo::value`].
    pub fn value(&self, kind: K, live: &ObjectProperties, default: u64) -> u64 {
        self[kind].value(live, default)
    }

    /// Kernel id of property `kind`, 0 when the driver does not expose it.
    pub fn id(&self, kind: K) -> u32 {
        self[kind].prop_id
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &PropInfo)> {
        K::ALL.iter().copied().zip(self.entries.iter())
    }
}

impl<K: PropertyKind> Default for PropertyTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PropertyKind> Index<K> for PropertyTable<K> {
    type Output = PropInfo;

    fn index(&self, kind: K) -> &PropInfo {
        &self.entries[kind.index()]
    }
}

impl<K: PropertyKind> fmt::Debug for PropertyTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (e.name, e.prop_id)))
            .finish()
    }
}
