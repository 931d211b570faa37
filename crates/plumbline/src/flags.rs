//! Bitsets: proxy features, global lifecycle claims, remote permissions.

use std::fmt;

use bitflags::bitflags;
use tracing::warn;

bitflags! {
    /// Progressively activatable capability levels of a proxy.
    ///
    /// Bits from [`Features::CUSTOM_START`] upward are free for object types
    /// that splice their own activation steps.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u32 {
        /// A native handle exists and the server acknowledged the bind.
        const BOUND = 1 << 0;
        /// The info property bag has been received and cached.
        const INFO = 1 << 4;
        /// Enumerated parameters have been cached.
        const PARAMS = 1 << 5;
    }
}

impl Features {
    pub const CUSTOM_START: u32 = 16;

    /// Number of custom bits above [`Features::CUSTOM_START`].
    pub const CUSTOM_COUNT: u32 = u32::BITS - Self::CUSTOM_START;

    /// A feature bit owned by a specific object type.
    ///
    /// Empty when `index` is not below [`Features::CUSTOM_COUNT`].
    pub fn custom(index: u32) -> Self {
        if index >= Self::CUSTOM_COUNT {
            warn!("custom feature index {} out of range", index);
            return Self::empty();
        }
        Self::from_bits_retain(1 << (Self::CUSTOM_START + index))
    }

    /// Parse lowercase feature names as found in configuration files.
    ///
    /// Unknown names are logged and ignored.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        names.iter().fold(Self::empty(), |acc, name| {
            let name = name.as_ref();
            match Self::from_name(&name.to_ascii_uppercase()) {
                Some(feature) => acc.union(feature),
                None => {
                    warn!("ignoring unknown feature name {:?}", name);
                    acc
                }
            }
        })
    }
}

bitflags! {
    /// Independent reasons for a global record to stay alive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GlobalClaims: u8 {
        /// The server announced the object on its registry.
        const APPEARS_ON_WIRE = 1 << 0;
        /// A local proxy created the object and owns the record.
        const OWNED_BY_PROXY = 1 << 1;
    }
}

bitflags! {
    /// Access rights the server granted on an object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Permissions: u32 {
        const R = 0o400;
        const W = 0o200;
        const X = 0o100;
        const M = 0o010;
        const ALL = Self::R.bits() | Self::W.bits() | Self::X.bits() | Self::M.bits();
    }
}

impl Permissions {
    /// The more permissive of two grants, compared numerically.
    pub fn most_permissive(self, other: Self) -> Self {
        Self::from_bits_retain(self.bits().max(other.bits()))
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Permissions, c: char| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            flag(Permissions::R, 'r'),
            flag(Permissions::W, 'w'),
            flag(Permissions::X, 'x'),
            flag(Permissions::M, 'm')
        )
    }
}
