//! Enums encoded by ordinal position.
//!
//! Enum values travel as the zero-based position of the variant in its
//! declaration, not by name. Reordering or inserting variants therefore
//! changes the meaning of values already on the wire and must be treated as
//! a breaking protocol change. Appending new variants at the end is safe.

/// Declares an enum that serializes as its ordinal (`u32`).
///
/// The macro derives `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq` and `Hash`;
/// further derives such as `Default` may be added by the caller.
///
/// ```rust
/// tidewire_protocol::ordinal_enum! {
///     /// Traffic light state.
///     #[derive(Default)]
///     pub enum Light {
///         #[default]
///         Red,
///         Amber,
///         Green,
///     }
/// }
///
/// assert_eq!(serde_json::to_string(&Light::Green).unwrap(), "2");
/// assert_eq!(serde_json::from_str::<Light>("1").unwrap(), Light::Amber);
/// ```
#[macro_export]
macro_rules! ordinal_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant
            ),+
        }

        impl $name {
            /// All variants in wire order.
            pub const VARIANTS: &'static [$name] = &[$($name::$variant),+];

            /// Returns the wire ordinal of this variant.
            pub fn ordinal(&self) -> u32 {
                *self as u32
            }

            /// Returns the variant at `ordinal`, if any.
            pub fn from_ordinal(ordinal: u32) -> ::core::option::Option<Self> {
                Self::VARIANTS.get(ordinal as usize).copied()
            }
        }

        impl $crate::__serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> ::core::result::Result<S::Ok, S::Error>
            where
                S: $crate::__serde::Serializer,
            {
                serializer.serialize_u32(self.ordinal())
            }
        }

        impl<'de> $crate::__serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> ::core::result::Result<Self, D::Error>
            where
                D: $crate::__serde::Deserializer<'de>,
            {
                let ordinal = <u32 as $crate::__serde::Deserialize>::deserialize(deserializer)?;
                Self::from_ordinal(ordinal).ok_or_else(|| {
                    <D::Error as $crate::__serde::de::Error>::custom(::core::format_args!(
                        "invalid ordinal {} for {}",
                        ordinal,
                        ::core::stringify!($name)
                    ))
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    ordinal_enum! {
        enum Before {
            First,
            Second,
        }
    }

    ordinal_enum! {
        enum After {
            Second,
            First,
        }
    }

    #[test]
    fn encodes_position_not_name() {
        assert_eq!(serde_json::to_string(&Before::First).unwrap(), "0");
        assert_eq!(serde_json::to_string(&Before::Second).unwrap(), "1");
    }

    #[test]
    fn reordering_changes_meaning() {
        // Same constant name, different position: the wire value is reinterpreted.
        let wire = serde_json::to_string(&Before::First).unwrap();
        let decoded: After = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded, After::Second);

        let wire = serde_json::to_string(&After::Second).unwrap();
        let decoded: Before = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded, Before::First);
    }

    #[test]
    fn ordinal_zero_roundtrip() {
        let decoded: Before = serde_json::from_str("0").unwrap();
        assert_eq!(decoded.ordinal(), 0);
        assert_eq!(Before::from_ordinal(0), Some(Before::First));
    }

    #[test]
    fn unknown_ordinal_rejected() {
        let err = serde_json::from_str::<Before>("7").unwrap_err();
        assert!(err.to_string().contains("invalid ordinal 7 for Before"));
    }
}
