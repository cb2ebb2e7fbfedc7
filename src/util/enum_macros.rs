/// Generates an enum for a BACnet enumeration whose numbering space is split
/// into a standard part, a vendor-proprietary range, and everything else.
///
/// Named values become plain variants. Unnamed values inside `$custom_range`
/// become `Custom(..)`, unnamed values outside it become `Reserved(..)`, so a
/// decoded value never gets lost even when this crate has no name for it.
///
/// # Example
///
/// ```rust
/// use bacnet_recon::custom_range_enum;
///
/// custom_range_enum! {
///     /// Units used by a sensor
///     SensorUnit {
///         Celsius = 62,
///         Percent = 98,
///     },
///     u16,
///     256..=65535
/// }
///
/// assert_eq!(u16::from(SensorUnit::Celsius), 62);
/// assert_eq!(SensorUnit::from(98u16), SensorUnit::Percent);
/// assert!(matches!(SensorUnit::from(300u16), SensorUnit::Custom(_)));
/// assert!(matches!(SensorUnit::from(120u16), SensorUnit::Reserved(_)));
/// assert_eq!(SensorUnit::from(300u16).to_string(), "Custom(300)");
/// assert!(SensorUnit::Percent.is_standard());
/// ```
///
/// Besides the enum and its `[<Name>Value>]` payload type the macro
/// implements `Display`, `From<$name> for $unit` and `From<$unit> for $name`.
#[macro_export]
macro_rules! custom_range_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:expr,)+ }, $unit:ident, $custom_range:expr) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub enum $name {
                $($variant,)*
                Custom( [<$name Value>] ),
                Reserved( [<$name Value>] ),
            }

            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct [<$name Value>] { value: $unit }

            impl [<$name Value>] {
                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl $name {
                /// True when the value has a name in this crate
                pub fn is_standard(&self) -> bool {
                    !matches!(self, $name::Custom(_) | $name::Reserved(_))
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => write!(f, "{}", stringify!($variant)),)*
                        $name::Custom( value ) => write!(f, "Custom({})", value.value()),
                        $name::Reserved( value ) => write!(f, "Reserved({})", value.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Custom( value ) => value.value(),
                        $name::Reserved( value ) => value.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($custom_range).contains(&v) => {
                            $name::Custom( [<$name Value>] { value: v } )
                        }
                        v => $name::Reserved( [<$name Value>] { value: v } ),
                    }
                }
            }
        }
    };
}
