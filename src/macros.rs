//! # Internal Macros
//!
//! ## le_fields!
//!
//! On-disk headers store integers as zerocopy little-endian wrappers. This
//! macro generates a native-typed getter and a `set_` setter per field:
//!
//! ```ignore
//! impl ArenaHeader {
//!     le_fields! {
//!         capacity: U32 => u32,
//!         slot_offset: U16 => u16,
//!     }
//! }
//! ```

macro_rules! le_fields {
    ($($field:ident : $wrapper:ident => $native:ty),* $(,)?) => {
        $(
            ::paste::paste! {
                #[inline]
                pub fn $field(&self) -> $native {
                    self.$field.get()
                }

                #[inline]
                pub fn [<set_ $field>](&mut self, val: $native) {
                    self.$field = ::zerocopy::little_endian::$wrapper::new(val);
                }
            }
        )*
    };
}
