pub mod config;
pub mod sexpr;

use allocator_api2::alloc::Global;
pub use config::CompilerConfig;

pub type HashMap<K, V, A = Global> = hashbrown::HashMap<K, V, hashbrown::DefaultHashBuilder, A>;
pub type HashSet<T, A = Global> = hashbrown::HashSet<T, hashbrown::DefaultHashBuilder, A>;

pub type IndexMap<K, V> = indexmap::IndexMap<K, V, hashbrown::DefaultHashBuilder>;
pub type IndexSet<T> = indexmap::IndexSet<T, hashbrown::DefaultHashBuilder>;

/// Declares a 32-bit entity reference usable as a key in
/// `cranelift_entity` maps. `u32::MAX` is reserved so the type
/// can be stored in a `PackedOption`.
#[macro_export]
macro_rules! entity_ref {
    {
        $(#[$attr:meta])*
        pub struct $ident:ident;
    } => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord, bytemuck::Pod, bytemuck::Zeroable)]
        #[repr(transparent)]
        $(#[$attr])*
        pub struct $ident(u32);

        impl ::cranelift_entity::EntityRef for $ident {
            fn new(i: usize) -> Self {
                if i >= u32::MAX as usize {
                    // u32::MAX is a reserved value
                    panic!(concat!("too many entities refs of type ", stringify!($ident)));
                }
                Self(i as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl ::cranelift_entity::packed_option::ReservedValue for $ident {
            fn is_reserved_value(&self) -> bool {
                self.0 == u32::MAX
            }

            fn reserved_value() -> Self {
                Self(u32::MAX)
            }
        }
    };
}
