/// GATT characteristic model
///
/// Descriptors produced by service discovery, the static identity table of
/// well-known characteristics, and the lookup table a session keeps for its
/// current link.
pub mod descriptor;
pub mod registry;

pub use descriptor::{
    select_chunked_write_mode, select_write_mode, short_text, uuid_from_u16, uuid_from_u32,
    CharacteristicDescriptor, CCCD_UUID,
};
pub use registry::{CharacteristicRegistry, Feature};
