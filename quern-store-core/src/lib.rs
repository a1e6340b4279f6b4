//! Pure data layer of the quern build engine: content-addressed store path
//! computation, the hash primitives it rests on, the derivation model with
//! its ATerm on-disk codec, and the packed string lists used by the
//! substitute registry.
//!
//! Nothing in this crate performs I/O.

pub mod base32;
pub mod derivation;
pub mod hash;
pub mod store_path;
pub mod strings;
pub mod substitute;

pub use base32::to_nix_base32;
pub use derivation::{Derivation, DerivationOutput};
pub use hash::{Algorithm, Hash};
pub use store_path::{PathSet, StoreDir, StorePathError};
pub use strings::{pack_strings, unpack_strings};
pub use substitute::Substitute;
