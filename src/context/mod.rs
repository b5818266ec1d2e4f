//! Context locals and the storage that carries them across hops.

pub mod codec;
pub(crate) mod frame;
pub mod local;
pub mod snapshot;

pub use codec::Codec;
pub use local::{AnyLocal, Bindings, ContextLocal, LocalId, Scoped};
pub use snapshot::Snapshot;
