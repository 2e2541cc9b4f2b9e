pub mod events;
pub mod node_registry;
pub mod persistence;
pub mod reconciler;
pub mod workers;

pub use events::{EventSink, NodeScope, RegistryEvent};
pub use node_registry::{NodeRegistry, RegistryError, RegistrySettings};
pub use workers::{keepalive_worker, prune_worker, save_worker};
