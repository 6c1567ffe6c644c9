//! archipel-services — node state shared by the daemon's tasks: trust store,
//! peer table, manifest catalogue, chunk store and transfer scheduling.

pub mod catalogue;
pub mod events;
pub mod peer;
pub mod persist;
pub mod store;
pub mod transfer;
pub mod trust;

pub use catalogue::{Holding, ManifestCatalogue};
pub use events::{event_channel, Event, EventSender, SecurityAlert};
pub use peer::{ConnectionState, PeerRecord, PeerSource, PeerTable};
pub use persist::{JsonPersistence, MemoryPersistence, Persistence};
pub use store::ChunkStore;
pub use transfer::{ChunkOutcome, SchedulerConfig, TransferError, TransferState};
pub use trust::{TrustEntry, TrustError, TrustPolicy, TrustState, TrustStore};
