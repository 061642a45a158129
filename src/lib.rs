pub mod checksum;
pub mod compression;
pub mod config;
pub mod descriptor;
pub mod directory;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod frame;
pub mod message;
pub mod queue;
mod reader;
pub mod record;
pub mod registry;
pub mod session;
pub mod store;
pub mod transport;

pub use config::SyncConfig;
pub use descriptor::{FileDescriptor, FileHandle, FileKind};
pub use driver::{spawn_driver, DriverHandle, LinkEvent};
pub use engine::{EngineEvent, TransferEngine};
pub use errors::{Result, TransferError};
pub use queue::{BatchSummary, DownloadQueue, QueueAction};
pub use record::{TransferDirection, TransferRecord, TransferState};
pub use registry::{SessionRegistry, Slot};
pub use session::{SyncEvent, SyncSession};
pub use store::LocalStore;
pub use transport::{Channel, Clock, FileSink, SystemClock, Transport};
