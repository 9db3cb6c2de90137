// drive-lib: the object-store side of the drive filesystem.
// Shared node/path types, the error taxonomy, the ObjectStore contract and
// its implementations (Google Drive REST, in-memory), plus the retry layer.

mod error;
mod gdrive_client;
mod memory_store;
mod node;
mod retry;
mod retrying_store;
mod store;

pub use error::*;
pub use gdrive_client::*;
pub use memory_store::*;
pub use node::*;
pub use retry::*;
pub use retrying_store::*;
pub use store::*;
