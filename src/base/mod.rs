pub mod memref;

pub use memref::{AccessKind, Domain, MemoryReference};
