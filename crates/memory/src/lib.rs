pub mod clock;
pub mod graph;
pub mod persist;
pub mod retrieval;
pub mod schema;

pub use clock::{Clock, SystemClock};
pub use graph::{EventGraph, GraphError, GraphStats};
pub use retrieval::{EmbedFn, SemanticRetriever, event_text};
pub use schema::MemoryEvent;
