pub mod engine;
pub mod math;
pub mod state;

pub use engine::{CollapseRecord, TurnDynamics, advance};
pub use state::{DynamicsError, FieldState, PersistedField};
