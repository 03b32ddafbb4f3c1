pub mod bus;
pub mod counterfactual;
pub mod reflect;
pub mod schedulers;
pub mod session;

pub use bus::EventBus;
pub use counterfactual::{BranchOutcome, run_batch};
pub use session::{RecalledMemory, Session, TurnOutcome};
