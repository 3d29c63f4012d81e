// Re-export common types potentially needed by consumers (like the orchestrator)
pub use devbox_common as common;

pub mod command;
pub mod mock;
pub mod parse;
pub mod pct;
pub mod test_utils;

pub use mock::{AddressPolicy, MockCall, MockContainer, MockControlPlane, MockOp};
pub use pct::{PctConfig, PctControlPlane};
