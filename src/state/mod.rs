pub mod types;
pub mod utils;

pub use types::VmLifecycle;
pub use utils::{generate_vm_id, validate_vm_id};
