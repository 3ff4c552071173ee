pub mod api;
pub mod config;
pub mod jailer;
pub mod vm;

pub use api::{ApiResponse, FirecrackerClient};
pub use config::{MachineSpec, VmConfig};
pub use jailer::{Jail, JailerContext};
pub use vm::VmHandle;
