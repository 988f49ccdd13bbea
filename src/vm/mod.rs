mod error;
mod pool;
pub mod stdlib;
mod syscall;
mod vm;

pub use error::VmError;
pub use pool::{PooledVm, VmPool};
pub use syscall::{RegisterError, SyscallContext, SyscallError, SyscallResult, SyscallTable};
pub use vm::{Limits, RunStats, Vm, VmStatus};
