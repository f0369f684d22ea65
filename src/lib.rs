pub mod arena;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod ir;
pub mod lower;
pub mod program;
pub mod runtime;
pub mod samples;
pub mod snode;

// Re-exports: the types a caller needs to drive a backend end to end
pub use config::{Arch, CompileConfig};
pub use error::{BackendError, Result};
pub use ir::{DataType, Expr, Kernel, KernelBuilder};
pub use program::{create_program_impl, AotModule, AotModuleBuilder, Program, ProgramImpl};
pub use runtime::{
    AllocationCount, ArgValue, CompiledFunction, DataLayout, DeviceAllocation, DeviceCaps, Fence,
    LaunchContext, ResultBuffer,
};
pub use snode::{SNodeId, SNodeTree, SNodeTreeBuilder, TreeId};
