//! Horse64 bytecode VM runtime
//!
//! The execution half of the Horse64 toolchain: it loads a serialized
//! program artifact (classes, functions, globals, instruction buffers)
//! and runs it on a stack-based interpreter under a cooperative
//! scheduler. The compiler front-end is a separate collaborator whose
//! only interface here is the program blob.
//!
//! Key pieces:
//! - `value` / `heap`: tagged values and the per-thread refcounted pools
//! - `list` / `map` / `hstring`: the container and buffer library
//! - `bytecode` / `program` / `serialize`: the program model and its
//!   versioned dump format
//! - `interp`: the instruction dispatch core
//! - `scheduler`: worker mutex, suspend states, resume selection
//! - `pak`: embedded-program extraction from standalone executables

pub mod bytecode;
pub mod corelib;
pub mod diagnostics;
pub mod frame;
pub mod heap;
pub mod hstring;
pub mod interp;
pub mod list;
pub mod map;
pub mod pak;
pub mod program;
pub mod scheduler;
pub mod serialize;
pub mod stack;
pub mod transfer;
pub mod value;

pub use interp::{NativeCtx, NativeOutcome, RunOutcome, Vmthread};
pub use program::{NativeRegistry, Program};
pub use scheduler::{run_program, ExitStatus, SuspendType, VmExec};
pub use serialize::{dump, restore, LoadError};
pub use transfer::{PortableValue, TransferError};
pub use value::Value;
