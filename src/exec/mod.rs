//! Execution: dispatch/record wrapper, batched recorder, readback

pub mod dispatch;
pub mod readback;
pub mod recorder;

pub use dispatch::{check_dispatch_limit, execute, IndirectDispatchArgs, LaunchSpec};
pub use readback::{read_buffer, read_f32s, read_u32};
pub use recorder::CommandRecorder;
