pub mod dummy;
pub mod nvidia_gpu;
pub mod system;

pub use dummy::{DummyCounters, DummyGpu, DummyHandle};
pub use nvidia_gpu::NvidiaGpu;
pub use system::{ProcessHandle, SystemCounters, TargetSelector};
