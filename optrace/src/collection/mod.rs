pub mod arena;
pub mod clock;
pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod external;
pub mod hooks;
mod materialize;
pub mod queue;
pub mod sampler;
pub mod storage_ids;
pub mod subqueue;
pub mod tree;

pub use arena::{CorrelationId, EventArena};
pub use clock::{ApproxTime, ClockConverter, TimeNs, UNTERMINATED, approx_now, current_tid};
pub use config::{
    ActivityType, ProfilerConfig, ProfilerState, allow_tf32_cublas, set_allow_tf32_cublas,
};
pub use encoder::{
    Device, DeviceType, Dtype, InputOutputEncoder, Layout, OpInput, OpInputs, Scalar, Shape,
    ShapeDecoder, TensorArg, TensorId, TensorMetadata,
};
pub use error::{CollectionError, Result};
pub use events::{
    ActivityKind, AllocationEvent, BackendEvent, DeviceAndResource, EventKind, ExternalEvent,
    FLOW_LINK_ASYNC_CPU_GPU, Flow, MemoryUsage, NO_TID, NnModuleInfo, NodeId, OpCall, OpFields,
    OpResult, OutOfMemoryEvent, ProfiledEvent, PyCCallEvent, PyCallEvent, PyFrame, RecordScope,
};
pub use external::{
    Activity, ActivityCollector, ActivityTrace, CpuActivity, INDEX_KEY, NoopCollector,
    TransferEvents,
};
pub use hooks::{Capture, DeviceEvent, DeviceTimer, ExtraArgs, FallbackTiming, OpMetadataSource};
pub use queue::{RecordQueue, RecordQueueBuilder};
pub use sampler::{CallSampler, CallSamplerFactory, PendingEnter};
pub use subqueue::{ObserverHandle, ThreadLocalSubqueue};
pub use tree::{EventForest, build_tree};
