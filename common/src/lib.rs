pub mod channel;
pub mod config;
pub mod dag;
pub mod http;
pub mod ids;
pub mod job;
pub mod logging;
pub mod protocol;
pub mod state;
pub mod task;
pub mod worker;

pub use channel::{ChannelLookup, DataFrame, OpenAck, Record};
pub use dag::{GraphError, InputSplit, JobEdge, JobGraph, JobVertex};
pub use http::{HttpCoordinatorClient, HttpWorkerClient};
pub use ids::{ChannelId, JobId, VertexId};
pub use job::{JobInfo, JobResult};
pub use protocol::{CoordinatorProtocol, RpcError, WorkerProtocol};
pub use state::{ExecutionState, JobStatus};
pub use task::{
    AccumulatorReport, GateDescriptor, ReturnCode, TaskCancelResult, TaskDeploymentDescriptor,
    TaskExecutionState, TaskSubmissionResult,
};
pub use worker::{
    BufferUtilization, ChannelUtilization, HardwareDescription, Heartbeat,
    InstanceConnectionInfo, WorkerMetrics,
};
