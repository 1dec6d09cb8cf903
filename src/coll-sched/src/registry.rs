use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use crate::algo::{AlgoHandle, AlgoMeta};
use crate::comm::Communicator;
use crate::param::{DataType, DevicePtr, ReduceOp, SchedulerParam, StreamHandle};
use crate::CollaboratorError;

pub type AnyAlgo = Box<dyn Any + Send>;

pub struct LoadedAlgo {
    // host-side algorithm object, only interpreted by the runtime
    pub host: AnyAlgo,
    // size of the device image the runtime uploads on launch
    pub device_bytes: usize,
    pub needs_proxy: bool,
    pub needs_fence: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub ptr: DevicePtr,
    pub size: usize,
}

/// Everything a runtime needs to launch one scheduled collective.
pub struct AlgoLaunch<'a> {
    pub param: &'a SchedulerParam<'a>,
    pub handle: AlgoHandle,
    pub host_algo: &'a AnyAlgo,
    pub device_algo: Option<&'a DeviceBuffer>,
    pub scratch: Option<&'a DeviceBuffer>,
    pub sync_flags: &'a DeviceBuffer,
    pub work_index: u64,
    pub last_stream: Option<StreamHandle>,
    pub comm: &'a Communicator,
    pub stream: StreamHandle,
}

pub trait AlgoParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<AlgoMeta, CollaboratorError>;
}

pub trait AlgoRuntime: Send + Sync {
    // Build the rank-specific instance of the algorithm described by `path`
    fn load(&self, path: &Path, rank: usize) -> Result<LoadedAlgo, CollaboratorError>;

    fn unload(&self, algo: AnyAlgo) -> Result<(), CollaboratorError>;

    // Establish the cross-rank connections the algorithm uses on `comm`
    fn setup_connections(
        &self,
        algo: &AnyAlgo,
        comm: &Communicator,
    ) -> Result<(), CollaboratorError>;

    #[inline]
    fn scratch_bytes(&self, _algo: &AnyAlgo, _param: &SchedulerParam<'_>) -> usize {
        0
    }

    // Enqueue the algorithm on the launch stream
    fn launch(&self, launch: AlgoLaunch<'_>) -> Result<(), CollaboratorError>;
}

pub trait DeviceServices: Send + Sync {
    fn alloc_zeroed(&self, bytes: usize) -> Result<DeviceBuffer, CollaboratorError>;

    fn free(&self, buffer: DeviceBuffer) -> Result<(), CollaboratorError>;

    fn stack_size_limit(&self) -> Result<usize, CollaboratorError>;

    fn set_stack_size_limit(&self, bytes: usize) -> Result<(), CollaboratorError>;

    // Prepare the algorithm kernels, returns the largest stack size they need
    fn init_kernels(&self, cuda_arch: u32) -> Result<usize, CollaboratorError>;
}

/// The runtime's plain collectives.
pub trait FallbackCollectives: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn reduce(
        &self,
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        op: ReduceOp,
        root: usize,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), CollaboratorError>;

    #[allow(clippy::too_many_arguments)]
    fn broadcast(
        &self,
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        root: usize,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), CollaboratorError>;

    #[allow(clippy::too_many_arguments)]
    fn all_reduce(
        &self,
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        op: ReduceOp,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), CollaboratorError>;

    #[allow(clippy::too_many_arguments)]
    fn reduce_scatter(
        &self,
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        op: ReduceOp,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), CollaboratorError>;

    fn all_gather(
        &self,
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), CollaboratorError>;

    fn send(
        &self,
        send_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        peer: usize,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), CollaboratorError>;

    fn recv(
        &self,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        peer: usize,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), CollaboratorError>;

    fn all_to_all(
        &self,
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), CollaboratorError>;
}

#[derive(Clone)]
pub struct CollaboratorRegistry {
    pub parser: Arc<dyn AlgoParser>,
    pub runtime: Arc<dyn AlgoRuntime>,
    pub device: Arc<dyn DeviceServices>,
    pub fallback: Arc<dyn FallbackCollectives>,
}
