#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use tempfile::TempDir;

use coll_sched::registry::{
    AlgoLaunch, AlgoParser, AlgoRuntime, AnyAlgo, DeviceBuffer, DeviceServices,
    FallbackCollectives, LoadedAlgo,
};
use coll_sched::{
    is_caller, AlgoMeta, AlgoScheduler, CollFunc, CollaboratorRegistry, Communicator,
    CommunicatorId, DataType, DevicePtr, PeerInfo, ReduceOp, SchedulerConfig, SchedulerParam,
    StreamHandle,
};

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct MockParser {
    pub parsed: AtomicUsize,
}

impl AlgoParser for MockParser {
    fn parse(&self, path: &Path) -> anyhow::Result<AlgoMeta> {
        self.parsed.fetch_add(1, Ordering::SeqCst);
        let content = fs::read_to_string(path)?;
        let meta = toml::from_str(&content)
            .with_context(|| format!("malformed algorithm {:?}", path))?;
        Ok(meta)
    }
}

#[derive(Clone, Debug)]
pub struct LaunchRecord {
    pub path: PathBuf,
    pub func: CollFunc,
    pub count: usize,
    pub recv_counts: Option<Vec<usize>>,
    pub work_index: u64,
    pub last_stream: Option<StreamHandle>,
    pub stream: StreamHandle,
    pub scratch: Option<DeviceBuffer>,
    pub has_device_image: bool,
}

#[derive(Default)]
pub struct MockRuntime {
    pub loads: Mutex<Vec<(PathBuf, usize)>>,
    pub unloads: AtomicUsize,
    pub connects: Mutex<Vec<(PathBuf, CommunicatorId)>>,
    pub launches: Mutex<Vec<LaunchRecord>>,
    pub scratch_bytes: AtomicUsize,
    pub device_bytes: AtomicUsize,
    pub needs_proxy: AtomicBool,
}

impl MockRuntime {
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().unwrap().clone()
    }

    pub fn num_loads(&self) -> usize {
        self.loads.lock().unwrap().len()
    }
}

fn host_path(algo: &AnyAlgo) -> anyhow::Result<&PathBuf> {
    algo.downcast_ref::<PathBuf>().ok_or_else(|| anyhow!("foreign algorithm object"))
}

impl AlgoRuntime for MockRuntime {
    fn load(&self, path: &Path, rank: usize) -> anyhow::Result<LoadedAlgo> {
        self.loads.lock().unwrap().push((path.to_path_buf(), rank));
        Ok(LoadedAlgo {
            host: Box::new(path.to_path_buf()),
            device_bytes: self.device_bytes.load(Ordering::SeqCst),
            needs_proxy: self.needs_proxy.load(Ordering::SeqCst),
            needs_fence: false,
        })
    }

    fn unload(&self, algo: AnyAlgo) -> anyhow::Result<()> {
        host_path(&algo)?;
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn setup_connections(&self, algo: &AnyAlgo, comm: &Communicator) -> anyhow::Result<()> {
        let path = host_path(algo)?.clone();
        self.connects.lock().unwrap().push((path, comm.id));
        Ok(())
    }

    fn scratch_bytes(&self, _algo: &AnyAlgo, _param: &SchedulerParam<'_>) -> usize {
        self.scratch_bytes.load(Ordering::SeqCst)
    }

    fn launch(&self, launch: AlgoLaunch<'_>) -> anyhow::Result<()> {
        let coll = &launch.param.coll;
        let record = LaunchRecord {
            path: host_path(launch.host_algo)?.clone(),
            func: coll.func,
            count: coll.count,
            recv_counts: coll.var_counts.as_ref().map(|v| v.recv_counts.to_vec()),
            work_index: launch.work_index,
            last_stream: launch.last_stream,
            stream: launch.stream,
            scratch: launch.scratch.copied(),
            has_device_image: launch.device_algo.is_some(),
        };
        self.launches.lock().unwrap().push(record);
        Ok(())
    }
}

pub struct MockDevice {
    next_ptr: AtomicUsize,
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
    pub stack_limit: AtomicUsize,
    pub required_stack: usize,
    pub kernel_inits: AtomicUsize,
}

impl MockDevice {
    pub fn new(stack_limit: usize, required_stack: usize) -> Self {
        MockDevice {
            next_ptr: AtomicUsize::new(0x10_0000),
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            stack_limit: AtomicUsize::new(stack_limit),
            required_stack,
            kernel_inits: AtomicUsize::new(0),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.allocs.load(Ordering::SeqCst) - self.frees.load(Ordering::SeqCst)
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice::new(1024, 512)
    }
}

impl DeviceServices for MockDevice {
    fn alloc_zeroed(&self, bytes: usize) -> anyhow::Result<DeviceBuffer> {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        let ptr = self.next_ptr.fetch_add(bytes.max(1), Ordering::SeqCst);
        Ok(DeviceBuffer {
            ptr: DevicePtr(ptr),
            size: bytes,
        })
    }

    fn free(&self, _buffer: DeviceBuffer) -> anyhow::Result<()> {
        self.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stack_size_limit(&self) -> anyhow::Result<usize> {
        Ok(self.stack_limit.load(Ordering::SeqCst))
    }

    fn set_stack_size_limit(&self, bytes: usize) -> anyhow::Result<()> {
        self.stack_limit.store(bytes, Ordering::SeqCst);
        Ok(())
    }

    fn init_kernels(&self, _cuda_arch: u32) -> anyhow::Result<usize> {
        self.kernel_inits.fetch_add(1, Ordering::SeqCst);
        Ok(self.required_stack)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackCall {
    pub func: CollFunc,
    pub count: usize,
    pub as_caller: bool,
}

#[derive(Default)]
pub struct MockFallback {
    pub calls: Mutex<Vec<FallbackCall>>,
    pub fail: AtomicBool,
}

impl MockFallback {
    pub fn calls(&self) -> Vec<FallbackCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, func: CollFunc, count: usize) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(FallbackCall {
            func,
            count,
            as_caller: is_caller(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("{:?} failed", func));
        }
        Ok(())
    }
}

impl FallbackCollectives for MockFallback {
    fn reduce(
        &self,
        _send_buf: DevicePtr,
        _recv_buf: DevicePtr,
        count: usize,
        _data_type: DataType,
        _op: ReduceOp,
        _root: usize,
        _comm: &Communicator,
        _stream: StreamHandle,
    ) -> anyhow::Result<()> {
        self.record(CollFunc::Reduce, count)
    }

    fn broadcast(
        &self,
        _send_buf: DevicePtr,
        _recv_buf: DevicePtr,
        count: usize,
        _data_type: DataType,
        _root: usize,
        _comm: &Communicator,
        _stream: StreamHandle,
    ) -> anyhow::Result<()> {
        self.record(CollFunc::Broadcast, count)
    }

    fn all_reduce(
        &self,
        _send_buf: DevicePtr,
        _recv_buf: DevicePtr,
        count: usize,
        _data_type: DataType,
        _op: ReduceOp,
        _comm: &Communicator,
        _stream: StreamHandle,
    ) -> anyhow::Result<()> {
        self.record(CollFunc::AllReduce, count)
    }

    fn reduce_scatter(
        &self,
        _send_buf: DevicePtr,
        _recv_buf: DevicePtr,
        count: usize,
        _data_type: DataType,
        _op: ReduceOp,
        _comm: &Communicator,
        _stream: StreamHandle,
    ) -> anyhow::Result<()> {
        self.record(CollFunc::ReduceScatter, count)
    }

    fn all_gather(
        &self,
        _send_buf: DevicePtr,
        _recv_buf: DevicePtr,
        count: usize,
        _data_type: DataType,
        _comm: &Communicator,
        _stream: StreamHandle,
    ) -> anyhow::Result<()> {
        self.record(CollFunc::AllGather, count)
    }

    fn send(
        &self,
        _send_buf: DevicePtr,
        count: usize,
        _data_type: DataType,
        _peer: usize,
        _comm: &Communicator,
        _stream: StreamHandle,
    ) -> anyhow::Result<()> {
        self.record(CollFunc::Send, count)
    }

    fn recv(
        &self,
        _recv_buf: DevicePtr,
        count: usize,
        _data_type: DataType,
        _peer: usize,
        _comm: &Communicator,
        _stream: StreamHandle,
    ) -> anyhow::Result<()> {
        self.record(CollFunc::Recv, count)
    }

    fn all_to_all(
        &self,
        _send_buf: DevicePtr,
        _recv_buf: DevicePtr,
        count: usize,
        _data_type: DataType,
        _comm: &Communicator,
        _stream: StreamHandle,
    ) -> anyhow::Result<()> {
        self.record(CollFunc::AllToAll, count)
    }
}

pub fn algo(name: &str, func: CollFunc, num_ranks: usize) -> AlgoMeta {
    AlgoMeta {
        file_path: PathBuf::new(),
        name: name.to_string(),
        func,
        num_ranks,
        num_channels: 4,
        size_multiplier: 1,
        num_chunks_per_loop: num_ranks,
        min_bytes: 0,
        max_bytes: 0,
        in_place: true,
        out_of_place: true,
    }
}

pub fn write_algo(dir: &Path, file_name: &str, meta: &AlgoMeta) -> PathBuf {
    let path = dir.join(file_name);
    fs::write(&path, toml::to_string(meta).unwrap()).unwrap();
    path
}

/// Ranks on distinct hosts, one process each.
pub fn comm(id: u32, rank: usize, num_ranks: usize) -> Arc<Communicator> {
    let peers = (0..num_ranks as u64)
        .map(|i| PeerInfo {
            host_hash: i,
            pid_hash: 100 + i,
        })
        .collect();
    Arc::new(Communicator::new(CommunicatorId(id), rank, peers))
}

pub struct Harness {
    pub dir: TempDir,
    pub parser: Arc<MockParser>,
    pub runtime: Arc<MockRuntime>,
    pub device: Arc<MockDevice>,
    pub fallback: Arc<MockFallback>,
}

impl Harness {
    pub fn new() -> Self {
        init_log();
        Harness {
            dir: tempfile::tempdir().unwrap(),
            parser: Arc::new(MockParser::default()),
            runtime: Arc::new(MockRuntime::default()),
            device: Arc::new(MockDevice::default()),
            fallback: Arc::new(MockFallback::default()),
        }
    }

    pub fn algo_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> SchedulerConfig {
        SchedulerConfig {
            scheduler_path: PathBuf::from("/nonexistent/libmsccl-scheduler.so"),
            algo_dir: Some(self.dir.path().to_path_buf()),
            ..SchedulerConfig::default()
        }
    }

    pub fn registry(&self) -> CollaboratorRegistry {
        CollaboratorRegistry {
            parser: self.parser.clone(),
            runtime: self.runtime.clone(),
            device: self.device.clone(),
            fallback: self.fallback.clone(),
        }
    }

    pub fn scheduler(&self) -> AlgoScheduler {
        AlgoScheduler::new(self.config(), self.registry())
    }

    pub fn scheduler_with(&self, config: SchedulerConfig) -> AlgoScheduler {
        AlgoScheduler::new(config, self.registry())
    }
}
