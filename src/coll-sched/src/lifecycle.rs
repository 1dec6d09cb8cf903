use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::algo::catalog::AlgoCatalog;
use crate::algo::store::AlgoHandleStore;
use crate::algo::{AlgoHandle, MAX_NUM_THREAD_BLOCKS, SYNC_FLAG_BYTES};
use crate::comm::{ranks_compatible, Communicator};
use crate::config::SchedulerConfig;
use crate::fallback;
use crate::group::{self, GroupStatus, SavedOp};
use crate::param::{CollOp, SchedulerParam, StreamHandle};
use crate::registry::{AlgoLaunch, CollaboratorRegistry, DeviceBuffer, DeviceServices};
use crate::scheduler::{ActiveScheduler, ExternalScheduler};
use crate::Error;

/// Process-wide resources, all present while the scheduler is initialized.
#[derive(Default)]
struct SchedulerStatus {
    scheduler: Option<ActiveScheduler>,
    catalog: AlgoCatalog,
    store: AlgoHandleStore,
    scratch: Option<DeviceBuffer>,
    sync_flags: Option<DeviceBuffer>,
    work_index: u64,
    last_stream: Option<StreamHandle>,
}

/// Owns algorithm selection and the lifetime of every loaded algorithm.
///
/// All shared state sits behind one lifecycle mutex; [`is_available`] reads
/// an atomic flag that is published last during init and cleared last
/// during teardown.
///
/// [`is_available`]: AlgoScheduler::is_available
pub struct AlgoScheduler {
    config: SchedulerConfig,
    registry: CollaboratorRegistry,
    status: Mutex<SchedulerStatus>,
    initialized: AtomicBool,
}

fn keep_first(result: &mut Result<(), Error>, next: Result<(), Error>) {
    if let Err(e) = next {
        log::warn!("Release failed: {}", e);
        if result.is_ok() {
            *result = Err(e);
        }
    }
}

fn select_locked(
    status: &SchedulerStatus,
    param: &SchedulerParam<'_>,
) -> Result<Option<AlgoHandle>, Error> {
    match &status.scheduler {
        Some(scheduler) => scheduler.select(&status.catalog, &status.store, param),
        None => Ok(None),
    }
}

fn ensure_scratch(
    device: &dyn DeviceServices,
    scratch: &mut Option<DeviceBuffer>,
    bytes: usize,
) -> Result<(), Error> {
    if bytes <= scratch.as_ref().map_or(0, |b| b.size) {
        return Ok(());
    }
    if let Some(old) = scratch.take() {
        device.free(old)?;
    }
    *scratch = Some(device.alloc_zeroed(bytes)?);
    log::debug!("Scratch buffer grown to {} bytes", bytes);
    Ok(())
}

impl AlgoScheduler {
    pub fn new(config: SchedulerConfig, registry: CollaboratorRegistry) -> Self {
        AlgoScheduler {
            config,
            registry,
            status: Mutex::new(SchedulerStatus::default()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn from_env(registry: CollaboratorRegistry) -> Self {
        Self::new(SchedulerConfig::from_env(), registry)
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.is_enabled() && self.initialized.load(Ordering::Acquire)
    }

    fn lock_status(&self) -> MutexGuard<'_, SchedulerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Uses `external` instead of discovering a scheduler library.
    /// Must happen before the first init.
    pub fn install_external(&self, external: ExternalScheduler) -> Result<(), Error> {
        let mut status = self.lock_status();
        if status.scheduler.is_some() {
            return Err(Error::InvalidUsage("a scheduler is already active".to_string()));
        }
        status.scheduler = Some(ActiveScheduler::external(external)?);
        Ok(())
    }

    /// Prepares `comm` for algorithm scheduling and brings up the process-wide
    /// resources on first use. Returns the number of channels `comm` needs.
    pub fn init(&self, comm: &Communicator) -> Result<u32, Error> {
        if !self.is_enabled() {
            comm.set_algo_compatible(false);
            return Ok(0);
        }
        if comm.intra_ranks > 1 {
            comm.set_algo_compatible(false);
            log::info!(
                "Algorithms do not support multiple GPUs in one process, \
                 communicator {:?} uses plain collectives",
                comm.id
            );
            return Ok(0);
        }
        let compatible = ranks_compatible(&comm.peers_info);
        comm.set_algo_compatible(compatible);
        if !compatible {
            log::info!(
                "Communicator {:?} has ranks sharing a process, algorithms are disabled for it",
                comm.id
            );
            return Ok(0);
        }

        let (channels, first_init) = {
            let mut status = self.lock_status();
            let was_ready = self.initialized.load(Ordering::Acquire);
            match self.init_locked(&mut status, comm) {
                Ok(channels) => (channels, !was_ready),
                Err(e) => {
                    if !was_ready {
                        let mut rollback = Ok(());
                        self.release_locked(&mut status, &mut rollback);
                    }
                    return Err(e);
                }
            }
        };

        if first_init {
            self.adjust_stack_size(comm)?;
            log::info!("Initialization finished");
        }
        Ok(channels)
    }

    fn init_locked(&self, status: &mut SchedulerStatus, comm: &Communicator) -> Result<u32, Error> {
        if status.scheduler.is_none() {
            status.scheduler = Some(ActiveScheduler::discover(&self.config)?);
        }
        let SchedulerStatus {
            scheduler,
            catalog,
            store,
            ..
        } = &mut *status;
        let Some(scheduler) = scheduler.as_ref() else {
            return Err(Error::InvalidUsage("no scheduler after discovery".to_string()));
        };
        let channels = scheduler.init(catalog, comm, &self.config, &*self.registry.parser)?;

        let ready = self.initialized.load(Ordering::Acquire);
        if !ready {
            store.reset_pool();
        }
        // connections cannot be set up later while a stream is being captured
        if !scheduler.is_external() {
            store.load_and_connect(catalog, comm, &*self.registry.runtime, &*self.registry.device)?;
        }
        if ready {
            return Ok(channels);
        }

        status.scratch = None;
        status.work_index = 1;
        status.last_stream = None;
        status.sync_flags = Some(
            self.registry
                .device
                .alloc_zeroed(MAX_NUM_THREAD_BLOCKS * SYNC_FLAG_BYTES)?,
        );
        self.initialized.store(true, Ordering::Release);
        Ok(channels)
    }

    fn adjust_stack_size(&self, comm: &Communicator) -> Result<(), Error> {
        let device = &*self.registry.device;
        let current = device.stack_size_limit().unwrap_or_else(|e| {
            log::warn!("Cannot query the device stack size limit: {}", e);
            0
        });
        let required = device.init_kernels(comm.cuda_arch)?;
        if required > current && self.config.set_stack_size {
            log::trace!("Resetting device stack size limit to {}", required);
            if let Err(e) = device.set_stack_size_limit(required) {
                log::warn!("Failed to reset the device stack size limit: {}", e);
            }
        }
        Ok(())
    }

    /// Releases everything; the subsystem is unavailable afterwards.
    pub fn teardown(&self) -> Result<(), Error> {
        group::clear_saved();
        {
            let mut status = self.lock_status();
            if !self.initialized.load(Ordering::Acquire) {
                // an installed scheduler may never have seen a successful init
                return match status.scheduler.take() {
                    Some(scheduler) => scheduler.teardown(&mut status.catalog),
                    None => Ok(()),
                };
            }
            let mut result = Ok(());
            self.release_locked(&mut status, &mut result);
            self.initialized.store(false, Ordering::Release);
            result?;
        }
        log::info!("Teardown finished");
        Ok(())
    }

    fn release_locked(&self, status: &mut SchedulerStatus, result: &mut Result<(), Error>) {
        let runtime = &*self.registry.runtime;
        let device = &*self.registry.device;
        keep_first(result, status.store.release_all(runtime, device));
        for buffer in [status.scratch.take(), status.sync_flags.take()].into_iter().flatten() {
            keep_first(result, device.free(buffer).map_err(Error::from));
        }
        status.last_stream = None;
        match status.scheduler.take() {
            Some(scheduler) => keep_first(result, scheduler.teardown(&mut status.catalog)),
            None => status.catalog.clear(),
        }
    }

    /// Loads an algorithm file for `rank` outside of catalog discovery.
    pub fn load_algorithm(&self, path: &Path, rank: usize) -> Result<AlgoHandle, Error> {
        let mut status = self.lock_status();
        if !self.initialized.load(Ordering::Acquire) {
            return Err(Error::InvalidUsage("load before initialization".to_string()));
        }
        status
            .store
            .load(path, rank, &*self.registry.runtime, &*self.registry.device)
    }

    pub fn connect_algorithm(&self, handle: AlgoHandle, comm: &Communicator) -> Result<(), Error> {
        let mut status = self.lock_status();
        status.store.connect(handle, comm, &*self.registry.runtime)
    }

    pub fn select_algorithm(
        &self,
        param: &SchedulerParam<'_>,
    ) -> Result<Option<AlgoHandle>, Error> {
        select_locked(&self.lock_status(), param)
    }

    pub fn group_start(&self) -> Result<(), Error> {
        group::group_start();
        Ok(())
    }

    pub fn group_end(&self) -> Result<(), Error> {
        if let Some(saved) = group::group_end()? {
            self.run_saved(saved)?;
        }
        Ok(())
    }

    /// Schedules one collective issued by `comm`'s rank, or runs it on the
    /// plain collectives.
    pub fn enqueue(
        &self,
        coll: CollOp<'_>,
        comm: &Arc<Communicator>,
        stream: StreamHandle,
    ) -> Result<(), Error> {
        let param = SchedulerParam::new(coll, comm.rank, comm.num_ranks);
        param.validate()?;
        let schedulable = comm.algo_compatible() && self.is_available();
        let plain = &*self.registry.fallback;

        match group::group_status() {
            GroupStatus::NoGroup => {
                if schedulable {
                    let mut status = self.lock_status();
                    if let Some(handle) = select_locked(&status, &param)? {
                        return self.launch_locked(&mut status, &param, handle, comm, stream);
                    }
                }
                fallback::fall_back(plain, group::take_saved(), Some((&param, &**comm, stream)))
            }
            GroupStatus::SupportedOp => {
                if schedulable {
                    if let Some(handle) = self.select_algorithm(&param)? {
                        // runs at group end, after the caller's arrays may be gone
                        group::push_saved(SavedOp {
                            param: param.into_owned(),
                            handle: Some(handle),
                            comm: Arc::clone(comm),
                            stream,
                        });
                        return Ok(());
                    }
                }
                log::debug!("{:?} has no algorithm, group falls back", param.coll.func);
                group::set_group_status(GroupStatus::UnsupportedOp);
                fallback::fall_back(plain, group::take_saved(), Some((&param, &**comm, stream)))
            }
            GroupStatus::UnsupportedOp => {
                fallback::fall_back(plain, group::take_saved(), Some((&param, &**comm, stream)))
            }
        }
    }

    fn run_saved(&self, saved: Vec<SavedOp>) -> Result<(), Error> {
        for op in saved {
            let handle = op.handle.ok_or_else(|| {
                Error::InvalidUsage("buffered operation has no algorithm".to_string())
            })?;
            self.run_algorithm(&op.param, handle, &op.comm, op.stream)?;
        }
        Ok(())
    }

    fn run_algorithm(
        &self,
        param: &SchedulerParam<'_>,
        handle: AlgoHandle,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), Error> {
        self.launch_locked(&mut self.lock_status(), param, handle, comm, stream)
    }

    fn launch_locked(
        &self,
        status: &mut SchedulerStatus,
        param: &SchedulerParam<'_>,
        handle: AlgoHandle,
        comm: &Communicator,
        stream: StreamHandle,
    ) -> Result<(), Error> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(Error::InvalidUsage("launch after teardown".to_string()));
        }
        let runtime = &*self.registry.runtime;
        let SchedulerStatus {
            store,
            scratch,
            sync_flags,
            work_index,
            last_stream,
            ..
        } = status;
        let host_algo = store
            .host_algo(handle)
            .ok_or_else(|| Error::InvalidUsage(format!("{:?} is not loaded", handle)))?;
        let scratch_bytes = runtime.scratch_bytes(host_algo, param);
        ensure_scratch(&*self.registry.device, scratch, scratch_bytes)?;
        let sync_flags = sync_flags
            .as_ref()
            .ok_or_else(|| Error::InvalidUsage("sync flags missing".to_string()))?;
        runtime.launch(AlgoLaunch {
            param,
            handle,
            host_algo,
            device_algo: store.device_algo(handle),
            scratch: scratch.as_ref(),
            sync_flags,
            work_index: *work_index,
            last_stream: *last_stream,
            comm,
            stream,
        })?;
        *work_index += 1;
        *last_stream = Some(stream);
        Ok(())
    }

    pub fn needs_proxy(&self) -> bool {
        self.lock_status().store.needs_proxy()
    }

    pub fn needs_fence(&self) -> bool {
        self.lock_status().store.needs_fence()
    }

    pub fn work_index(&self) -> u64 {
        self.lock_status().work_index
    }

    pub fn scratch_size(&self) -> usize {
        self.lock_status().scratch.as_ref().map_or(0, |b| b.size)
    }

    pub fn num_loaded_algorithms(&self) -> usize {
        self.lock_status().store.num_loaded()
    }

    pub fn uses_external_scheduler(&self) -> bool {
        self.lock_status()
            .scheduler
            .as_ref()
            .is_some_and(ActiveScheduler::is_external)
    }
}
