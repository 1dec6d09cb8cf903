use std::collections::{HashMap, HashSet};

use super::catalog::AlgoCatalog;
use super::{AlgoHandle, MAX_NUM_ALGOS};
use crate::comm::{Communicator, CommunicatorId};
use crate::registry::{AlgoRuntime, AnyAlgo, DeviceBuffer, DeviceServices};
use crate::Error;

/// Loaded algorithm instances and the communicators they are connected on.
#[derive(Default)]
pub struct AlgoHandleStore {
    free_handles: Vec<AlgoHandle>,
    // catalog index -> rank -> handle
    rank_to_handles: Vec<HashMap<usize, AlgoHandle>>,
    host_algos: HashMap<AlgoHandle, AnyAlgo>,
    dev_algos: HashMap<AlgoHandle, DeviceBuffer>,
    connected: HashMap<CommunicatorId, HashSet<AlgoHandle>>,
    needs_proxy: bool,
    needs_fence: bool,
}

impl AlgoHandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refills the slot pool so that slot 0 is handed out first.
    pub fn reset_pool(&mut self) {
        self.free_handles = (0..MAX_NUM_ALGOS as u32).rev().map(AlgoHandle).collect();
        self.needs_proxy = false;
        self.needs_fence = false;
    }

    #[inline]
    pub fn needs_proxy(&self) -> bool {
        self.needs_proxy
    }

    #[inline]
    pub fn needs_fence(&self) -> bool {
        self.needs_fence
    }

    #[inline]
    pub fn num_loaded(&self) -> usize {
        self.host_algos.len()
    }

    #[inline]
    pub fn handle_for(&self, meta_index: usize, rank: usize) -> Option<AlgoHandle> {
        self.rank_to_handles
            .get(meta_index)
            .and_then(|ranks| ranks.get(&rank))
            .copied()
    }

    #[inline]
    pub fn host_algo(&self, handle: AlgoHandle) -> Option<&AnyAlgo> {
        self.host_algos.get(&handle)
    }

    #[inline]
    pub fn device_algo(&self, handle: AlgoHandle) -> Option<&DeviceBuffer> {
        self.dev_algos.get(&handle)
    }

    pub fn is_connected(&self, comm: CommunicatorId, handle: AlgoHandle) -> bool {
        self.connected
            .get(&comm)
            .is_some_and(|handles| handles.contains(&handle))
    }

    /// Loads every algorithm sized for `comm` on its rank and connects it on `comm`.
    pub fn load_and_connect(
        &mut self,
        catalog: &AlgoCatalog,
        comm: &Communicator,
        runtime: &dyn AlgoRuntime,
        device: &dyn DeviceServices,
    ) -> Result<(), Error> {
        if self.rank_to_handles.len() < catalog.metas().len() {
            self.rank_to_handles.resize_with(catalog.metas().len(), HashMap::new);
        }
        for (index, meta) in catalog.metas().iter().enumerate() {
            if meta.num_ranks != comm.num_ranks {
                continue;
            }
            let handle = match self.handle_for(index, comm.rank) {
                Some(handle) => handle,
                None => {
                    let handle = self.load(&meta.file_path, comm.rank, runtime, device)?;
                    self.rank_to_handles[index].insert(comm.rank, handle);
                    log::debug!(
                        "Loaded algorithm {:?} for rank {} as {:?}",
                        meta.file_path,
                        comm.rank,
                        handle
                    );
                    handle
                }
            };
            self.connect(handle, comm, runtime)?;
        }
        Ok(())
    }

    /// Sets up the connections of `handle` on `comm` unless already done.
    pub fn connect(
        &mut self,
        handle: AlgoHandle,
        comm: &Communicator,
        runtime: &dyn AlgoRuntime,
    ) -> Result<(), Error> {
        if self.is_connected(comm.id, handle) {
            return Ok(());
        }
        let host = self
            .host_algos
            .get(&handle)
            .ok_or_else(|| Error::InvalidUsage(format!("{:?} has no loaded algorithm", handle)))?;
        runtime.setup_connections(host, comm)?;
        self.connected.entry(comm.id).or_default().insert(handle);
        Ok(())
    }

    /// Loads one rank-specific instance into a free slot.
    pub fn load(
        &mut self,
        path: &std::path::Path,
        rank: usize,
        runtime: &dyn AlgoRuntime,
        device: &dyn DeviceServices,
    ) -> Result<AlgoHandle, Error> {
        let handle = self
            .free_handles
            .pop()
            .ok_or(Error::HandlePoolExhausted(MAX_NUM_ALGOS))?;
        let loaded = match runtime.load(path, rank) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.free_handles.push(handle);
                return Err(e.into());
            }
        };
        if loaded.device_bytes > 0 {
            match device.alloc_zeroed(loaded.device_bytes) {
                Ok(buffer) => {
                    self.dev_algos.insert(handle, buffer);
                }
                Err(e) => {
                    self.free_handles.push(handle);
                    if let Err(unload_err) = runtime.unload(loaded.host) {
                        log::warn!(
                            "Failed to unload {:?} after allocation failure: {}",
                            path,
                            unload_err
                        );
                    }
                    return Err(e.into());
                }
            }
        }
        self.needs_proxy |= loaded.needs_proxy;
        self.needs_fence |= loaded.needs_fence;
        self.host_algos.insert(handle, loaded.host);
        Ok(handle)
    }

    /// Unloads everything and returns the slots to the pool. Keeps going
    /// past failures and reports the first one.
    pub fn release_all(
        &mut self,
        runtime: &dyn AlgoRuntime,
        device: &dyn DeviceServices,
    ) -> Result<(), Error> {
        let mut result = Ok(());
        for (handle, host) in self.host_algos.drain() {
            if let Err(e) = runtime.unload(host) {
                log::warn!("Failed to unload {:?}: {}", handle, e);
                if result.is_ok() {
                    result = Err(Error::from(e));
                }
            }
            self.free_handles.push(handle);
        }
        for (handle, buffer) in self.dev_algos.drain() {
            if let Err(e) = device.free(buffer) {
                log::warn!("Failed to free device image of {:?}: {}", handle, e);
                if result.is_ok() {
                    result = Err(Error::from(e));
                }
            }
        }
        self.rank_to_handles.clear();
        self.connected.clear();
        result
    }
}
