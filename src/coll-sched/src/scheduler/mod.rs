use crate::algo::catalog::AlgoCatalog;
use crate::algo::store::AlgoHandleStore;
use crate::algo::{AlgoHandle, MAX_CHANNELS};
use crate::comm::Communicator;
use crate::config::SchedulerConfig;
use crate::param::SchedulerParam;
use crate::registry::AlgoParser;
use crate::Error;

pub mod external;

pub use external::{ExternalScheduler, FfiSchedulerParam, SchedulerInterface};

/// The scheduler deciding which algorithm runs an operation.
pub enum ActiveScheduler {
    /// Matches operations against the algorithm catalog.
    Internal,
    /// Delegates to a scheduler library; its algorithm set is opaque.
    External(ExternalScheduler),
}

impl ActiveScheduler {
    /// An external scheduler if one can be loaded, the internal one otherwise.
    pub fn discover(config: &SchedulerConfig) -> Result<Self, Error> {
        match ExternalScheduler::open(&config.scheduler_path) {
            Some(external) => Self::external(external),
            None => Ok(ActiveScheduler::Internal),
        }
    }

    pub fn external(external: ExternalScheduler) -> Result<Self, Error> {
        external.init()?;
        Ok(ActiveScheduler::External(external))
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self, ActiveScheduler::External(_))
    }

    /// Prepares scheduling for `comm`, returns the number of channels it needs.
    pub fn init(
        &self,
        catalog: &mut AlgoCatalog,
        comm: &Communicator,
        config: &SchedulerConfig,
        parser: &dyn AlgoParser,
    ) -> Result<u32, Error> {
        match self {
            ActiveScheduler::Internal => {
                catalog.load_once(config, parser)?;
                Ok(catalog.channels_required(comm.num_ranks))
            }
            ActiveScheduler::External(_) => Ok(MAX_CHANNELS),
        }
    }

    pub fn select(
        &self,
        catalog: &AlgoCatalog,
        store: &AlgoHandleStore,
        param: &SchedulerParam<'_>,
    ) -> Result<Option<AlgoHandle>, Error> {
        match self {
            ActiveScheduler::Internal => {
                let Some(index) = catalog.select(param) else {
                    return Ok(None);
                };
                let handle = store.handle_for(index, param.rank);
                match (handle, catalog.get(index)) {
                    (Some(handle), Some(meta)) => {
                        log::trace!("Algorithm {:?} is selected", meta.file_path);
                        Ok(Some(handle))
                    }
                    _ => {
                        log::warn!(
                            "Algorithm #{} matches {:?} but is not loaded for rank {}",
                            index,
                            param.coll.func,
                            param.rank
                        );
                        Ok(None)
                    }
                }
            }
            ActiveScheduler::External(external) => external.select(param),
        }
    }

    pub fn teardown(self, catalog: &mut AlgoCatalog) -> Result<(), Error> {
        match self {
            ActiveScheduler::Internal => {
                catalog.clear();
                Ok(())
            }
            ActiveScheduler::External(external) => external.teardown(),
        }
    }
}
