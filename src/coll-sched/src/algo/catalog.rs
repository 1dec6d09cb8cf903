use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::AlgoMeta;
use crate::config::SchedulerConfig;
use crate::param::SchedulerParam;
use crate::registry::AlgoParser;
use crate::Error;

/// Algorithm metadata in load order, which is sorted file path order.
#[derive(Default)]
pub struct AlgoCatalog {
    metas: Vec<AlgoMeta>,
    loaded: bool,
}

impl AlgoCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn from_metas(metas: Vec<AlgoMeta>) -> Self {
        AlgoCatalog { metas, loaded: true }
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[inline]
    pub fn metas(&self) -> &[AlgoMeta] {
        &self.metas
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&AlgoMeta> {
        self.metas.get(index)
    }

    /// Discovers and parses the algorithm directory unless already done.
    pub fn load_once(
        &mut self,
        config: &SchedulerConfig,
        parser: &dyn AlgoParser,
    ) -> Result<(), Error> {
        if self.loaded {
            return Ok(());
        }
        let dir = find_algo_dir(config)?;
        log::info!("Using algorithm files from {:?}", dir);
        let mut metas = Vec::new();
        for path in sorted_algo_files(&dir)? {
            let mut meta = parser.parse(&path).map_err(|source| Error::Parse {
                path: path.clone(),
                source,
            })?;
            meta.file_path = path;
            metas.push(meta);
        }
        log::debug!("Loaded {} algorithm files", metas.len());
        self.metas = metas;
        self.loaded = true;
        Ok(())
    }

    pub fn channels_required(&self, num_ranks: usize) -> u32 {
        self.metas
            .iter()
            .filter(|m| m.num_ranks == num_ranks)
            .map(|m| m.num_channels)
            .max()
            .unwrap_or(0)
    }

    /// Index of the first entry able to run `param`.
    pub fn select(&self, param: &SchedulerParam<'_>) -> Option<usize> {
        if !param.coll.op.is_pointwise() {
            return None;
        }
        let in_place = param.is_in_place();
        self.metas
            .iter()
            .position(|m| m.accepts(param, in_place))
    }

    pub fn clear(&mut self) {
        self.metas.clear();
        self.loaded = false;
    }
}

fn find_algo_dir(config: &SchedulerConfig) -> Result<PathBuf, Error> {
    let candidates = config.algo_dir_candidates();
    for dir in &candidates {
        match fs::read_dir(dir) {
            Ok(_) => return Ok(dir.clone()),
            Err(e) => log::debug!("Algorithm directory {:?} unavailable: {}", dir, e),
        }
    }
    log::warn!("No algorithm directory found, tried {:?}", candidates);
    Err(Error::AlgoDirNotFound(candidates))
}

// regular files and symlinks only
fn sorted_algo_files(dir: &Path) -> Result<BTreeSet<PathBuf>, Error> {
    let read_err = |e| Error::AlgoDirRead(dir.to_path_buf(), e);
    let mut paths = BTreeSet::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let file_type = entry.file_type().map_err(read_err)?;
        if file_type.is_file() || file_type.is_symlink() {
            paths.insert(entry.path());
        }
    }
    Ok(paths)
}
