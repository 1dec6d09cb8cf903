use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::param::{CollFunc, SchedulerParam};

pub mod catalog;
pub mod store;

pub const MAX_NUM_ALGOS: usize = 64;
pub const MAX_CHANNELS: u32 = 32;
pub const MAX_NUM_THREAD_BLOCKS: usize = 32 * MAX_CHANNELS as usize;
// one cache-line padded flag per thread block
pub const SYNC_FLAG_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct AlgoHandle(pub u32);

/// Shape and applicability of one algorithm file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgoMeta {
    #[serde(default)]
    pub file_path: PathBuf,
    #[serde(default)]
    pub name: String,
    pub func: CollFunc,
    pub num_ranks: usize,
    pub num_channels: u32,
    pub size_multiplier: usize,
    pub num_chunks_per_loop: usize,
    #[serde(default)]
    pub min_bytes: usize,
    // 0 means no upper bound
    #[serde(default)]
    pub max_bytes: usize,
    pub in_place: bool,
    pub out_of_place: bool,
}

impl AlgoMeta {
    fn message_size_fits(&self, param: &SchedulerParam<'_>) -> bool {
        let count = param.coll.count;
        if count == 0 {
            return false;
        }
        let chunks_aligned = count
            .checked_mul(self.size_multiplier)
            .and_then(|elems| elems.checked_rem(self.num_chunks_per_loop))
            .is_some_and(|rem| rem == 0);
        if !chunks_aligned {
            return false;
        }
        match count
            .checked_mul(param.coll.data_type.count_bytes())
            .and_then(|bytes| bytes.checked_mul(self.size_multiplier))
        {
            Some(num_bytes) => {
                num_bytes >= self.min_bytes && (self.max_bytes == 0 || num_bytes <= self.max_bytes)
            }
            None => false,
        }
    }

    pub fn accepts(&self, param: &SchedulerParam<'_>, in_place: bool) -> bool {
        self.message_size_fits(param)
            && self.num_ranks == param.num_ranks
            && self.func == param.coll.func
            && if in_place { self.in_place } else { self.out_of_place }
    }
}
