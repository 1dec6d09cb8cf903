use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommunicatorId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub host_hash: u64,
    pub pid_hash: u64,
}

/// View of a communicator owned by the surrounding runtime.
pub struct Communicator {
    pub id: CommunicatorId,
    pub rank: usize,
    pub num_ranks: usize,
    // ranks of this communicator driven by the same process
    pub intra_ranks: usize,
    pub cuda_arch: u32,
    pub peers_info: Vec<PeerInfo>,
    algo_compatible: AtomicBool,
}

impl Communicator {
    pub fn new(id: CommunicatorId, rank: usize, peers_info: Vec<PeerInfo>) -> Self {
        Communicator {
            id,
            rank,
            num_ranks: peers_info.len(),
            intra_ranks: 1,
            cuda_arch: 0,
            peers_info,
            algo_compatible: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn algo_compatible(&self) -> bool {
        self.algo_compatible.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_algo_compatible(&self, compatible: bool) {
        self.algo_compatible.store(compatible, Ordering::Release);
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("num_ranks", &self.num_ranks)
            .field("algo_compatible", &self.algo_compatible())
            .finish()
    }
}

/// Two ranks sharing both host and process cannot run custom algorithms.
pub fn ranks_compatible(peers_info: &[PeerInfo]) -> bool {
    let mut host_to_pids: HashMap<u64, HashSet<u64>> = HashMap::new();
    for peer in peers_info {
        if !host_to_pids
            .entry(peer.host_hash)
            .or_default()
            .insert(peer.pid_hash)
        {
            return false;
        }
    }
    true
}
