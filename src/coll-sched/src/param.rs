use std::borrow::Cow;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum CollFunc {
    Reduce = 0,
    Broadcast = 1,
    AllReduce = 2,
    ReduceScatter = 3,
    AllGather = 4,
    Send = 5,
    Recv = 6,
    Gather = 7,
    Scatter = 8,
    AllToAll = 9,
    AllToAllv = 10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DataType {
    Int8 = 0,
    Uint8 = 1,
    Int32 = 2,
    Uint32 = 3,
    Int64 = 4,
    Uint64 = 5,
    Float16 = 6,
    Float32 = 7,
    Float64 = 8,
    Bfloat16 = 9,
}

impl DataType {
    pub fn count_bytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Float16 | DataType::Bfloat16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReduceOp {
    Sum = 0,
    Prod = 1,
    Max = 2,
    Min = 3,
    Avg = 4,
    PreMulSum = 5,
    SumPostDiv = 6,
}

impl ReduceOp {
    /// Averages and scaled sums need pre/post processing around the reduction.
    #[inline]
    pub fn is_pointwise(&self) -> bool {
        matches!(
            self,
            ReduceOp::Sum | ReduceOp::Prod | ReduceOp::Max | ReduceOp::Min
        )
    }
}

/// Address of a device buffer. Only compared and offset, never dereferenced here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DevicePtr(pub usize);

impl DevicePtr {
    #[inline]
    pub const fn null() -> Self {
        DevicePtr(0)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    #[inline]
    pub fn byte_add(self, bytes: usize) -> Self {
        DevicePtr(self.0.wrapping_add(bytes))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StreamHandle(pub usize);

/// Per-peer counts and displacements of a variable-count all-to-all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarCounts<'a> {
    pub send_counts: Cow<'a, [usize]>,
    pub send_displs: Cow<'a, [usize]>,
    pub recv_counts: Cow<'a, [usize]>,
    pub recv_displs: Cow<'a, [usize]>,
}

impl<'a> VarCounts<'a> {
    pub fn borrowed(
        send_counts: &'a [usize],
        send_displs: &'a [usize],
        recv_counts: &'a [usize],
        recv_displs: &'a [usize],
    ) -> Self {
        VarCounts {
            send_counts: Cow::Borrowed(send_counts),
            send_displs: Cow::Borrowed(send_displs),
            recv_counts: Cow::Borrowed(recv_counts),
            recv_displs: Cow::Borrowed(recv_displs),
        }
    }

    pub fn into_owned(self) -> VarCounts<'static> {
        VarCounts {
            send_counts: Cow::Owned(self.send_counts.into_owned()),
            send_displs: Cow::Owned(self.send_displs.into_owned()),
            recv_counts: Cow::Owned(self.recv_counts.into_owned()),
            recv_displs: Cow::Owned(self.recv_displs.into_owned()),
        }
    }

    fn shortest(&self) -> usize {
        [
            self.send_counts.len(),
            self.send_displs.len(),
            self.recv_counts.len(),
            self.recv_displs.len(),
        ]
        .into_iter()
        .min()
        .unwrap_or(0)
    }
}

/// The full parameter set of one collective call as issued by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollOp<'a> {
    pub func: CollFunc,
    pub send_buf: DevicePtr,
    pub recv_buf: DevicePtr,
    pub var_counts: Option<VarCounts<'a>>,
    pub count: usize,
    pub data_type: DataType,
    pub root: usize,
    pub peer: usize,
    pub op: ReduceOp,
}

impl<'a> CollOp<'a> {
    fn new(
        func: CollFunc,
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
    ) -> Self {
        CollOp {
            func,
            send_buf,
            recv_buf,
            var_counts: None,
            count,
            data_type,
            root: 0,
            peer: 0,
            op: ReduceOp::Sum,
        }
    }

    pub fn reduce(
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        op: ReduceOp,
        root: usize,
    ) -> Self {
        CollOp {
            op,
            root,
            ..Self::new(CollFunc::Reduce, send_buf, recv_buf, count, data_type)
        }
    }

    pub fn broadcast(
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        root: usize,
    ) -> Self {
        CollOp {
            root,
            ..Self::new(CollFunc::Broadcast, send_buf, recv_buf, count, data_type)
        }
    }

    pub fn all_reduce(
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        op: ReduceOp,
    ) -> Self {
        CollOp {
            op,
            ..Self::new(CollFunc::AllReduce, send_buf, recv_buf, count, data_type)
        }
    }

    pub fn reduce_scatter(
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        op: ReduceOp,
    ) -> Self {
        CollOp {
            op,
            ..Self::new(CollFunc::ReduceScatter, send_buf, recv_buf, count, data_type)
        }
    }

    pub fn all_gather(
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
    ) -> Self {
        Self::new(CollFunc::AllGather, send_buf, recv_buf, count, data_type)
    }

    pub fn send(send_buf: DevicePtr, count: usize, data_type: DataType, peer: usize) -> Self {
        CollOp {
            peer,
            ..Self::new(CollFunc::Send, send_buf, DevicePtr::null(), count, data_type)
        }
    }

    pub fn recv(recv_buf: DevicePtr, count: usize, data_type: DataType, peer: usize) -> Self {
        CollOp {
            peer,
            ..Self::new(CollFunc::Recv, DevicePtr::null(), recv_buf, count, data_type)
        }
    }

    pub fn gather(
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        root: usize,
    ) -> Self {
        CollOp {
            root,
            ..Self::new(CollFunc::Gather, send_buf, recv_buf, count, data_type)
        }
    }

    pub fn scatter(
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
        root: usize,
    ) -> Self {
        CollOp {
            root,
            ..Self::new(CollFunc::Scatter, send_buf, recv_buf, count, data_type)
        }
    }

    pub fn all_to_all(
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        count: usize,
        data_type: DataType,
    ) -> Self {
        Self::new(CollFunc::AllToAll, send_buf, recv_buf, count, data_type)
    }

    pub fn all_to_allv(
        send_buf: DevicePtr,
        recv_buf: DevicePtr,
        var_counts: VarCounts<'a>,
        data_type: DataType,
    ) -> Self {
        CollOp {
            var_counts: Some(var_counts),
            ..Self::new(CollFunc::AllToAllv, send_buf, recv_buf, 0, data_type)
        }
    }

    pub fn into_owned(self) -> CollOp<'static> {
        CollOp {
            func: self.func,
            send_buf: self.send_buf,
            recv_buf: self.recv_buf,
            var_counts: self.var_counts.map(VarCounts::into_owned),
            count: self.count,
            data_type: self.data_type,
            root: self.root,
            peer: self.peer,
            op: self.op,
        }
    }
}

/// A collective call bound to the issuing rank, as seen by a scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerParam<'a> {
    pub coll: CollOp<'a>,
    pub rank: usize,
    pub num_ranks: usize,
}

impl<'a> SchedulerParam<'a> {
    pub fn new(coll: CollOp<'a>, rank: usize, num_ranks: usize) -> Self {
        SchedulerParam {
            coll,
            rank,
            num_ranks,
        }
    }

    /// Copies any caller-owned count and displacement arrays so the
    /// parameters can outlive the enqueue call.
    pub fn into_owned(self) -> SchedulerParam<'static> {
        SchedulerParam {
            coll: self.coll.into_owned(),
            rank: self.rank,
            num_ranks: self.num_ranks,
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(var_counts) = &self.coll.var_counts {
            if var_counts.shortest() < self.num_ranks {
                return Err(crate::Error::InvalidUsage(format!(
                    "{:?} needs {} counts and displacements per direction, got {}",
                    self.coll.func,
                    self.num_ranks,
                    var_counts.shortest()
                )));
            }
        }
        Ok(())
    }

    /// Whether input and output alias in the way the collective defines in-place.
    ///
    /// A rank offset that does not fit in the address space is out-of-place.
    pub fn is_in_place(&self) -> bool {
        let coll = &self.coll;
        let rank_offset = self
            .rank
            .checked_mul(coll.count)
            .and_then(|elems| elems.checked_mul(coll.data_type.count_bytes()));
        match coll.func {
            CollFunc::Reduce | CollFunc::Broadcast | CollFunc::AllReduce | CollFunc::AllToAll => {
                coll.send_buf == coll.recv_buf
            }
            CollFunc::AllGather | CollFunc::Gather => {
                rank_offset.is_some_and(|off| coll.send_buf == coll.recv_buf.byte_add(off))
            }
            CollFunc::ReduceScatter | CollFunc::Scatter => {
                rank_offset.is_some_and(|off| coll.recv_buf == coll.send_buf.byte_add(off))
            }
            CollFunc::Send | CollFunc::Recv | CollFunc::AllToAllv => false,
        }
    }
}
