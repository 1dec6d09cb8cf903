use crate::comm::Communicator;
use crate::group::{CallerGuard, SavedOp};
use crate::param::{CollFunc, SchedulerParam, StreamHandle};
use crate::registry::FallbackCollectives;
use crate::Error;

/// Runs one operation on the plain collective of its kind.
pub fn dispatch(
    fallback: &dyn FallbackCollectives,
    param: &SchedulerParam<'_>,
    comm: &Communicator,
    stream: StreamHandle,
) -> Result<(), Error> {
    let c = &param.coll;
    let (send, recv, count, dt) = (c.send_buf, c.recv_buf, c.count, c.data_type);
    match c.func {
        CollFunc::Reduce => fallback.reduce(send, recv, count, dt, c.op, c.root, comm, stream)?,
        CollFunc::Broadcast => fallback.broadcast(send, recv, count, dt, c.root, comm, stream)?,
        CollFunc::AllReduce => fallback.all_reduce(send, recv, count, dt, c.op, comm, stream)?,
        CollFunc::ReduceScatter => {
            fallback.reduce_scatter(send, recv, count, dt, c.op, comm, stream)?
        }
        CollFunc::AllGather => fallback.all_gather(send, recv, count, dt, comm, stream)?,
        CollFunc::Send => fallback.send(send, count, dt, c.peer, comm, stream)?,
        CollFunc::Recv => fallback.recv(recv, count, dt, c.peer, comm, stream)?,
        CollFunc::AllToAll => fallback.all_to_all(send, recv, count, dt, comm, stream)?,
        CollFunc::Gather | CollFunc::Scatter | CollFunc::AllToAllv => {
            log::warn!("No plain collective for {:?} in buffered operations", c.func);
            return Err(Error::NoFallback(c.func));
        }
    }
    Ok(())
}

/// Falls back the buffered operations in order, then `current` if given.
/// The caller marker is held for the whole batch.
pub(crate) fn fall_back(
    fallback: &dyn FallbackCollectives,
    saved: Vec<SavedOp>,
    current: Option<(&SchedulerParam<'_>, &Communicator, StreamHandle)>,
) -> Result<(), Error> {
    let _guard = CallerGuard::new();
    for op in &saved {
        dispatch(fallback, &op.param, &op.comm, op.stream)?;
    }
    if let Some((param, comm, stream)) = current {
        dispatch(fallback, param, comm, stream)?;
    }
    Ok(())
}
