use std::collections::BTreeMap;

use crate::comm::{CollectiveInfo, Communicator, RequestPool, TimeRank};
use crate::replay::{RemoteEventInfo, ReplayContext, Result, UserEvent};
use crate::state::{CollectiveKind, EventRef, Timestamp};

use super::{Analysis, Message, payload_mismatch};

/// Tag reserved for delay-analysis exchanges; application tags never reach
/// this value.
pub const DELAY_TAG: u32 = u32::MAX - 1;

const POOL_CAPACITY: usize = 100;

/// Per-rank state of the analysis-metadata channel: outstanding nonblocking
/// sends plus the collective timing aggregates computed during the main
/// pass, which the backward delay pass re-reads.
#[derive(Debug)]
pub struct MpiCommunicationHandler {
    pub pool: RequestPool,
    pub coll_infos: BTreeMap<EventRef, CollectiveInfo>,
}

impl MpiCommunicationHandler {
    pub fn new() -> MpiCommunicationHandler {
        MpiCommunicationHandler {
            pool: RequestPool::new(POOL_CAPACITY),
            coll_infos: BTreeMap::new(),
        }
    }
}

impl Default for MpiCommunicationHandler {
    fn default() -> Self {
        MpiCommunicationHandler::new()
    }
}

/// Main pass, sender side: ship operation timing to the receiver so it can
/// judge whether it waited for us.
pub fn cb_send_meta<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let event = ctx.trace.event(e);
    if event.is_zero_sized() {
        return Ok(());
    }
    let peer = event.peer().unwrap();
    let tag = event.tag().unwrap();
    let info = RemoteEventInfo {
        rank: ctx.trace.rank,
        enter_time: ctx.trace.op_enter_time(e),
        event_time: event.time,
        wait_time: 0.0,
    };
    let req = a.comm.send(peer, tag, Message::Info(info))?;
    a.comm_handler.pool.record(&a.comm, req);
    Ok(())
}

/// Main pass, receiver side: collect the sender's timing and hand it to the
/// late-sender detection.
pub fn cb_recv_meta<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let event = ctx.trace.event(e);
    if event.is_zero_sized() {
        return Ok(());
    }
    let peer = event.peer().unwrap();
    let tag = event.tag().unwrap();
    let Message::Info(info) = a.comm.recv(peer, tag)? else {
        return Err(payload_mismatch(e));
    };
    ctx.remote = Some(info);
    ctx.raise(UserEvent::LateSender);
    Ok(())
}

/// Main pass, collective end: compute the cross-rank timing aggregate via
/// MAXLOC/MINLOC reductions over the communicator, cache it for the
/// backward delay pass, and fan out to the pattern-specific detection.
pub fn cb_coll_end<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let event = ctx.trace.event(e);
    let comm_id = event.comm().unwrap();
    let op = event.collective_op().unwrap();
    let root = event.collective_root();
    let me = ctx.trace.rank;
    let my = TimeRank::new(ctx.trace.op_enter_time(e), me);
    let my_end = TimeRank::new(event.time, me);

    a.ensure_subcomm(ctx.trace, comm_id)?;
    let group = ctx.trace.comm(comm_id)?;
    let sub = &a.subcomms[&comm_id];
    // Whether the operation moved any data must be decided identically on
    // every member; a rank with a zero-byte contribution cannot opt out on
    // its own without desynchronizing the reductions below. Pure
    // synchronization collectives carry no data yet still synchronize.
    if op.kind() != CollectiveKind::Sync {
        let bytes = event.collective_bytes().unwrap();
        let heaviest = sub.allreduce_maxloc(TimeRank::new(Timestamp(bytes as f64), me));
        if heaviest.time.0 == 0.0 {
            return Ok(());
        }
    }
    let latest = sub.allreduce_maxloc(my);
    let earliest = sub.allreduce_minloc(my);
    let earliest_end = sub.allreduce_minloc(my_end);
    let root_tr = match root {
        Some(r) => {
            let local = group
                .local_rank(r)
                .ok_or(crate::comm::CommError::InvalidRank(r))?;
            let contribution = if me == r { Some(Message::Time(my)) } else { None };
            let Message::Time(tr) = sub.broadcast(local, contribution)? else {
                return Err(payload_mismatch(e));
            };
            tr
        }
        None => my,
    };

    let ci = CollectiveInfo {
        my,
        root: root_tr,
        latest,
        earliest,
        earliest_end,
    };
    a.comm_handler.coll_infos.insert(e, ci);
    ctx.coll_info = Some(ci);
    ctx.raise(match op.kind() {
        CollectiveKind::OneToN => UserEvent::Coll12N,
        CollectiveKind::NToOne => UserEvent::CollN21,
        CollectiveKind::NToN => UserEvent::CollN2N,
        CollectiveKind::Sync => UserEvent::SyncColl,
    });
    Ok(())
}

/// Backward wait-state pass, receiver side: report the wait recorded at this
/// receive back to the sender. Roles are reversed relative to the main pass,
/// and so is the scan order, which keeps FIFO matching intact.
pub fn cb_recv_confirm<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let event = ctx.trace.event(e);
    if event.is_zero_sized() {
        return Ok(());
    }
    let peer = event.peer().unwrap();
    let tag = event.tag().unwrap();
    let info = RemoteEventInfo {
        rank: ctx.trace.rank,
        enter_time: ctx.trace.op_enter_time(e),
        event_time: event.time,
        wait_time: a.sph.get_synchpoint_info(e).wait_time,
    };
    let req = a.comm.send(peer, tag, Message::Info(info))?;
    a.comm_handler.pool.record(&a.comm, req);
    Ok(())
}

/// Backward wait-state pass, sender side: learn whether the receiver waited
/// for this send and hand the confirmation to the symmetric synchpoint
/// recording.
pub fn cb_send_confirm<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let event = ctx.trace.event(e);
    if event.is_zero_sized() {
        return Ok(());
    }
    let peer = event.peer().unwrap();
    let tag = event.tag().unwrap();
    let Message::Info(info) = a.comm.recv(peer, tag)? else {
        return Err(payload_mismatch(e));
    };
    ctx.remote = Some(info);
    ctx.raise(UserEvent::LateSenderWs);
    Ok(())
}
