//! Multi-pass replay analysis: wait-state detection, synchpoint refinement,
//! and delay-cost propagation over one rank's trace, coordinated with the
//! other ranks through a [`Communicator`].

pub mod communication;
pub mod delay;
pub mod synchpoint;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use log::{debug, info};

use crate::comm::{Communicator, TimeRank};
use crate::replay::{
    CallbackManager, RemoteEventInfo, ReplayError, Result, Stage, UserEvent, replay,
};
use crate::report::AnalysisReport;
use crate::state::{CallpathId, CommId, EventKind, EventRef, LocationId, Timestamp, Trace};
use crate::team::TeamContext;

use self::communication::MpiCommunicationHandler;
use self::delay::DelayState;
use self::synchpoint::{SynchpointHandler, TeamAnalysis};

/// Payloads of the analysis-metadata channel between ranks.
#[derive(Debug, Clone)]
pub enum Message {
    Time(TimeRank),
    Info(RemoteEventInfo),
    TimeMap {
        ids: Vec<CallpathId>,
        values: Vec<f64>,
        prop_wait: f64,
    },
    Contribution {
        ids: Vec<CallpathId>,
        metric_values: Vec<Vec<f64>>,
        scales: Vec<f64>,
    },
    Scales(Vec<f64>),
}

pub(crate) fn payload_mismatch(e: EventRef) -> ReplayError {
    ReplayError::Message(format!("unexpected analysis payload at event {}", e))
}

/// One rank's analysis state, threaded through every replay stage. Fields
/// are public so the stage callbacks, which are plain functions, can borrow
/// them independently.
pub struct Analysis<C> {
    pub comm: C,
    pub subcomms: BTreeMap<CommId, C>,
    pub sph: SynchpointHandler,
    pub comm_handler: MpiCommunicationHandler,
    pub delay: DelayState,
    pub report: AnalysisReport,
    /// Timestamp of the previous synchpoint seen by the refinement pass.
    pub fws_last_sp: Option<Timestamp>,
}

impl<C: Communicator<Message>> Analysis<C> {
    pub fn new(comm: C, nprocs: u32) -> Analysis<C> {
        Analysis {
            comm,
            subcomms: BTreeMap::new(),
            sph: SynchpointHandler::new(nprocs),
            comm_handler: MpiCommunicationHandler::new(),
            delay: DelayState::default(),
            report: AnalysisReport::default(),
            fws_last_sp: None,
        }
    }

    /// Split off (or reuse) the sub-communicator mirroring a trace-defined
    /// communicator group. Every member reaches this at the same collective
    /// event of the main pass, so creation is symmetric.
    pub(crate) fn ensure_subcomm(&mut self, trace: &Trace, id: CommId) -> Result<()> {
        if !self.subcomms.contains_key(&id) {
            let members = trace.comm(id)?.members().to_vec();
            let sub = self.comm.split(members)?;
            self.subcomms.insert(id, sub);
        }
        Ok(())
    }

    /// Run the whole pipeline over this rank's trace. The trace is
    /// validated first; no stage runs on a structurally broken log.
    pub fn run(&mut self, trace: &mut Trace) -> Result<()> {
        trace.validate()?;
        team_prepass(trace, &mut self.sph)?;
        for stage in Stage::PIPELINE {
            debug!("rank {}: starting {} pass", trace.rank, stage);
            let manager = build_manager::<C>(stage);
            if stage == Stage::FwdPropagating {
                // No communication in this pass, so worker locations can be
                // swept as well.
                for l in 0..trace.num_locations() {
                    replay(self, trace, LocationId(l), stage, &manager)?;
                }
            } else {
                replay(self, trace, LocationId(0), stage, &manager)?;
            }
            // Settle before cancelling residue: a message cancelled while
            // its receiver is still replaying would deadlock the receiver.
            self.comm.barrier();
            self.comm_handler.pool.finalize(&self.comm);
        }
        info!(
            "rank {}: analysis complete, {} synchpoint(s), total wait {:.6}s",
            trace.rank,
            self.sph.get_synchpoints_between(None, None).len(),
            self.report.total_wait
        );
        Ok(())
    }
}

/// Validate and analyze one rank's trace, returning its report.
pub fn run_analysis<C: Communicator<Message>>(
    trace: &mut Trace,
    comm: C,
) -> Result<AnalysisReport> {
    let mut analysis = Analysis::new(comm, trace.nprocs);
    analysis.run(trace)?;
    Ok(analysis.report)
}

fn build_manager<C: Communicator<Message>>(stage: Stage) -> CallbackManager<Analysis<C>> {
    let mut m = CallbackManager::new();
    match stage {
        Stage::Main => {
            m.on_event(EventKind::Send, communication::cb_send_meta::<C>);
            m.on_event(EventKind::SendRequest, communication::cb_send_meta::<C>);
            m.on_event(EventKind::Recv, communication::cb_recv_meta::<C>);
            m.on_event(EventKind::RecvComplete, communication::cb_recv_meta::<C>);
            m.on_event(EventKind::CollEnd, communication::cb_coll_end::<C>);
            m.on_user(UserEvent::Coll12N, synchpoint::cb_coll_12n::<C>);
            m.on_user(UserEvent::CollN21, synchpoint::cb_coll_n21::<C>);
            m.on_user(UserEvent::CollN2N, synchpoint::cb_coll_n2n::<C>);
            m.on_user(UserEvent::SyncColl, synchpoint::cb_sync_coll::<C>);
            m.on_user(UserEvent::LateSender, synchpoint::cb_late_sender::<C>);
        }
        Stage::BwdWaitState => {
            m.on_event(EventKind::Recv, communication::cb_recv_confirm::<C>);
            m.on_event(EventKind::RecvComplete, communication::cb_recv_confirm::<C>);
            m.on_event(EventKind::Send, communication::cb_send_confirm::<C>);
            m.on_event(EventKind::SendRequest, communication::cb_send_confirm::<C>);
            m.on_user(UserEvent::LateSenderWs, synchpoint::cb_late_sender_ws::<C>);
        }
        Stage::FwdSynchpoint => {
            for kind in [
                EventKind::Send,
                EventKind::SendRequest,
                EventKind::Recv,
                EventKind::RecvComplete,
                EventKind::CollEnd,
            ] {
                m.on_event(kind, synchpoint::cb_refine::<C>);
            }
        }
        Stage::BwdDelay => {
            m.on_event(EventKind::CollEnd, delay::cb_trigger_delay_collective::<C>);
            m.on_user(UserEvent::DelayCollective, delay::cb_delay_collective::<C>);
            m.on_event(EventKind::Send, delay::cb_trigger_delay_send::<C>);
            m.on_event(EventKind::SendRequest, delay::cb_trigger_delay_send::<C>);
            m.on_user(UserEvent::DelayLateSender, delay::cb_delay_send::<C>);
            m.on_event(EventKind::Recv, delay::cb_delay_recv::<C>);
            m.on_event(EventKind::RecvComplete, delay::cb_delay_recv::<C>);
        }
        Stage::FwdPropagating => {
            for kind in [
                EventKind::Send,
                EventKind::SendRequest,
                EventKind::Recv,
                EventKind::RecvComplete,
                EventKind::CollEnd,
                EventKind::ThreadFork,
                EventKind::ThreadJoin,
                EventKind::ThreadTeamBegin,
                EventKind::ThreadTeamEnd,
            ] {
                m.on_event(kind, delay::cb_accumulate_wait::<C>);
            }
        }
    }
    m
}

/// Thread-team wait-state detection, run before the MPI stages. One scoped
/// thread per location replays that location's log; the per-location results
/// are folded into the rank-wide accumulation maps afterwards.
fn team_prepass(trace: &Trace, sph: &mut SynchpointHandler) -> Result<()> {
    let nlocs = trace.num_locations();
    if nlocs <= 1 {
        return Ok(());
    }
    debug!(
        "rank {}: thread-team pre-pass over {} locations",
        trace.rank, nlocs
    );
    let team = Arc::new(TeamContext::new(nlocs));
    let mut manager = CallbackManager::new();
    manager.on_event(EventKind::ThreadFork, synchpoint::cb_thread_fork);
    manager.on_event(EventKind::ThreadJoin, synchpoint::cb_thread_join);
    manager.on_event(EventKind::ThreadTeamBegin, synchpoint::cb_team_sync);
    manager.on_event(EventKind::ThreadTeamEnd, synchpoint::cb_team_sync);
    let manager = &manager;
    let results: Vec<Result<SynchpointHandler>> = thread::scope(|s| {
        let handles: Vec<_> = (0..nlocs)
            .map(|l| {
                let team = Arc::clone(&team);
                s.spawn(move || {
                    let mut a = TeamAnalysis {
                        rank: trace.rank,
                        nprocs: trace.nprocs,
                        team,
                        sph: SynchpointHandler::new(trace.nprocs),
                    };
                    replay(&mut a, trace, LocationId(l), Stage::Main, manager)?;
                    Ok(a.sph)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for result in results {
        sph.absorb(result?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::delay::{METRIC_PROP_WAIT, METRIC_WAIT_TIME};
    use crate::comm::LocalComm;
    use crate::state::{
        CollectiveOp, Event, Payload, Rank, RegionId, Timestamp,
    };

    fn enter(t: f64, region: u64) -> Event {
        Event::new(
            EventKind::Enter,
            Timestamp(t),
            Payload::Region {
                region: RegionId(region),
                callsite: None,
            },
        )
    }

    fn leave(t: f64, region: u64) -> Event {
        Event::new(
            EventKind::Leave,
            Timestamp(t),
            Payload::Region {
                region: RegionId(region),
                callsite: None,
            },
        )
    }

    fn coll(kind: EventKind, t: f64, op: CollectiveOp, root: Option<Rank>, bytes: u64) -> Event {
        coll_on(0, kind, t, op, root, bytes)
    }

    fn coll_on(
        comm: u32,
        kind: EventKind,
        t: f64,
        op: CollectiveOp,
        root: Option<Rank>,
        bytes: u64,
    ) -> Event {
        Event::new(
            kind,
            Timestamp(t),
            Payload::Collective {
                comm: CommId(comm),
                op,
                root,
                bytes_sent: bytes,
                bytes_recvd: bytes,
            },
        )
    }

    fn p2p(kind: EventKind, t: f64, peer: u32, tag: u32) -> Event {
        Event::new(
            kind,
            Timestamp(t),
            Payload::P2p {
                peer: Rank(peer),
                tag,
                comm: CommId(0),
                bytes: 64,
                request: None,
            },
        )
    }

    fn world_trace(rank: u32, nprocs: u32) -> Trace {
        let mut trace = Trace::new(Rank(rank), nprocs);
        trace.define_comm(CommId(0), (0..nprocs).map(Rank).collect());
        trace
    }

    /// Common prologue: main region enter plus the initial global
    /// synchronization ending at t=1.
    fn prologue() -> Vec<Event> {
        vec![
            enter(0.0, 1),
            enter(0.0, 2),
            coll(EventKind::CollBegin, 0.0, CollectiveOp::Init, None, 0),
            coll(EventKind::CollEnd, 1.0, CollectiveOp::Init, None, 0),
            leave(1.0, 2),
        ]
    }

    fn run_world(traces: Vec<Trace>) -> Vec<(Trace, Analysis<LocalComm<Message>>)> {
        let _ = env_logger::builder().is_test(true).try_init();
        let nprocs = traces.len() as u32;
        let comms = LocalComm::world(nprocs);
        let handles: Vec<_> = traces
            .into_iter()
            .zip(comms)
            .map(|(mut trace, comm)| {
                thread::spawn(move || {
                    let mut analysis = Analysis::new(comm, trace.nprocs);
                    analysis.run(&mut trace).unwrap();
                    (trace, analysis)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn at(index: u32) -> EventRef {
        EventRef::new(LocationId(0), index)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_barrier_wait_states_and_delay() {
        // Four ranks compute for different durations, then hit a barrier
        // everyone leaves at t=8. Expected waits: 5, 4, 3, 0.
        let compute_ends = [3.0, 4.0, 5.0, 8.0];
        let traces = (0..4u32)
            .map(|r| {
                let mut trace = world_trace(r, 4);
                let end = compute_ends[r as usize];
                let mut events = prologue();
                events.extend([
                    enter(1.0, 3), // compute
                    leave(end, 3),
                    enter(end, 4), // barrier
                    coll(EventKind::CollBegin, end, CollectiveOp::Barrier, None, 0),
                    coll(EventKind::CollEnd, 8.0, CollectiveOp::Barrier, None, 0),
                    leave(8.0, 4),
                    leave(8.5, 1),
                ]);
                trace.add_location(events);
                trace
            })
            .collect();
        let results = run_world(traces);

        let expected = [5.0, 4.0, 3.0, 0.0];
        let barrier = at(9);
        for (r, (trace, analysis)) in results.iter().enumerate() {
            let info = analysis.sph.get_synchpoint_info(barrier);
            assert!(close(info.wait_time, expected[r]), "rank {}", r);
            // Everyone synchronized with everyone
            assert_eq!(analysis.sph.rank_set(barrier).unwrap().count(), 4);
            assert!(close(analysis.report.total_wait, expected[r]));
            // Refinement filled in total and completion times
            assert!(close(info.total_time, 7.0));
            let op_enter = trace.op_enter_time(barrier);
            assert!(close(info.completion_time, 8.0 - op_enter.0 - info.wait_time));
        }

        // Rank 3 entered last and is the delay root: the barrier waits of
        // the other ranks are charged to its compute call path.
        let (trace3, analysis3) = &results[3];
        let cp_compute = trace3.event(at(5)).callpath.unwrap();
        let costs = &analysis3.report.delay_costs[&METRIC_WAIT_TIME];
        assert_eq!(costs.len(), 1);
        assert!(close(costs[&cp_compute], 12.0));
        // No later waits existed, so nothing propagates
        assert!(!analysis3.report.delay_costs.contains_key(&METRIC_PROP_WAIT));
        // All three waiters resolved at the initial synchronization and
        // contributed their full wait (scale 1)
        let init_sp = at(3);
        assert!(close(
            analysis3.report.sum_scales[&METRIC_WAIT_TIME][&init_sp],
            3.0
        ));
        assert!(close(
            analysis3.report.max_scales[&METRIC_WAIT_TIME][&init_sp],
            1.0
        ));
        // Non-root ranks collected no delay costs
        assert!(results[0].1.report.delay_costs.is_empty());
    }

    #[test]
    fn test_bcast_late_root() {
        // The broadcast root enters at t=5, the other rank at t=2; both
        // leave at t=5.5. The early rank waited 3s for the root.
        let compute_ends = [5.0, 2.0];
        let traces = (0..2u32)
            .map(|r| {
                let mut trace = world_trace(r, 2);
                let end = compute_ends[r as usize];
                let mut events = prologue();
                events.extend([
                    enter(1.0, 3), // compute
                    leave(end, 3),
                    enter(end, 4), // bcast
                    coll(EventKind::CollBegin, end, CollectiveOp::Bcast, Some(Rank(0)), 8),
                    coll(EventKind::CollEnd, 5.5, CollectiveOp::Bcast, Some(Rank(0)), 8),
                    leave(5.5, 4),
                    leave(6.0, 1),
                ]);
                trace.add_location(events);
                trace
            })
            .collect();
        let results = run_world(traces);

        let bcast = at(9);
        let (_, a0) = &results[0];
        let (_, a1) = &results[1];
        // Symmetric records: the root knows who waited for it, the waiter
        // knows whom it waited for
        let info1 = a1.sph.get_synchpoint_info(bcast);
        assert!(close(info1.wait_time, 3.0));
        assert!(a1.sph.rank_set(bcast).unwrap().contains(Rank(0)));
        let info0 = a0.sph.get_synchpoint_info(bcast);
        assert!(close(info0.wait_time, 0.0));
        assert!(a0.sph.rank_set(bcast).unwrap().contains(Rank(1)));

        // Delay conservation: the root's compute phase is charged exactly
        // the wait it caused
        let cp_compute = results[0].0.event(at(5)).callpath.unwrap();
        let costs = &a0.report.delay_costs[&METRIC_WAIT_TIME];
        let total: f64 = costs.values().sum();
        assert!(close(total, 3.0));
        assert!(close(costs[&cp_compute], 3.0));
    }

    #[test]
    fn test_late_sender() {
        // Sender computes until t=5 and sends at t=6; the receiver posts
        // its receive at t=2 and waits 3s for the sender's entry.
        let mut sender = world_trace(0, 2);
        let mut events = prologue();
        events.extend([
            enter(1.0, 3),
            leave(5.0, 3),
            enter(5.0, 4), // send
            p2p(EventKind::Send, 6.0, 1, 7),
            leave(6.0, 4),
            leave(6.5, 1),
        ]);
        sender.add_location(events);
        let mut receiver = world_trace(1, 2);
        let mut events = prologue();
        events.extend([
            enter(1.0, 3),
            leave(2.0, 3),
            enter(2.0, 5), // recv
            p2p(EventKind::Recv, 6.2, 0, 7),
            leave(6.2, 5),
            leave(6.5, 1),
        ]);
        receiver.add_location(events);
        let results = run_world(vec![sender, receiver]);

        let xfer = at(8);
        let (trace0, a0) = &results[0];
        let (_, a1) = &results[1];
        let info1 = a1.sph.get_synchpoint_info(xfer);
        assert!(close(info1.wait_time, 3.0));
        assert!(a1.sph.rank_set(xfer).unwrap().contains(Rank(0)));
        // Confirmed on the sender side during the backward pass
        assert!(a0.sph.is_synchpoint(xfer));
        assert!(!a0.sph.is_waitstate(xfer));
        assert!(a0.sph.rank_set(xfer).unwrap().contains(Rank(1)));

        // The receiver's wait is charged to the sender's compute phase
        let cp_compute = trace0.event(at(5)).callpath.unwrap();
        let costs = &a0.report.delay_costs[&METRIC_WAIT_TIME];
        assert!(close(costs[&cp_compute], 3.0));
        assert!(close(a0.report.sum_scales[&METRIC_WAIT_TIME][&at(3)], 1.0));

        assert!(close(a1.report.total_wait, 3.0));
        assert!(close(a0.report.total_wait, 0.0));
        // Refinement on the receiver: total spans back to the initial
        // synchronization, completion is transfer time past the wait
        let info1 = a1.sph.get_synchpoint_info(xfer);
        assert!(close(info1.total_time, 5.2));
        assert!(close(info1.completion_time, 1.2));
    }

    #[test]
    fn test_late_receiver() {
        // The sender's blocking send starts at t=2 but the receiver only
        // posts its receive at t=5.5; the wait lands on the sender.
        let mut sender = world_trace(0, 2);
        let mut events = prologue();
        events.extend([
            enter(1.0, 3),
            leave(2.0, 3),
            enter(2.0, 4), // send
            p2p(EventKind::Send, 6.0, 1, 7),
            leave(6.0, 4),
            leave(6.5, 1),
        ]);
        sender.add_location(events);
        let mut receiver = world_trace(1, 2);
        let mut events = prologue();
        events.extend([
            enter(1.0, 3),
            leave(5.5, 3),
            enter(5.5, 5), // recv
            p2p(EventKind::Recv, 6.0, 0, 7),
            leave(6.0, 5),
            leave(6.5, 1),
        ]);
        receiver.add_location(events);
        let results = run_world(vec![sender, receiver]);

        let xfer = at(8);
        let (_, a0) = &results[0];
        let (_, a1) = &results[1];
        let info0 = a0.sph.get_synchpoint_info(xfer);
        assert!(close(info0.wait_time, 3.5));
        assert!(a0.sph.rank_set(xfer).unwrap().contains(Rank(1)));
        // The receiver never waited and records nothing
        assert!(!a1.sph.is_synchpoint(xfer));
        assert!(close(a0.report.total_wait, 3.5));
        assert!(close(a1.report.total_wait, 0.0));
        // No delay exchange ran for this pair
        assert!(a0.report.delay_costs.is_empty());
        assert!(a1.report.delay_costs.is_empty());
    }

    #[test]
    fn test_thread_team_waits() {
        // One rank, two locations. The master forks at t=1.5 after entering
        // the parallel region at t=1; the worker enters at t=2, so the
        // master idles 1s at team begin.
        let mut trace = world_trace(0, 1);
        trace.add_location(vec![
            enter(0.0, 1),
            enter(1.0, 6), // parallel region
            Event::new(
                EventKind::ThreadFork,
                Timestamp(1.5),
                Payload::ThreadTeam { team_size: 2 },
            ),
            Event::new(
                EventKind::ThreadTeamBegin,
                Timestamp(1.5),
                Payload::ThreadTeam { team_size: 2 },
            ),
            Event::new(
                EventKind::ThreadTeamEnd,
                Timestamp(4.0),
                Payload::ThreadTeam { team_size: 2 },
            ),
            Event::new(
                EventKind::ThreadJoin,
                Timestamp(4.5),
                Payload::ThreadTeam { team_size: 2 },
            ),
            leave(5.0, 6),
            leave(6.0, 1),
        ]);
        trace.add_location(vec![
            enter(2.0, 6),
            Event::new(
                EventKind::ThreadTeamBegin,
                Timestamp(2.0),
                Payload::ThreadTeam { team_size: 2 },
            ),
            Event::new(
                EventKind::ThreadTeamEnd,
                Timestamp(4.0),
                Payload::ThreadTeam { team_size: 2 },
            ),
            leave(4.0, 6),
        ]);
        let mut results = run_world(vec![trace]);
        let (trace, analysis) = results.remove(0);

        // Master: 0.5s fork overhead, 1s at team begin, join wait measured
        // from the region entry
        let fork = EventRef::new(LocationId(0), 2);
        let begin = EventRef::new(LocationId(0), 3);
        let join = EventRef::new(LocationId(0), 5);
        assert!(close(analysis.sph.get_synchpoint_info(fork).wait_time, 0.5));
        assert!(close(analysis.sph.get_synchpoint_info(begin).wait_time, 1.0));
        assert!(close(analysis.sph.get_synchpoint_info(join).wait_time, 3.5));
        // The worker never waited
        assert!(!analysis.sph.is_synchpoint(EventRef::new(LocationId(1), 1)));

        let cp_par = trace.event(EventRef::new(LocationId(0), 1)).callpath.unwrap();
        assert!(close(analysis.report.total_wait, 5.0));
        assert!(close(analysis.report.wait_costs[&cp_par], 5.0));
    }

    #[test]
    fn test_reduce_partial_synchronization() {
        // A reduce where the root enters before the latest rank but the
        // earliest rank has already left: only the root/latest pair
        // synchronizes.
        let compute_ends = [2.0, 3.0, 7.0];
        let coll_ends = [2.5, 7.5, 7.5];
        let traces = (0..3u32)
            .map(|r| {
                let mut trace = world_trace(r, 3);
                let end = compute_ends[r as usize];
                let mut events = prologue();
                events.extend([
                    enter(1.0, 3),
                    leave(end, 3),
                    enter(end, 4), // reduce
                    coll(EventKind::CollBegin, end, CollectiveOp::Reduce, Some(Rank(1)), 8),
                    coll(
                        EventKind::CollEnd,
                        coll_ends[r as usize],
                        CollectiveOp::Reduce,
                        Some(Rank(1)),
                        8,
                    ),
                    leave(coll_ends[r as usize], 4),
                    leave(8.0, 1),
                ]);
                trace.add_location(events);
                trace
            })
            .collect();
        let results = run_world(traces);

        let reduce = at(9);
        // latest enter t=7 (rank 2) is after earliest end t=2.5, so no
        // global synchronization; root (rank 1, enter t=3) waited for the
        // latest rank.
        let (_, a0) = &results[0];
        let (_, a1) = &results[1];
        let (_, a2) = &results[2];
        assert!(!a0.sph.is_synchpoint(reduce));
        let info1 = a1.sph.get_synchpoint_info(reduce);
        assert!(close(info1.wait_time, 4.0));
        assert!(a1.sph.rank_set(reduce).unwrap().contains(Rank(2)));
        assert!(a2.sph.is_synchpoint(reduce));
        assert!(!a2.sph.is_waitstate(reduce));
        assert!(a2.sph.rank_set(reduce).unwrap().contains(Rank(1)));

        // Delay root is the latest rank; the root's wait lands on its
        // compute path
        let cp_compute = results[2].0.event(at(5)).callpath.unwrap();
        let costs = &a2.report.delay_costs[&METRIC_WAIT_TIME];
        let total: f64 = costs.values().sum();
        assert!(close(total, 4.0));
        assert!(close(costs[&cp_compute], 4.0));
    }

    #[test]
    fn test_gather_zero_contribution() {
        // One rank contributes nothing to the gather. It must still join
        // the analysis exchange, or the other member blocks forever in the
        // collective reductions; the wait-state result is unchanged.
        let compute_ends = [5.0, 2.0];
        let traces = (0..2u32)
            .map(|r| {
                let mut trace = world_trace(r, 2);
                let end = compute_ends[r as usize];
                let bytes = if r == 0 { 8 } else { 0 };
                let mut events = prologue();
                events.extend([
                    enter(1.0, 3), // compute
                    leave(end, 3),
                    enter(end, 4), // gather
                    coll(EventKind::CollBegin, end, CollectiveOp::Gather, Some(Rank(0)), bytes),
                    coll(EventKind::CollEnd, 5.5, CollectiveOp::Gather, Some(Rank(0)), bytes),
                    leave(5.5, 4),
                    leave(6.0, 1),
                ]);
                trace.add_location(events);
                trace
            })
            .collect();
        let results = run_world(traces);

        let gather = at(9);
        let (trace0, a0) = &results[0];
        let (_, a1) = &results[1];
        // Everyone entered before the earliest exit: global synchronization
        let info1 = a1.sph.get_synchpoint_info(gather);
        assert!(close(info1.wait_time, 3.0));
        assert_eq!(a1.sph.rank_set(gather).unwrap().count(), 2);
        assert!(a0.sph.is_synchpoint(gather));
        assert!(!a0.sph.is_waitstate(gather));
        assert!(close(a1.report.total_wait, 3.0));

        // The late root is charged the full wait of the empty-handed rank
        let cp_compute = trace0.event(at(5)).callpath.unwrap();
        let costs = &a0.report.delay_costs[&METRIC_WAIT_TIME];
        assert!(close(costs[&cp_compute], 3.0));
        assert!(close(a0.report.sum_scales[&METRIC_WAIT_TIME][&at(3)], 1.0));
    }

    #[test]
    fn test_subcomm_barrier() {
        // Ranks 0 and 2 synchronize on their own communicator while rank 1
        // computes independently; the recorded rank set holds exactly the
        // members, and rank 1 sees nothing beyond the initial
        // synchronization.
        let traces = (0..3u32)
            .map(|r| {
                let mut trace = world_trace(r, 3);
                let mut events = prologue();
                if r == 1 {
                    events.extend([enter(1.0, 3), leave(7.0, 3), leave(8.0, 1)]);
                } else {
                    trace.define_comm(CommId(1), vec![Rank(0), Rank(2)]);
                    let end = if r == 0 { 2.0 } else { 5.0 };
                    events.extend([
                        enter(1.0, 3), // compute
                        leave(end, 3),
                        enter(end, 4), // barrier on the pair communicator
                        coll_on(1, EventKind::CollBegin, end, CollectiveOp::Barrier, None, 0),
                        coll_on(1, EventKind::CollEnd, 5.0, CollectiveOp::Barrier, None, 0),
                        leave(5.0, 4),
                        leave(8.0, 1),
                    ]);
                }
                trace.add_location(events);
                trace
            })
            .collect();
        let results = run_world(traces);

        let barrier = at(9);
        let (_, a0) = &results[0];
        let (_, a1) = &results[1];
        let (trace2, a2) = &results[2];
        let info0 = a0.sph.get_synchpoint_info(barrier);
        assert!(close(info0.wait_time, 3.0));
        let set = a0.sph.rank_set(barrier).unwrap();
        assert_eq!(set.count(), 2);
        assert!(set.contains(Rank(0)) && set.contains(Rank(2)));
        assert!(!set.contains(Rank(1)));
        assert!(a2.sph.is_synchpoint(barrier));
        assert!(!a2.sph.is_waitstate(barrier));
        // The outside rank records only the initial synchronization
        assert_eq!(a1.sph.get_synchpoints_between(None, None).len(), 1);
        assert!(close(a1.report.total_wait, 0.0));

        // Delay root is the late member; the waiter's time is charged to
        // its compute path
        let cp_compute = trace2.event(at(5)).callpath.unwrap();
        let costs = &a2.report.delay_costs[&METRIC_WAIT_TIME];
        assert!(close(costs[&cp_compute], 3.0));
        assert!(close(a0.report.total_wait, 3.0));
    }
}
