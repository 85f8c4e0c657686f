use std::collections::BTreeMap;
use std::sync::Arc;

use crate::comm::Communicator;
use crate::replay::{ReplayContext, Result};
use crate::state::{CollectiveOp, EventKind, EventRef, Rank, RankSet};
use crate::team::TeamContext;

use super::{Analysis, Message};

/// Wait/total/completion time recorded at one synchronizing event.
/// `wait_time >= 0` always; `total_time` approximates wait + completion +
/// useful work since the previous synchpoint on this rank.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct SynchpointInfo {
    pub wait_time: f64,
    pub total_time: f64,
    pub completion_time: f64,
}

/// Rank-local accumulation maps of detected synchronization points. Entries
/// are created during the forward passes and persist for the remainder of
/// the analysis; nothing is ever deleted.
///
/// Rank sets hold global ranks; sub-communicator synchpoints only ever
/// insert the communicator's members.
#[derive(Debug)]
pub struct SynchpointHandler {
    nprocs: u32,
    infos: BTreeMap<EventRef, SynchpointInfo>,
    rank_sets: BTreeMap<EventRef, RankSet>,
}

impl SynchpointHandler {
    pub fn new(nprocs: u32) -> SynchpointHandler {
        SynchpointHandler {
            nprocs,
            infos: BTreeMap::new(),
            rank_sets: BTreeMap::new(),
        }
    }

    pub fn nprocs(&self) -> u32 {
        self.nprocs
    }

    pub fn is_synchpoint(&self, e: EventRef) -> bool {
        self.infos.contains_key(&e)
    }

    pub fn is_waitstate(&self, e: EventRef) -> bool {
        self.infos.get(&e).is_some_and(|info| info.wait_time > 0.0)
    }

    /// Zero-valued info for an unknown event rather than a failure.
    pub fn get_synchpoint_info(&self, e: EventRef) -> SynchpointInfo {
        self.infos.get(&e).copied().unwrap_or_default()
    }

    pub fn info_mut(&mut self, e: EventRef) -> Option<&mut SynchpointInfo> {
        self.infos.get_mut(&e)
    }

    pub fn rank_set(&self, e: EventRef) -> Option<&RankSet> {
        self.rank_sets.get(&e)
    }

    /// Synchpoints in the half-open interval `[from, to)` of the
    /// accumulation map; an unbounded end is expressed as `None`.
    pub fn get_synchpoints_between(
        &self,
        from: Option<EventRef>,
        to: Option<EventRef>,
    ) -> Vec<EventRef> {
        use std::ops::Bound;
        let lower = match from {
            Some(e) => Bound::Included(e),
            None => Bound::Unbounded,
        };
        let upper = match to {
            Some(e) => Bound::Excluded(e),
            None => Bound::Unbounded,
        };
        self.infos.range((lower, upper)).map(|(e, _)| *e).collect()
    }

    /// Record a synchpoint, merging with an existing entry for the same
    /// event (rank sets union; the larger wait wins).
    pub fn record(&mut self, e: EventRef, wait_time: f64, ranks: RankSet) {
        assert!(wait_time >= 0.0);
        assert!(ranks.universe() == self.nprocs);
        let info = self.infos.entry(e).or_default();
        if wait_time > info.wait_time {
            info.wait_time = wait_time;
        }
        self.rank_sets
            .entry(e)
            .and_modify(|set| *set = set.union(&ranks))
            .or_insert(ranks);
    }

    /// Fold another handler's maps into this one (disjoint event ranges,
    /// used when merging per-location thread-team results).
    pub fn absorb(&mut self, other: SynchpointHandler) {
        assert!(other.nprocs == self.nprocs);
        for (e, info) in other.infos {
            self.record(e, info.wait_time, other.rank_sets[&e].clone());
            if let Some(mine) = self.infos.get_mut(&e) {
                mine.total_time = info.total_time;
                mine.completion_time = info.completion_time;
            }
        }
    }

    /// Nearest synchpoint strictly before `e` whose rank set contains
    /// `rank`. Always succeeds for events after the program's initial
    /// global synchronization, which is recorded with the full universe.
    pub fn find_previous_mpi_synchpoint(&self, e: EventRef, rank: Rank) -> Option<EventRef> {
        self.rank_sets
            .range(..e)
            .rev()
            .find(|(_, set)| set.contains(rank))
            .map(|(found, _)| *found)
    }

    /// Backward scan from `from` (exclusive) resolving, for every rank in
    /// `group` other than `rank` and not already present in `out`, the
    /// nearest synchpoint that included it. Returns the oldest synchpoint
    /// consulted: the group's common ancestor boundary.
    ///
    /// An unresolved remainder indicates an analysis bug or a malformed
    /// trace and is a fail-fast condition.
    pub fn find_previous_mpi_group_synchpoints(
        &self,
        from: EventRef,
        group: &RankSet,
        rank: Rank,
        out: &mut BTreeMap<Rank, EventRef>,
    ) -> EventRef {
        let mut remaining = group.clone();
        if remaining.contains(rank) {
            remaining.erase(rank);
        }
        for resolved in out.keys() {
            if remaining.contains(*resolved) {
                remaining.erase(*resolved);
            }
        }
        let mut oldest = from;
        for (e, set) in self.rank_sets.range(..from).rev() {
            if remaining.is_empty() {
                break;
            }
            oldest = *e;
            let found = remaining.intersection(set);
            for r in found.iter() {
                remaining.erase(r);
                out.insert(r, *e);
            }
        }
        assert!(
            remaining.is_empty(),
            "group synchpoint search left {} rank(s) unresolved",
            remaining.count()
        );
        oldest
    }
}

// ---------------------------------------------------------------------------
// Detection callbacks (main forward pass)
// ---------------------------------------------------------------------------

/// 1-to-N collective (broadcast-like): any participant entering before the
/// root waited for it. Non-roots record `root.time - my.time`; the root
/// accrues the set of earlier entrants via a gather.
pub fn cb_coll_12n<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let Some(ci) = ctx.coll_info else {
        return Ok(());
    };
    let me = ctx.trace.rank;
    let comm_id = ctx.trace.event(e).comm().unwrap();
    let group = ctx.trace.comm(comm_id)?;
    let root_local = group.local_rank(ci.root.rank).unwrap();
    let sub = &a.subcomms[&comm_id];
    let gathered = sub.gather(root_local, Message::Time(ci.my))?;
    if me == ci.root.rank {
        let mut set = RankSet::new(ctx.trace.nprocs);
        for msg in gathered.unwrap() {
            let Message::Time(tr) = msg else {
                unreachable!("unexpected analysis payload in collective gather");
            };
            if tr.rank != me && tr.time.0 < ci.root.time.0 {
                set.insert(tr.rank);
            }
        }
        if !set.is_empty() {
            a.sph.record(e, 0.0, set);
        }
    } else if ci.my.time.0 < ci.root.time.0 {
        let wait = (ci.root.time.0 - ci.my.time.0).max(0.0);
        let mut set = RankSet::new(ctx.trace.nprocs);
        set.insert(ci.root.rank);
        a.sph.record(e, wait, set);
    }
    Ok(())
}

/// N-to-1 collective (reduce-like). Globally synchronizing when the last
/// entry still precedes the earliest exit; otherwise only a partial
/// root/latest synchronization may remain.
pub fn cb_coll_n21<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let Some(ci) = ctx.coll_info else {
        return Ok(());
    };
    let me = ctx.trace.rank;
    let comm_id = ctx.trace.event(e).comm().unwrap();
    let group = ctx.trace.comm(comm_id)?;
    if ci.latest.time.0 < ci.earliest_end.time.0 {
        let wait = (ci.latest.time.0 - ci.my.time.0).max(0.0);
        let mut set = RankSet::new(ctx.trace.nprocs);
        for r in group.members() {
            set.insert(*r);
        }
        a.sph.record(e, wait, set);
    } else if ci.root.time.0 < ci.latest.time.0 {
        if me == ci.root.rank {
            let wait = (ci.latest.time.0 - ci.root.time.0).max(0.0);
            let mut set = RankSet::new(ctx.trace.nprocs);
            set.insert(ci.latest.rank);
            a.sph.record(e, wait, set);
        } else if me == ci.latest.rank {
            let mut set = RankSet::new(ctx.trace.nprocs);
            set.insert(ci.root.rank);
            a.sph.record(e, 0.0, set);
        }
    }
    Ok(())
}

/// N-to-N collective: synchronizing when nobody left before the last rank
/// entered; everyone waited for the latest entrant.
pub fn cb_coll_n2n<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let Some(ci) = ctx.coll_info else {
        return Ok(());
    };
    let comm_id = ctx.trace.event(e).comm().unwrap();
    let group = ctx.trace.comm(comm_id)?;
    if ci.earliest_end.time.0 >= ci.latest.time.0 {
        let wait = (ci.latest.time.0 - ci.my.time.0).max(0.0);
        let mut set = RankSet::new(ctx.trace.nprocs);
        for r in group.members() {
            set.insert(*r);
        }
        a.sph.record(e, wait, set);
    }
    Ok(())
}

/// Barriers follow the N-to-N rule. Init/finalize are recorded
/// unconditionally with the full member set: the initial synchronization is
/// what makes every later backward search well-founded.
pub fn cb_sync_coll<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let Some(ci) = ctx.coll_info else {
        return Ok(());
    };
    let op = ctx.trace.event(e).collective_op().unwrap();
    if op == CollectiveOp::Barrier {
        return cb_coll_n2n(a, ctx, e);
    }
    let comm_id = ctx.trace.event(e).comm().unwrap();
    let group = ctx.trace.comm(comm_id)?;
    let wait = (ci.latest.time.0 - ci.my.time.0).max(0.0);
    let mut set = RankSet::new(ctx.trace.nprocs);
    for r in group.members() {
        set.insert(*r);
    }
    a.sph.record(e, wait, set);
    Ok(())
}

/// Late sender, receiver side: the matching send started after our receive
/// did, so the gap until the sender's entry was idle time.
pub fn cb_late_sender<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let Some(remote) = ctx.remote else {
        return Ok(());
    };
    let my_enter = ctx.trace.op_enter_time(e);
    let wait = remote.enter_time.0 - my_enter.0;
    if wait > 0.0 {
        let mut set = RankSet::new(ctx.trace.nprocs);
        set.insert(remote.rank);
        a.sph.record(e, wait, set);
    }
    Ok(())
}

/// Late sender, sender side, confirmed during the backward pass: the
/// receiver reported its wait, so this send event becomes the symmetric
/// synchpoint carrying the receiver in its rank set. If the receiver did
/// not wait but posted its receive after our blocking send began, the roles
/// invert into a late receiver and the wait lands here instead.
pub fn cb_late_sender_ws<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let Some(remote) = ctx.remote else {
        return Ok(());
    };
    if remote.wait_time > 0.0 {
        let mut set = RankSet::new(ctx.trace.nprocs);
        set.insert(remote.rank);
        a.sph.record(e, 0.0, set);
    } else if ctx.trace.event(e).kind == EventKind::Send {
        let my_enter = ctx.trace.op_enter_time(e);
        let wait = remote.enter_time.0 - my_enter.0;
        if wait > 0.0 {
            let mut set = RankSet::new(ctx.trace.nprocs);
            set.insert(remote.rank);
            a.sph.record(e, wait, set);
        }
    }
    Ok(())
}

/// Forward synchpoint refinement (`fws`): fill in total and completion
/// times now that wait times are final.
pub fn cb_refine<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    if !a.sph.is_synchpoint(e) {
        return Ok(());
    }
    let t = ctx.trace.event(e).time;
    let start = ctx.trace.event(EventRef::new(e.loc, 0)).time;
    let total = match a.fws_last_sp {
        Some(prev) => (t.0 - prev.0).max(0.0),
        None => (t.0 - start.0).max(0.0),
    };
    let op_enter = ctx.trace.op_enter_time(e);
    let info = a.sph.info_mut(e).unwrap();
    info.total_time = total;
    info.completion_time = (t.0 - op_enter.0 - info.wait_time).max(0.0);
    a.fws_last_sp = Some(t);
    Ok(())
}

// ---------------------------------------------------------------------------
// Thread-team callbacks (per-location pre-pass)
// ---------------------------------------------------------------------------

/// Analysis state of one location's thread during the team pre-pass. Each
/// location accumulates into its own handler; the results are folded into
/// the rank-wide one afterwards.
pub struct TeamAnalysis {
    pub rank: Rank,
    pub nprocs: u32,
    pub team: Arc<TeamContext>,
    pub sph: SynchpointHandler,
}

fn record_local(a: &mut TeamAnalysis, e: EventRef, wait: f64) {
    if wait > 0.0 {
        let mut set = RankSet::new(a.nprocs);
        set.insert(a.rank);
        a.sph.record(e, wait, set);
    }
}

/// Fork overhead on the master thread: time between entering the parallel
/// construct and the workers actually starting.
pub fn cb_thread_fork(
    a: &mut TeamAnalysis,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let wait = ctx.trace.event(e).time.0 - ctx.trace.op_enter_time(e).0;
    record_local(a, e, wait.max(0.0));
    Ok(())
}

pub fn cb_thread_join(
    a: &mut TeamAnalysis,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let wait = ctx.trace.event(e).time.0 - ctx.trace.op_enter_time(e).0;
    record_local(a, e, wait.max(0.0));
    Ok(())
}

/// Team entry and exit barriers: every member publishes its arrival time;
/// the gap to the team-wide maximum is idle time.
pub fn cb_team_sync(
    a: &mut TeamAnalysis,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let mine = match ctx.trace.event(e).kind {
        EventKind::ThreadTeamBegin => ctx.trace.op_enter_time(e),
        _ => ctx.trace.event(e).time,
    };
    let max = a.team.publish_enter(mine);
    record_local(a, e, (max.0 - mine.0).max(0.0));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocationId;

    fn at(index: u32) -> EventRef {
        EventRef::new(LocationId(0), index)
    }

    fn set_of(nprocs: u32, ranks: &[u32]) -> RankSet {
        let mut set = RankSet::new(nprocs);
        for r in ranks {
            set.insert(Rank(*r));
        }
        set
    }

    #[test]
    fn test_queries() {
        let mut sph = SynchpointHandler::new(4);
        sph.record(at(5), 2.0, set_of(4, &[1, 2]));
        sph.record(at(9), 0.0, set_of(4, &[3]));
        assert!(sph.is_synchpoint(at(5)));
        assert!(sph.is_waitstate(at(5)));
        assert!(sph.is_synchpoint(at(9)));
        assert!(!sph.is_waitstate(at(9)));
        assert!(!sph.is_synchpoint(at(7)));
        // Unknown events yield zero info, not a failure
        assert_eq!(sph.get_synchpoint_info(at(7)), SynchpointInfo::default());
        assert_eq!(sph.get_synchpoint_info(at(5)).wait_time, 2.0);
    }

    #[test]
    fn test_record_merge() {
        let mut sph = SynchpointHandler::new(4);
        sph.record(at(3), 1.0, set_of(4, &[1]));
        sph.record(at(3), 0.5, set_of(4, &[2]));
        assert_eq!(sph.get_synchpoint_info(at(3)).wait_time, 1.0);
        let set = sph.rank_set(at(3)).unwrap();
        assert!(set.contains(Rank(1)) && set.contains(Rank(2)));
    }

    #[test]
    fn test_synchpoints_between() {
        let mut sph = SynchpointHandler::new(2);
        for i in [2u32, 4, 6, 8] {
            sph.record(at(i), 0.0, set_of(2, &[1]));
        }
        assert_eq!(
            sph.get_synchpoints_between(Some(at(4)), Some(at(8))),
            vec![at(4), at(6)]
        );
        assert_eq!(
            sph.get_synchpoints_between(None, Some(at(4))),
            vec![at(2)]
        );
        assert_eq!(
            sph.get_synchpoints_between(Some(at(6)), None),
            vec![at(6), at(8)]
        );
        assert_eq!(
            sph.get_synchpoints_between(None, None).len(),
            4
        );
    }

    #[test]
    fn test_find_previous() {
        let mut sph = SynchpointHandler::new(4);
        sph.record(at(0), 0.0, RankSet::filled(4)); // init
        sph.record(at(4), 1.0, set_of(4, &[2]));
        sph.record(at(7), 1.0, set_of(4, &[1, 2]));
        assert_eq!(sph.find_previous_mpi_synchpoint(at(9), Rank(2)), Some(at(7)));
        assert_eq!(sph.find_previous_mpi_synchpoint(at(7), Rank(2)), Some(at(4)));
        // Rank 3 only appears in the initial synchronization
        assert_eq!(sph.find_previous_mpi_synchpoint(at(9), Rank(3)), Some(at(0)));
        assert_eq!(sph.find_previous_mpi_synchpoint(at(0), Rank(3)), None);
    }

    #[test]
    fn test_find_group() {
        let mut sph = SynchpointHandler::new(4);
        sph.record(at(0), 0.0, RankSet::filled(4));
        sph.record(at(3), 0.0, set_of(4, &[1]));
        sph.record(at(5), 0.0, set_of(4, &[2]));
        let mut out = BTreeMap::new();
        let boundary = sph.find_previous_mpi_group_synchpoints(
            at(8),
            &RankSet::filled(4),
            Rank(0),
            &mut out,
        );
        assert_eq!(out[&Rank(2)], at(5));
        assert_eq!(out[&Rank(1)], at(3));
        assert_eq!(out[&Rank(3)], at(0));
        // Rank 3 resolved last, at the initial synchronization
        assert_eq!(boundary, at(0));
    }

    #[test]
    #[should_panic(expected = "unresolved")]
    fn test_find_group_unresolvable() {
        let sph = SynchpointHandler::new(2);
        let mut out = BTreeMap::new();
        sph.find_previous_mpi_group_synchpoints(at(5), &RankSet::filled(2), Rank(0), &mut out);
    }

    #[test]
    fn test_absorb() {
        let mut a = SynchpointHandler::new(2);
        a.record(at(1), 1.0, set_of(2, &[0]));
        let mut b = SynchpointHandler::new(2);
        b.record(EventRef::new(LocationId(1), 0), 2.0, set_of(2, &[0]));
        a.absorb(b);
        assert!(a.is_waitstate(EventRef::new(LocationId(1), 0)));
        assert!(a.is_waitstate(at(1)));
    }
}
