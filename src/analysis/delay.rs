use std::collections::BTreeMap;

use crate::comm::Communicator;
use crate::replay::{ReplayContext, Result, UserEvent};
use crate::state::{
    CallpathId, CollectiveKind, CollectiveOp, EventKind, EventRef, MetricId, RankSet, Trace,
};

use super::communication::DELAY_TAG;
use super::synchpoint::SynchpointHandler;
use super::{Analysis, Message, payload_mismatch};

/// Direct wait time recorded at the analyzed synchpoint.
pub const METRIC_WAIT_TIME: MetricId = MetricId(0);
/// Wait time accumulated at later synchpoints that this rank may have
/// propagated backward through the analyzed one.
pub const METRIC_PROP_WAIT: MetricId = MetricId(1);

pub fn metric_name(metric: MetricId) -> &'static str {
    match metric {
        METRIC_WAIT_TIME => "waitTime",
        METRIC_PROP_WAIT => "propagatingWait",
        _ => "unknown",
    }
}

fn metric_value(metric: MetricId, wait: f64, prop_wait: f64) -> f64 {
    match metric {
        METRIC_WAIT_TIME => wait,
        METRIC_PROP_WAIT => prop_wait,
        _ => 0.0,
    }
}

/// Per-call-path breakdown of delay-capable time over an interval, with the
/// running total kept alongside the map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeMapSum {
    pub map: BTreeMap<CallpathId, f64>,
    pub sum: f64,
}

impl TimeMapSum {
    pub fn add(&mut self, cp: CallpathId, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        *self.map.entry(cp).or_insert(0.0) += dt;
        self.sum += dt;
    }

    /// Remove up to `amount` from one bucket; the bucket never goes
    /// negative, absorbing clock skew between the interval endpoints and the
    /// recorded wait.
    pub fn subtract(&mut self, cp: CallpathId, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        if let Some(v) = self.map.get_mut(&cp) {
            let taken = amount.min(*v);
            *v -= taken;
            self.sum -= taken;
        }
    }
}

/// Scale factors keyed by the synchpoint that resolved the contributing
/// rank, aggregated at the delay root.
pub type ScaleMap = BTreeMap<EventRef, f64>;

/// Mutable state of the delay analysis on one rank: the running sum of wait
/// time seen so far by the backward scan, and the metric set being costed.
#[derive(Debug)]
pub struct DelayState {
    pub prop_wait: f64,
    pub metrics: Vec<MetricId>,
}

impl Default for DelayState {
    fn default() -> Self {
        DelayState {
            prop_wait: 0.0,
            metrics: vec![METRIC_WAIT_TIME, METRIC_PROP_WAIT],
        }
    }
}

/// Per-call-path time breakdown of the interval `(from, to]` on `to`'s
/// location, `None` meaning the start of the log. Gaps between consecutive
/// events are attributed to the call path active during the gap; wait time
/// recorded at synchpoints inside the interval is subtracted, since time
/// spent waiting cannot have delayed anyone.
pub fn timemap(
    trace: &Trace,
    sph: &SynchpointHandler,
    from: Option<EventRef>,
    to: EventRef,
) -> TimeMapSum {
    let loc = to.loc;
    let start = match from {
        Some(f) => {
            debug_assert!(f.loc == loc);
            f.index
        }
        None => 0,
    };
    let mut out = TimeMapSum::default();
    for index in start..to.index {
        let cur = EventRef::new(loc, index);
        let next = EventRef::new(loc, index + 1);
        let dt = trace.event(next).time.0 - trace.event(cur).time.0;
        let attr = {
            let ev = trace.event(next);
            match (ev.kind, ev.callpath) {
                // Time before an enter belongs to the parent region
                (EventKind::Enter, Some(cp)) => trace.calltree().node(cp).parent,
                (_, cp) => cp,
            }
        };
        if let Some(cp) = attr {
            out.add(cp, dt);
        }
    }
    let end = EventRef::new(loc, to.index + 1);
    for sp in sph.get_synchpoints_between(from, Some(end)) {
        if Some(sp) == from {
            continue;
        }
        let wait = sph.get_synchpoint_info(sp).wait_time;
        if let Some(cp) = trace.event(sp).callpath {
            out.subtract(cp, wait);
        }
    }
    out
}

fn unpack_timemap(ids: &[CallpathId], values: &[f64]) -> BTreeMap<CallpathId, f64> {
    ids.iter().copied().zip(values.iter().copied()).collect()
}

fn add_costs(
    costs: &mut BTreeMap<MetricId, BTreeMap<CallpathId, f64>>,
    metric: MetricId,
    ids: &[CallpathId],
    values: &[f64],
) {
    for (id, v) in ids.iter().zip(values) {
        if *v > 0.0 {
            *costs.entry(metric).or_default().entry(*id).or_insert(0.0) += *v;
        }
    }
}

fn record_scale(
    sum_scales: &mut BTreeMap<MetricId, ScaleMap>,
    max_scales: &mut BTreeMap<MetricId, ScaleMap>,
    metric: MetricId,
    sp: EventRef,
    scale: f64,
) {
    if scale <= 0.0 {
        return;
    }
    *sum_scales
        .entry(metric)
        .or_default()
        .entry(sp)
        .or_insert(0.0) += scale;
    let max = max_scales
        .entry(metric)
        .or_default()
        .entry(sp)
        .or_insert(0.0);
    if scale > *max {
        *max = scale;
    }
}

/// Backward delay pass entry points. The analysis itself runs on the raised
/// user events, mirroring the cascade structure of the wait-state passes.
pub fn cb_trigger_delay_collective<C: Communicator<Message>>(
    _a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    _e: EventRef,
) -> Result<()> {
    ctx.raise(UserEvent::DelayCollective);
    Ok(())
}

pub fn cb_trigger_delay_send<C: Communicator<Message>>(
    _a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    _e: EventRef,
) -> Result<()> {
    ctx.raise(UserEvent::DelayLateSender);
    Ok(())
}

/// Backward delay pass, collective end. Every member of the communicator
/// participates; members that did not wait here contribute zeros so the
/// collective exchange stays aligned across ranks.
pub fn cb_delay_collective<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let event = ctx.trace.event(e);
    // Absent on every member when the main pass judged the collective
    // data-less, so skipping here stays aligned across the communicator.
    let Some(&ci) = a.comm_handler.coll_infos.get(&e) else {
        return Ok(());
    };
    let op = event.collective_op().unwrap();
    let comm_id = event.comm().unwrap();
    let me = ctx.trace.rank;
    let kind = op.kind();
    let has_wait = ci.latest.time.0 > ci.earliest.time.0;

    // Every member derives the same decision from the shared aggregate.
    let (synchronizing, delay_root) = match kind {
        CollectiveKind::OneToN => (ci.earliest.time.0 < ci.root.time.0, ci.root.rank),
        CollectiveKind::NToOne => {
            let global = ci.latest.time.0 < ci.earliest_end.time.0 && has_wait;
            let partial = ci.root.time.0 < ci.latest.time.0;
            (global || partial, ci.latest.rank)
        }
        CollectiveKind::NToN => (
            ci.earliest_end.time.0 >= ci.latest.time.0 && has_wait,
            ci.latest.rank,
        ),
        CollectiveKind::Sync => {
            let barrier_sync =
                op != CollectiveOp::Barrier || ci.earliest_end.time.0 >= ci.latest.time.0;
            // Init has nothing before it to attribute delay to
            (op != CollectiveOp::Init && has_wait && barrier_sync, ci.latest.rank)
        }
    };
    if synchronizing {
        let in_group = me != delay_root
            && match kind {
                CollectiveKind::OneToN => ci.my.time.0 < ci.root.time.0,
                CollectiveKind::NToOne => {
                    ci.latest.time.0 < ci.earliest_end.time.0 || me == ci.root.rank
                }
                CollectiveKind::NToN | CollectiveKind::Sync => true,
            };
        collective_delay_exchange(a, ctx, e, comm_id, delay_root, in_group)?;
    }
    a.delay.prop_wait += a.sph.get_synchpoint_info(e).wait_time;
    Ok(())
}

fn collective_delay_exchange<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
    comm_id: crate::state::CommId,
    delay_root: crate::state::Rank,
    in_group: bool,
) -> Result<()> {
    let me = ctx.trace.rank;
    let sub = &a.subcomms[&comm_id];
    let root_local = sub.local_rank(delay_root).unwrap();
    let nmetrics = a.delay.metrics.len();

    if me == delay_root {
        let group: RankSet = a.sph.rank_set(e).cloned().unwrap();
        let mut resolved = BTreeMap::new();
        let boundary = a
            .sph
            .find_previous_mpi_group_synchpoints(e, &group, me, &mut resolved);
        let group_tmap = timemap(ctx.trace, &a.sph, Some(boundary), e);
        let ids: Vec<CallpathId> = group_tmap.map.keys().copied().collect();
        let values: Vec<f64> = group_tmap.map.values().copied().collect();
        sub.broadcast(
            root_local,
            Some(Message::TimeMap {
                ids: ids.clone(),
                values,
                prop_wait: a.delay.prop_wait,
            }),
        )?;
        // Per-rank correction: the part of the broadcast interval that
        // precedes the rank's own resolving synchpoint. Members outside the
        // delay group and members resolved at the boundary get an empty map.
        let mut corrections = Vec::with_capacity(sub.size() as usize);
        for local in 0..sub.size() {
            let r = sub.global_rank(crate::state::Rank(local));
            let corr = match resolved.get(&r) {
                Some(&sp) if r != me && group.contains(r) && sp != boundary => {
                    timemap(ctx.trace, &a.sph, Some(boundary), sp)
                }
                _ => TimeMapSum::default(),
            };
            corrections.push(Message::TimeMap {
                ids: corr.map.keys().copied().collect(),
                values: corr.map.values().copied().collect(),
                prop_wait: 0.0,
            });
        }
        sub.scatter(root_local, Some(corrections))?;
        for mi in 0..nmetrics {
            let metric = a.delay.metrics[mi];
            let summed = sub
                .reduce_sum(root_local, vec![0.0; ids.len()])?
                .unwrap();
            add_costs(&mut a.report.delay_costs, metric, &ids, &summed);
        }
        let all_scales = sub.gather(root_local, Message::Scales(vec![0.0; nmetrics]))?.unwrap();
        for (local, msg) in all_scales.into_iter().enumerate() {
            let r = sub.global_rank(crate::state::Rank(local as u32));
            if r == me || !group.contains(r) {
                continue;
            }
            let Message::Scales(scales) = msg else {
                return Err(payload_mismatch(e));
            };
            let sp = resolved[&r];
            for (mi, scale) in scales.into_iter().enumerate() {
                record_scale(
                    &mut a.report.sum_scales,
                    &mut a.report.max_scales,
                    a.delay.metrics[mi],
                    sp,
                    scale,
                );
            }
        }
    } else {
        let Message::TimeMap {
            ids,
            values,
            prop_wait: root_prop_wait,
        } = sub.broadcast(root_local, None)?
        else {
            return Err(payload_mismatch(e));
        };
        let Message::TimeMap {
            ids: corr_ids,
            values: corr_values,
            ..
        } = sub.scatter(root_local, None)?
        else {
            return Err(payload_mismatch(e));
        };
        if in_group {
            let corr = unpack_timemap(&corr_ids, &corr_values);
            let my_sp = a.sph.find_previous_mpi_synchpoint(e, delay_root);
            let own = timemap(ctx.trace, &a.sph, my_sp, e);
            let mut d = Vec::with_capacity(ids.len());
            let mut local_delay_sum = 0.0;
            for (id, v) in ids.iter().zip(&values) {
                let c = corr.get(id).copied().unwrap_or(0.0);
                let o = own.map.get(id).copied().unwrap_or(0.0);
                let di = (v - c - o).max(0.0);
                local_delay_sum += di;
                d.push(di);
            }
            let wait = a.sph.get_synchpoint_info(e).wait_time;
            let denom = local_delay_sum + root_prop_wait;
            let mut scales = Vec::with_capacity(nmetrics);
            for metric in &a.delay.metrics {
                let v = metric_value(*metric, wait, a.delay.prop_wait);
                let scale = if denom > 0.0 { (v / denom).min(1.0) } else { 0.0 };
                scales.push(scale);
            }
            for scale in &scales {
                let contribution: Vec<f64> = d.iter().map(|x| x * scale).collect();
                sub.reduce_sum(root_local, contribution)?;
            }
            sub.gather(root_local, Message::Scales(scales))?;
        } else {
            for _ in 0..nmetrics {
                sub.reduce_sum(root_local, vec![0.0; ids.len()])?;
            }
            sub.gather(root_local, Message::Scales(vec![0.0; nmetrics]))?;
        }
    }
    Ok(())
}

/// Backward delay pass, sender side of a confirmed late-sender pair: the
/// sender acts as the two-rank delay root.
pub fn cb_delay_send<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let event = ctx.trace.event(e);
    if event.is_zero_sized() {
        return Ok(());
    }
    let Some(group) = a.sph.rank_set(e).cloned() else {
        return Ok(());
    };
    if a.sph.is_waitstate(e) {
        // Late receiver: the wait is on this side, so there is no partner
        // timeline to charge and no exchange to run.
        a.delay.prop_wait += a.sph.get_synchpoint_info(e).wait_time;
        return Ok(());
    }
    let me = ctx.trace.rank;
    let partner = group.iter().next().unwrap();
    let mut resolved = BTreeMap::new();
    let boundary = a
        .sph
        .find_previous_mpi_group_synchpoints(e, &group, me, &mut resolved);
    let tmap = timemap(ctx.trace, &a.sph, Some(boundary), e);
    let ids: Vec<CallpathId> = tmap.map.keys().copied().collect();
    a.comm.send(
        partner,
        DELAY_TAG,
        Message::TimeMap {
            ids: ids.clone(),
            values: tmap.map.values().copied().collect(),
            prop_wait: a.delay.prop_wait,
        },
    )?;
    let Message::Contribution {
        ids: cids,
        metric_values,
        scales,
    } = a.comm.recv(partner, DELAY_TAG)?
    else {
        return Err(payload_mismatch(e));
    };
    let sp = resolved[&partner];
    for (mi, values) in metric_values.iter().enumerate() {
        let metric = a.delay.metrics[mi];
        add_costs(&mut a.report.delay_costs, metric, &cids, values);
        record_scale(
            &mut a.report.sum_scales,
            &mut a.report.max_scales,
            metric,
            sp,
            scales[mi],
        );
    }
    a.delay.prop_wait += a.sph.get_synchpoint_info(e).wait_time;
    Ok(())
}

/// Backward delay pass, receiver side of a confirmed late-sender pair.
pub fn cb_delay_recv<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    let event = ctx.trace.event(e);
    if event.is_zero_sized() {
        return Ok(());
    }
    if !a.sph.is_waitstate(e) {
        return Ok(());
    }
    let peer = event.peer().unwrap();
    let Message::TimeMap {
        ids,
        values,
        prop_wait: root_prop_wait,
    } = a.comm.recv(peer, DELAY_TAG)?
    else {
        return Err(payload_mismatch(e));
    };
    let my_sp = a.sph.find_previous_mpi_synchpoint(e, peer);
    let own = timemap(ctx.trace, &a.sph, my_sp, e);
    let mut d = Vec::with_capacity(ids.len());
    let mut local_delay_sum = 0.0;
    for (id, v) in ids.iter().zip(&values) {
        let o = own.map.get(id).copied().unwrap_or(0.0);
        let di = (v - o).max(0.0);
        local_delay_sum += di;
        d.push(di);
    }
    let wait = a.sph.get_synchpoint_info(e).wait_time;
    let denom = local_delay_sum + root_prop_wait;
    let mut metric_values = Vec::with_capacity(a.delay.metrics.len());
    let mut scales = Vec::with_capacity(a.delay.metrics.len());
    for metric in &a.delay.metrics {
        let v = metric_value(*metric, wait, a.delay.prop_wait);
        let scale = if denom > 0.0 { (v / denom).min(1.0) } else { 0.0 };
        metric_values.push(d.iter().map(|x| x * scale).collect());
        scales.push(scale);
    }
    a.comm.send(
        peer,
        DELAY_TAG,
        Message::Contribution {
            ids,
            metric_values,
            scales,
        },
    )?;
    a.delay.prop_wait += wait;
    Ok(())
}

/// Forward propagating pass: fold final wait times into the per-call-path
/// cost totals of the report.
pub fn cb_accumulate_wait<C: Communicator<Message>>(
    a: &mut Analysis<C>,
    ctx: &mut ReplayContext<'_>,
    e: EventRef,
) -> Result<()> {
    if !a.sph.is_synchpoint(e) {
        return Ok(());
    }
    let wait = a.sph.get_synchpoint_info(e).wait_time;
    if wait <= 0.0 {
        return Ok(());
    }
    if let Some(cp) = ctx.trace.event(e).callpath {
        *a.report.wait_costs.entry(cp).or_insert(0.0) += wait;
    }
    a.report.total_wait += wait;
    Ok(())
}
