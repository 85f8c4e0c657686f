use std::collections::BTreeMap;
use std::fmt;

use crate::comm::{CollectiveInfo, CommError, TimeRank};
use crate::state::{EventKind, EventRef, LocationId, Timestamp, Trace, TraceError};

pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(Debug)]
pub enum ReplayError {
    Trace(TraceError),
    Comm(CommError),
    Message(String),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::Trace(err) => write!(f, "trace error: {}", err),
            ReplayError::Comm(err) => write!(f, "communication error: {}", err),
            ReplayError::Message(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<TraceError> for ReplayError {
    fn from(err: TraceError) -> Self {
        ReplayError::Trace(err)
    }
}

impl From<CommError> for ReplayError {
    fn from(err: CommError) -> Self {
        ReplayError::Comm(err)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Named replay stages in fixed pipeline order. Later stages read the
/// accumulation maps built by earlier ones, so the order is not
/// configurable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Forward wait-state detection over the whole trace.
    Main,
    /// Backward wait-state confirmation (`bws`).
    BwdWaitState,
    /// Forward synchpoint refinement (`fws`).
    FwdSynchpoint,
    /// Backward delay / critical-path analysis (`bwc`).
    BwdDelay,
    /// Forward propagating-wait analysis (`fwc`).
    FwdPropagating,
}

impl Stage {
    pub const PIPELINE: [Stage; 5] = [
        Stage::Main,
        Stage::BwdWaitState,
        Stage::FwdSynchpoint,
        Stage::BwdDelay,
        Stage::FwdPropagating,
    ];

    pub fn direction(self) -> Direction {
        match self {
            Stage::Main | Stage::FwdSynchpoint | Stage::FwdPropagating => Direction::Forward,
            Stage::BwdWaitState | Stage::BwdDelay => Direction::Backward,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Main => "main",
            Stage::BwdWaitState => "bws",
            Stage::FwdSynchpoint => "fws",
            Stage::BwdDelay => "bwc",
            Stage::FwdPropagating => "fwc",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Synthetic event ids raised by handlers to cascade dispatch within one
/// event, e.g. a generic collective-end handler fanning out to the specific
/// collective pattern.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UserEvent {
    Coll12N,
    CollN21,
    CollN2N,
    SyncColl,
    LateSender,
    LateSenderWs,
    DelayLateSender,
    DelayCollective,
}

/// Analysis metadata received from a communication partner alongside the
/// replayed event.
#[derive(Debug, Copy, Clone)]
pub struct RemoteEventInfo {
    /// Global rank the metadata came from.
    pub rank: crate::state::Rank,
    /// Enter time of the partner's operation.
    pub enter_time: Timestamp,
    /// Timestamp of the partner's event itself.
    pub event_time: Timestamp,
    /// Wait time already recorded on the partner's side, if any.
    pub wait_time: f64,
}

/// Per-event scratch shared by the handlers of one dispatch. Exclusively
/// owned by one rank's driver for the duration of one event; everything
/// except the trace reference is reset between events.
pub struct ReplayContext<'a> {
    pub trace: &'a Trace,
    pub stage: Stage,
    pub coll_info: Option<CollectiveInfo>,
    pub remote: Option<RemoteEventInfo>,
    raised: Vec<UserEvent>,
}

impl<'a> ReplayContext<'a> {
    pub fn new(trace: &'a Trace, stage: Stage) -> ReplayContext<'a> {
        ReplayContext {
            trace,
            stage,
            coll_info: None,
            remote: None,
            raised: Vec::new(),
        }
    }

    /// Raise a user event; its handlers run synchronously before the next
    /// handler of the underlying event kind.
    pub fn raise(&mut self, id: UserEvent) {
        self.raised.push(id);
    }

    pub fn my_timerank(&self, e: EventRef) -> TimeRank {
        TimeRank::new(self.trace.op_enter_time(e), self.trace.rank)
    }

    fn reset(&mut self) {
        self.coll_info = None;
        self.remote = None;
        debug_assert!(self.raised.is_empty());
    }
}

pub type Handler<A> = fn(&mut A, &mut ReplayContext<'_>, EventRef) -> Result<()>;

/// Per-stage registry mapping event kinds and user-event ids to ordered
/// handler lists. Dispatch is synchronous and single-threaded per rank.
pub struct CallbackManager<A> {
    event_cbs: BTreeMap<EventKind, Vec<Handler<A>>>,
    user_cbs: BTreeMap<UserEvent, Vec<Handler<A>>>,
}

impl<A> Default for CallbackManager<A> {
    fn default() -> Self {
        CallbackManager {
            event_cbs: BTreeMap::new(),
            user_cbs: BTreeMap::new(),
        }
    }
}

impl<A> CallbackManager<A> {
    pub fn new() -> CallbackManager<A> {
        CallbackManager::default()
    }

    pub fn on_event(&mut self, kind: EventKind, handler: Handler<A>) {
        self.event_cbs.entry(kind).or_default().push(handler);
    }

    pub fn on_user(&mut self, id: UserEvent, handler: Handler<A>) {
        self.user_cbs.entry(id).or_default().push(handler);
    }

    /// Invoke all handlers registered for this event's kind, in
    /// registration order, cascading raised user events after each handler.
    pub fn dispatch(
        &self,
        analysis: &mut A,
        ctx: &mut ReplayContext<'_>,
        e: EventRef,
    ) -> Result<()> {
        let kind = ctx.trace.event(e).kind;
        if let Some(handlers) = self.event_cbs.get(&kind) {
            for handler in handlers {
                handler(analysis, ctx, e)?;
                self.drain_raised(analysis, ctx, e)?;
            }
        }
        Ok(())
    }

    fn drain_raised(
        &self,
        analysis: &mut A,
        ctx: &mut ReplayContext<'_>,
        e: EventRef,
    ) -> Result<()> {
        // Handlers of a user event may raise further user events; those
        // cascade within the same underlying event's dispatch.
        while !ctx.raised.is_empty() {
            let id = ctx.raised.remove(0);
            if let Some(handlers) = self.user_cbs.get(&id) {
                for handler in handlers {
                    handler(analysis, ctx, e)?;
                }
            }
        }
        Ok(())
    }
}

/// Scan one location's event sequence once, invoking matching handlers.
/// Backward stages walk the log in reverse sequence order. Handler errors
/// are not caught; they unwind the whole replay for this rank.
pub fn replay<A>(
    analysis: &mut A,
    trace: &Trace,
    loc: LocationId,
    stage: Stage,
    manager: &CallbackManager<A>,
) -> Result<()> {
    let num_events = trace.num_events(loc);
    let mut ctx = ReplayContext::new(trace, stage);
    match stage.direction() {
        Direction::Forward => {
            for index in 0..num_events {
                ctx.reset();
                manager.dispatch(analysis, &mut ctx, EventRef::new(loc, index))?;
            }
        }
        Direction::Backward => {
            for index in (0..num_events).rev() {
                ctx.reset();
                manager.dispatch(analysis, &mut ctx, EventRef::new(loc, index))?;
            }
        }
    }
    Ok(())
}
