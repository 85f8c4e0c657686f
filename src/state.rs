use std::collections::BTreeMap;
use std::fmt;

use derive_more::{Add, From, Sub};
use num_enum::TryFromPrimitive;

use rayon::prelude::*;

use serde::Serialize;

/// Time in double-precision seconds, as recorded by the measurement system.
///
/// Local clocks are only approximately synchronized across ranks; every
/// cross-rank difference taken from these values is clamped at zero at the
/// point of use to absorb skew and measurement noise.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Default, Add, Sub, From)]
pub struct Timestamp(pub f64 /* seconds */);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0.0);

    pub fn seconds(&self) -> f64 {
        self.0
    }

    pub fn max(self, other: Timestamp) -> Timestamp {
        if other.0 > self.0 { other } else { self }
    }

    pub fn min(self, other: Timestamp) -> Timestamp {
        if other.0 < self.0 { other } else { self }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Rank(pub u32);

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A thread (execution location) within one rank. Location 0 is the master
/// thread and the only location that issues MPI operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct LocationId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegionId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallsiteId(pub u64);

/// Stable handle into the call-path arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct CallpathId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommId(pub u32);

/// Identifies one analyzed cost metric (e.g. accumulated wait time).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct MetricId(pub u32);

// Keep the numeric tags stable; they double as the event type tags of the
// analysis-metadata channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive)]
#[repr(i32)]
pub enum EventKind {
    Enter = 1,
    Leave = 2,
    Send = 3,
    SendRequest = 4,
    SendComplete = 5,
    Recv = 6,
    RecvRequest = 7,
    RecvComplete = 8,
    CollBegin = 9,
    CollEnd = 10,
    ThreadFork = 11,
    ThreadJoin = 12,
    ThreadTeamBegin = 13,
    ThreadTeamEnd = 14,
    ThreadCreate = 15,
    ThreadBegin = 16,
    TaskSwitch = 17,
    TaskComplete = 18,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive)]
#[repr(i32)]
pub enum CollectiveOp {
    Barrier = 0,
    Bcast = 1,
    Scatter = 2,
    Gather = 3,
    Reduce = 4,
    Allreduce = 5,
    Alltoall = 6,
    Init = 7,
    Finalize = 8,
}

/// Communication structure of a collective, determining which wait-state
/// pattern applies at its end event.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum CollectiveKind {
    OneToN,
    NToOne,
    NToN,
    Sync,
}

impl CollectiveOp {
    pub fn kind(&self) -> CollectiveKind {
        match self {
            CollectiveOp::Bcast | CollectiveOp::Scatter => CollectiveKind::OneToN,
            CollectiveOp::Gather | CollectiveOp::Reduce => CollectiveKind::NToOne,
            CollectiveOp::Allreduce | CollectiveOp::Alltoall => CollectiveKind::NToN,
            CollectiveOp::Barrier | CollectiveOp::Init | CollectiveOp::Finalize => {
                CollectiveKind::Sync
            }
        }
    }
}

impl fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Type-specific payload carried by an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Region {
        region: RegionId,
        callsite: Option<CallsiteId>,
    },
    P2p {
        peer: Rank,
        tag: u32,
        comm: CommId,
        bytes: u64,
        request: Option<u64>,
    },
    Collective {
        comm: CommId,
        op: CollectiveOp,
        root: Option<Rank>,
        bytes_sent: u64,
        bytes_recvd: u64,
    },
    ThreadTeam {
        team_size: u32,
    },
    Task {
        task_id: u64,
    },
    None,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub time: Timestamp,
    pub payload: Payload,
    /// Assigned during structural validation from the enter/leave nesting.
    pub callpath: Option<CallpathId>,
}

impl Event {
    pub fn new(kind: EventKind, time: Timestamp, payload: Payload) -> Event {
        Event {
            kind,
            time,
            payload,
            callpath: None,
        }
    }

    pub fn comm(&self) -> Option<CommId> {
        match self.payload {
            Payload::P2p { comm, .. } => Some(comm),
            Payload::Collective { comm, .. } => Some(comm),
            _ => None,
        }
    }

    pub fn peer(&self) -> Option<Rank> {
        match self.payload {
            Payload::P2p { peer, .. } => Some(peer),
            _ => None,
        }
    }

    pub fn tag(&self) -> Option<u32> {
        match self.payload {
            Payload::P2p { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub fn collective_op(&self) -> Option<CollectiveOp> {
        match self.payload {
            Payload::Collective { op, .. } => Some(op),
            _ => None,
        }
    }

    pub fn collective_root(&self) -> Option<Rank> {
        match self.payload {
            Payload::Collective { root, .. } => root,
            _ => None,
        }
    }

    /// Zero-byte point-to-point transfers synchronize nothing and are
    /// excluded from wait-state consideration. Whether a collective moved
    /// data is a communicator-wide question (one member may legitimately
    /// contribute nothing), so collectives are judged from the aggregate of
    /// [`Event::collective_bytes`] instead.
    pub fn is_zero_sized(&self) -> bool {
        match self.payload {
            Payload::P2p { bytes, .. } => bytes == 0,
            _ => false,
        }
    }

    /// Bytes this rank moved through a collective, in both directions.
    pub fn collective_bytes(&self) -> Option<u64> {
        match self.payload {
            Payload::Collective {
                bytes_sent,
                bytes_recvd,
                ..
            } => Some(bytes_sent + bytes_recvd),
            _ => None,
        }
    }
}

/// Opaque handle into a rank-local ordered event log. Equality and ordering
/// are by (location, sequence index).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct EventRef {
    pub loc: LocationId,
    pub index: u32,
}

impl EventRef {
    pub fn new(loc: LocationId, index: u32) -> EventRef {
        EventRef { loc, index }
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.loc.0, self.index)
    }
}

#[derive(Debug, Clone)]
pub struct Callpath {
    pub region: RegionId,
    pub callsite: Option<CallsiteId>,
    pub parent: Option<CallpathId>,
    children: Vec<CallpathId>,
}

impl Callpath {
    pub fn children(&self) -> &[CallpathId] {
        &self.children
    }
}

/// Append-only call-path arena. Nodes are identified by stable integer
/// handles; (region, callsite, parent) triples are interned.
#[derive(Debug, Default)]
pub struct CallTree {
    nodes: Vec<Callpath>,
    index: BTreeMap<(RegionId, Option<CallsiteId>, Option<CallpathId>), CallpathId>,
}

impl CallTree {
    pub fn new() -> CallTree {
        CallTree::default()
    }

    pub fn get_callpath(
        &mut self,
        region: RegionId,
        callsite: Option<CallsiteId>,
        parent: Option<CallpathId>,
    ) -> CallpathId {
        if let Some(id) = self.index.get(&(region, callsite, parent)) {
            return *id;
        }
        let id = CallpathId(u32::try_from(self.nodes.len()).unwrap());
        self.nodes.push(Callpath {
            region,
            callsite,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent.0 as usize].children.push(id);
        }
        self.index.insert((region, callsite, parent), id);
        id
    }

    pub fn find_callpath(
        &self,
        region: RegionId,
        callsite: Option<CallsiteId>,
        parent: Option<CallpathId>,
    ) -> Option<CallpathId> {
        self.index.get(&(region, callsite, parent)).copied()
    }

    pub fn node(&self, id: CallpathId) -> &Callpath {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Fixed-universe set over `[0, universe)` global ranks, used to record
/// which ranks are known synchronized at an event. Plain value semantics;
/// all binary operations assert matching universes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankSet {
    universe: u32,
    words: Vec<u64>,
}

impl RankSet {
    pub fn new(universe: u32) -> RankSet {
        RankSet {
            universe,
            words: vec![0; universe.div_ceil(64) as usize],
        }
    }

    pub fn filled(universe: u32) -> RankSet {
        let mut set = RankSet::new(universe);
        set.fill();
        set
    }

    pub fn universe(&self) -> u32 {
        self.universe
    }

    pub fn fill(&mut self) {
        for word in &mut self.words {
            *word = !0;
        }
        self.mask_tail();
    }

    fn mask_tail(&mut self) {
        let tail = self.universe % 64;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }

    pub fn insert(&mut self, rank: Rank) {
        assert!(rank.0 < self.universe);
        self.words[(rank.0 / 64) as usize] |= 1u64 << (rank.0 % 64);
    }

    pub fn erase(&mut self, rank: Rank) {
        assert!(rank.0 < self.universe);
        self.words[(rank.0 / 64) as usize] &= !(1u64 << (rank.0 % 64));
    }

    pub fn contains(&self, rank: Rank) -> bool {
        rank.0 < self.universe && self.words[(rank.0 / 64) as usize] & (1u64 << (rank.0 % 64)) != 0
    }

    pub fn intersection(&self, other: &RankSet) -> RankSet {
        assert!(self.universe == other.universe);
        let words = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a & b)
            .collect();
        RankSet {
            universe: self.universe,
            words,
        }
    }

    pub fn union(&self, other: &RankSet) -> RankSet {
        assert!(self.universe == other.universe);
        let words = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a | b)
            .collect();
        RankSet {
            universe: self.universe,
            words,
        }
    }

    pub fn difference(&self, other: &RankSet) -> RankSet {
        assert!(self.universe == other.universe);
        let words = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a & !b)
            .collect();
        RankSet {
            universe: self.universe,
            words,
        }
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Rank> + '_ {
        (0..self.universe)
            .map(Rank)
            .filter(move |r| self.contains(*r))
    }
}

/// Membership of one communicator, in local-rank order. Sub-communicator
/// operations restrict the synchronized rank universe to these members.
#[derive(Debug, Clone)]
pub struct CommGroup {
    pub id: CommId,
    members: Vec<Rank>,
}

impl CommGroup {
    pub fn new(id: CommId, members: Vec<Rank>) -> CommGroup {
        CommGroup { id, members }
    }

    pub fn size(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    pub fn global_rank(&self, local: Rank) -> Rank {
        self.members[local.0 as usize]
    }

    pub fn local_rank(&self, global: Rank) -> Option<Rank> {
        self.members
            .iter()
            .position(|r| *r == global)
            .map(|i| Rank(i as u32))
    }

    pub fn contains(&self, global: Rank) -> bool {
        self.members.contains(&global)
    }
}

#[derive(Debug)]
pub struct LocationLog {
    pub loc: LocationId,
    pub events: Vec<Event>,
}

pub type Result<T> = std::result::Result<T, TraceError>;

#[derive(Debug)]
pub enum TraceError {
    /// Enter/leave nesting did not return to depth 0 at end of log.
    UnbalancedNesting { loc: LocationId, depth: usize },
    /// A leave event occurred with no open region.
    MismatchedLeave { loc: LocationId, index: u32 },
    /// Thread/task creation occurred outside any region.
    MissingStubAncestor { loc: LocationId, index: u32 },
    UnknownComm(CommId),
    InvalidEvent(EventRef),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::UnbalancedNesting { loc, depth } => write!(
                f,
                "location {}: enter/leave nesting ends at depth {}, expected 0",
                loc.0, depth
            ),
            TraceError::MismatchedLeave { loc, index } => write!(
                f,
                "location {}: leave at index {} with no open region",
                loc.0, index
            ),
            TraceError::MissingStubAncestor { loc, index } => write!(
                f,
                "location {}: thread/task creation at index {} outside any region",
                loc.0, index
            ),
            TraceError::UnknownComm(comm) => write!(f, "unknown communicator {}", comm.0),
            TraceError::InvalidEvent(e) => write!(f, "invalid event reference {}", e),
        }
    }
}

impl std::error::Error for TraceError {}

/// One rank's trace: per-location ordered event logs plus the definitions
/// the analysis needs (communicator groups, call tree).
///
/// `validate` must run, and succeed, before any replay stage; it checks
/// structural integrity, assigns call-paths, and pairs nonblocking
/// request/completion events.
#[derive(Debug)]
pub struct Trace {
    pub rank: Rank,
    pub nprocs: u32,
    locations: Vec<LocationLog>,
    comms: BTreeMap<CommId, CommGroup>,
    calltree: CallTree,
    completion_of: BTreeMap<EventRef, EventRef>,
    request_of: BTreeMap<EventRef, EventRef>,
    enclosing_enter: BTreeMap<EventRef, EventRef>,
}

impl Trace {
    pub fn new(rank: Rank, nprocs: u32) -> Trace {
        Trace {
            rank,
            nprocs,
            locations: Vec::new(),
            comms: BTreeMap::new(),
            calltree: CallTree::new(),
            completion_of: BTreeMap::new(),
            request_of: BTreeMap::new(),
            enclosing_enter: BTreeMap::new(),
        }
    }

    pub fn add_location(&mut self, events: Vec<Event>) -> LocationId {
        let loc = LocationId(self.locations.len() as u32);
        self.locations.push(LocationLog { loc, events });
        loc
    }

    pub fn define_comm(&mut self, id: CommId, members: Vec<Rank>) {
        self.comms.insert(id, CommGroup::new(id, members));
    }

    pub fn comm(&self, id: CommId) -> Result<&CommGroup> {
        self.comms.get(&id).ok_or(TraceError::UnknownComm(id))
    }

    pub fn calltree(&self) -> &CallTree {
        &self.calltree
    }

    pub fn num_locations(&self) -> u32 {
        self.locations.len() as u32
    }

    pub fn location(&self, loc: LocationId) -> &LocationLog {
        &self.locations[loc.0 as usize]
    }

    pub fn event(&self, e: EventRef) -> &Event {
        &self.locations[e.loc.0 as usize].events[e.index as usize]
    }

    pub fn num_events(&self, loc: LocationId) -> u32 {
        self.locations[loc.0 as usize].events.len() as u32
    }

    pub fn next(&self, e: EventRef) -> Option<EventRef> {
        if (e.index as usize) + 1 < self.locations[e.loc.0 as usize].events.len() {
            Some(EventRef::new(e.loc, e.index + 1))
        } else {
            None
        }
    }

    pub fn prev(&self, e: EventRef) -> Option<EventRef> {
        if e.index > 0 {
            Some(EventRef::new(e.loc, e.index - 1))
        } else {
            None
        }
    }

    /// The completion event matching a nonblocking request, if paired.
    pub fn completion(&self, request: EventRef) -> Option<EventRef> {
        self.completion_of.get(&request).copied()
    }

    /// The request event matching a nonblocking completion, if paired.
    pub fn request(&self, completion: EventRef) -> Option<EventRef> {
        self.request_of.get(&completion).copied()
    }

    /// The enter event of the region containing this event.
    pub fn enclosing_enter(&self, e: EventRef) -> Option<EventRef> {
        self.enclosing_enter.get(&e).copied()
    }

    /// Timestamp of the enter of the operation that produced this event,
    /// falling back to the event itself at depth 0.
    pub fn op_enter_time(&self, e: EventRef) -> Timestamp {
        match self.enclosing_enter(e) {
            Some(enter) => self.event(enter).time,
            None => self.event(e).time,
        }
    }

    /// Structural validation: enter/leave stack matching on every location
    /// (in parallel), then call-path assignment and request/completion
    /// pairing. Fatal on any structural defect; no stage may run after a
    /// failure here.
    pub fn validate(&mut self) -> Result<()> {
        self.locations
            .par_iter()
            .map(Self::check_nesting)
            .collect::<Result<Vec<_>>>()?;

        for i in 0..self.locations.len() {
            self.annotate_location(LocationId(i as u32));
        }
        Ok(())
    }

    fn check_nesting(log: &LocationLog) -> Result<()> {
        let mut depth: usize = 0;
        for (index, event) in log.events.iter().enumerate() {
            match event.kind {
                EventKind::Enter => depth += 1,
                EventKind::Leave => {
                    if depth == 0 {
                        return Err(TraceError::MismatchedLeave {
                            loc: log.loc,
                            index: index as u32,
                        });
                    }
                    depth -= 1;
                }
                EventKind::ThreadFork | EventKind::ThreadCreate => {
                    if depth == 0 {
                        return Err(TraceError::MissingStubAncestor {
                            loc: log.loc,
                            index: index as u32,
                        });
                    }
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(TraceError::UnbalancedNesting {
                loc: log.loc,
                depth,
            });
        }
        Ok(())
    }

    fn annotate_location(&mut self, loc: LocationId) {
        // (callpath, enter event) per open region
        let mut stack: Vec<(CallpathId, EventRef)> = Vec::new();
        let mut pending_send: BTreeMap<u64, EventRef> = BTreeMap::new();
        let mut pending_recv: BTreeMap<u64, EventRef> = BTreeMap::new();

        let num_events = self.locations[loc.0 as usize].events.len();
        for index in 0..num_events {
            let e = EventRef::new(loc, index as u32);
            let (kind, payload) = {
                let event = &self.locations[loc.0 as usize].events[index];
                (event.kind, event.payload.clone())
            };
            match kind {
                EventKind::Enter => {
                    let (region, callsite) = match payload {
                        Payload::Region { region, callsite } => (region, callsite),
                        _ => unreachable!("enter event without region payload"),
                    };
                    let parent = stack.last().map(|(cp, _)| *cp);
                    let cp = self.calltree.get_callpath(region, callsite, parent);
                    stack.push((cp, e));
                }
                EventKind::Leave => {
                    let (cp, enter) = stack.pop().unwrap();
                    self.enclosing_enter.insert(e, enter);
                    self.locations[loc.0 as usize].events[index].callpath = Some(cp);
                    continue;
                }
                EventKind::SendRequest | EventKind::RecvRequest => {
                    if let Payload::P2p {
                        request: Some(id), ..
                    } = payload
                    {
                        let pending = if kind == EventKind::SendRequest {
                            &mut pending_send
                        } else {
                            &mut pending_recv
                        };
                        pending.insert(id, e);
                    }
                }
                EventKind::SendComplete | EventKind::RecvComplete => {
                    if let Payload::P2p {
                        request: Some(id), ..
                    } = payload
                    {
                        let pending = if kind == EventKind::SendComplete {
                            &mut pending_send
                        } else {
                            &mut pending_recv
                        };
                        if let Some(req) = pending.remove(&id) {
                            self.completion_of.insert(req, e);
                            self.request_of.insert(e, req);
                        }
                    }
                }
                _ => {}
            }
            if let Some((cp, enter)) = stack.last() {
                self.locations[loc.0 as usize].events[index].callpath = Some(*cp);
                if kind != EventKind::Enter {
                    self.enclosing_enter.insert(e, *enter);
                }
            }
        }
        assert!(stack.is_empty()); // check_nesting ran first
    }
}
