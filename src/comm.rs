use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use log::warn;

use crate::state::{Rank, Timestamp};

pub type Result<T> = std::result::Result<T, CommError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// Rank is out of range for this communicator.
    InvalidRank(Rank),
    /// Element count mismatch in a vector reduction.
    SizeMismatch { expected: usize, actual: usize },
    /// The root did not supply a value for a rooted collective.
    MissingRootValue,
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::InvalidRank(rank) => write!(f, "invalid rank {}", rank),
            CommError::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {}, got {}", expected, actual)
            }
            CommError::MissingRootValue => write!(f, "root value missing in rooted collective"),
        }
    }
}

impl std::error::Error for CommError {}

/// A `(time, rank)` pair with MAXLOC/MINLOC reduction semantics: ties are
/// broken toward the lower rank, matching MPI.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TimeRank {
    pub time: Timestamp,
    pub rank: Rank,
}

impl TimeRank {
    pub fn new(time: Timestamp, rank: Rank) -> TimeRank {
        TimeRank { time, rank }
    }

    pub fn maxloc(self, other: TimeRank) -> TimeRank {
        if other.time.0 > self.time.0 || (other.time.0 == self.time.0 && other.rank < self.rank) {
            other
        } else {
            self
        }
    }

    pub fn minloc(self, other: TimeRank) -> TimeRank {
        if other.time.0 < self.time.0 || (other.time.0 == self.time.0 && other.rank < self.rank) {
            other
        } else {
            self
        }
    }
}

/// Cross-rank timing aggregate of one collective instance, computed via
/// MAXLOC/MINLOC reductions over the communicator's participants. All ranks
/// are global.
#[derive(Debug, Copy, Clone)]
pub struct CollectiveInfo {
    pub my: TimeRank,
    pub root: TimeRank,
    pub latest: TimeRank,
    pub earliest: TimeRank,
    pub earliest_end: TimeRank,
}

/// Handle for an outstanding nonblocking analysis-metadata send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    seq: u64,
    key: MailboxKey,
}

/// The communication seam of the analysis: point-to-point transfer of opaque
/// analysis payloads, collectives with custom `(time, rank)` reduction
/// semantics, and group membership queries. Every rank argument is local to
/// this communicator's group.
///
/// Collectives block until every member arrives; they are the only
/// suspension points of a replay stage. Reductions always use distinct
/// input and output buffers.
pub trait Communicator<T: Clone + Send>: Send + Sized {
    fn rank(&self) -> Rank;
    fn size(&self) -> u32;
    fn global_rank(&self, local: Rank) -> Rank;
    fn local_rank(&self, global: Rank) -> Option<Rank>;

    /// Nonblocking send of an analysis payload. The returned request stays
    /// valid until tested as delivered or cancelled.
    fn send(&self, dest: Rank, tag: u32, value: T) -> Result<SendRequest>;
    /// Blocking receive from a specific source and tag.
    fn recv(&self, src: Rank, tag: u32) -> Result<T>;
    /// True once the payload has been received by the destination.
    fn test(&self, req: &SendRequest) -> bool;
    /// Withdraw an undelivered send. True if the payload was still queued.
    fn cancel(&self, req: &SendRequest) -> bool;

    fn barrier(&self);
    /// Rooted broadcast; the root supplies `Some(value)`.
    fn broadcast(&self, root: Rank, value: Option<T>) -> Result<T>;
    /// Rooted gather in local-rank order; only the root gets the vector.
    fn gather(&self, root: Rank, value: T) -> Result<Option<Vec<T>>>;
    /// Rooted scatter; the root supplies one value per member.
    fn scatter(&self, root: Rank, values: Option<Vec<T>>) -> Result<T>;
    fn allreduce_maxloc(&self, value: TimeRank) -> TimeRank;
    fn allreduce_minloc(&self, value: TimeRank) -> TimeRank;
    /// Element-wise sum of equally sized vectors at the root.
    fn reduce_sum(&self, root: Rank, values: Vec<f64>) -> Result<Option<Vec<f64>>>;

    /// Sub-communicator over the given global ranks; every member must call
    /// with the identical list.
    fn split(&self, members: Vec<Rank>) -> Result<Self>;
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

type MailboxKey = (u64 /* ctx */, u32 /* dest */, u32 /* src */, u32 /* tag */);

#[derive(Debug)]
struct Envelope<T> {
    seq: u64,
    value: T,
}

#[derive(Debug)]
struct Mailboxes<T> {
    next_seq: u64,
    queues: BTreeMap<MailboxKey, VecDeque<Envelope<T>>>,
    delivered: BTreeSet<u64>,
    cancelled: BTreeSet<u64>,
}

impl<T> Default for Mailboxes<T> {
    fn default() -> Self {
        Mailboxes {
            next_seq: 0,
            queues: BTreeMap::new(),
            delivered: BTreeSet::new(),
            cancelled: BTreeSet::new(),
        }
    }
}

/// Reusable allgather cell: every member deposits a value, everyone leaves
/// with the full vector. Generation counted so back-to-back rounds cannot
/// overlap; waiting is condvar based throughout.
#[derive(Debug)]
struct ExchangeCell<V> {
    state: Mutex<ExchangeState<V>>,
    cv: Condvar,
}

#[derive(Debug)]
struct ExchangeState<V> {
    values: Vec<Option<V>>,
    result: Vec<V>,
    arrived: u32,
    departed: u32,
    full: bool,
}

impl<V: Clone> ExchangeCell<V> {
    fn new(n: u32) -> ExchangeCell<V> {
        ExchangeCell {
            state: Mutex::new(ExchangeState {
                values: (0..n).map(|_| None).collect(),
                result: Vec::new(),
                arrived: 0,
                departed: 0,
                full: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn exchange(&self, index: u32, n: u32, value: V) -> Vec<V> {
        let mut st = self.state.lock().unwrap();
        // A previous round may still be draining
        while st.full {
            st = self.cv.wait(st).unwrap();
        }
        st.values[index as usize] = Some(value);
        st.arrived += 1;
        if st.arrived == n {
            st.result = st.values.iter_mut().map(|v| v.take().unwrap()).collect();
            st.full = true;
            self.cv.notify_all();
        } else {
            while !st.full {
                st = self.cv.wait(st).unwrap();
            }
        }
        let out = st.result[..].to_vec();
        st.departed += 1;
        if st.departed == n {
            st.arrived = 0;
            st.departed = 0;
            st.full = false;
            st.result.clear();
            self.cv.notify_all();
        }
        out
    }
}

#[derive(Debug)]
struct Context<T> {
    id: u64,
    data_cell: ExchangeCell<Option<T>>,
    timerank_cell: ExchangeCell<TimeRank>,
    vec_cell: ExchangeCell<Vec<f64>>,
    unit_cell: ExchangeCell<()>,
}

impl<T: Clone> Context<T> {
    fn new(id: u64, n: u32) -> Context<T> {
        Context {
            id,
            data_cell: ExchangeCell::new(n),
            timerank_cell: ExchangeCell::new(n),
            vec_cell: ExchangeCell::new(n),
            unit_cell: ExchangeCell::new(n),
        }
    }
}

#[derive(Debug)]
struct Shared<T> {
    mailboxes: Mutex<Mailboxes<T>>,
    mail_cv: Condvar,
    contexts: Mutex<BTreeMap<(u64, Vec<Rank>), Arc<Context<T>>>>,
    next_ctx: Mutex<u64>,
}

/// In-process stand-in for the MPI collaborator: each rank of a job holds
/// one `LocalComm` over shared mailbox and collective state, typically one
/// analysis thread per rank.
#[derive(Debug)]
pub struct LocalComm<T> {
    shared: Arc<Shared<T>>,
    ctx: Arc<Context<T>>,
    my_local: Rank,
    members: Arc<Vec<Rank>>,
}

impl<T: Clone + Send> LocalComm<T> {
    /// Create communicators for a world of `nprocs` ranks, one per rank.
    pub fn world(nprocs: u32) -> Vec<LocalComm<T>> {
        let shared = Arc::new(Shared {
            mailboxes: Mutex::new(Mailboxes::default()),
            mail_cv: Condvar::new(),
            contexts: Mutex::new(BTreeMap::new()),
            next_ctx: Mutex::new(1),
        });
        let ctx = Arc::new(Context::new(0, nprocs));
        let members = Arc::new((0..nprocs).map(Rank).collect::<Vec<_>>());
        (0..nprocs)
            .map(|r| LocalComm {
                shared: Arc::clone(&shared),
                ctx: Arc::clone(&ctx),
                my_local: Rank(r),
                members: Arc::clone(&members),
            })
            .collect()
    }

    fn check_local(&self, rank: Rank) -> Result<()> {
        if rank.0 < self.size() {
            Ok(())
        } else {
            Err(CommError::InvalidRank(rank))
        }
    }
}

impl<T: Clone + Send> Communicator<T> for LocalComm<T> {
    fn rank(&self) -> Rank {
        self.my_local
    }

    fn size(&self) -> u32 {
        self.members.len() as u32
    }

    fn global_rank(&self, local: Rank) -> Rank {
        self.members[local.0 as usize]
    }

    fn local_rank(&self, global: Rank) -> Option<Rank> {
        self.members
            .iter()
            .position(|r| *r == global)
            .map(|i| Rank(i as u32))
    }

    fn send(&self, dest: Rank, tag: u32, value: T) -> Result<SendRequest> {
        self.check_local(dest)?;
        let key = (
            self.ctx.id,
            self.global_rank(dest).0,
            self.global_rank(self.my_local).0,
            tag,
        );
        let mut boxes = self.shared.mailboxes.lock().unwrap();
        let seq = boxes.next_seq;
        boxes.next_seq += 1;
        boxes
            .queues
            .entry(key)
            .or_default()
            .push_back(Envelope { seq, value });
        self.shared.mail_cv.notify_all();
        Ok(SendRequest { seq, key })
    }

    fn recv(&self, src: Rank, tag: u32) -> Result<T> {
        self.check_local(src)?;
        let key = (
            self.ctx.id,
            self.global_rank(self.my_local).0,
            self.global_rank(src).0,
            tag,
        );
        let mut boxes = self.shared.mailboxes.lock().unwrap();
        loop {
            if let Some(queue) = boxes.queues.get_mut(&key) {
                if let Some(envelope) = queue.pop_front() {
                    boxes.delivered.insert(envelope.seq);
                    return Ok(envelope.value);
                }
            }
            boxes = self.shared.mail_cv.wait(boxes).unwrap();
        }
    }

    fn test(&self, req: &SendRequest) -> bool {
        let boxes = self.shared.mailboxes.lock().unwrap();
        boxes.delivered.contains(&req.seq)
    }

    fn cancel(&self, req: &SendRequest) -> bool {
        let mut boxes = self.shared.mailboxes.lock().unwrap();
        if boxes.delivered.contains(&req.seq) || boxes.cancelled.contains(&req.seq) {
            return false;
        }
        let mut removed = false;
        if let Some(queue) = boxes.queues.get_mut(&req.key) {
            let before = queue.len();
            queue.retain(|e| e.seq != req.seq);
            removed = queue.len() != before;
        }
        if removed {
            boxes.cancelled.insert(req.seq);
        }
        removed
    }

    fn barrier(&self) {
        self.ctx.unit_cell.exchange(self.my_local.0, self.size(), ());
    }

    fn broadcast(&self, root: Rank, value: Option<T>) -> Result<T> {
        self.check_local(root)?;
        let contribution = if self.my_local == root { value } else { None };
        let all = self
            .ctx
            .data_cell
            .exchange(self.my_local.0, self.size(), contribution);
        all[root.0 as usize].clone().ok_or(CommError::MissingRootValue)
    }

    fn gather(&self, root: Rank, value: T) -> Result<Option<Vec<T>>> {
        self.check_local(root)?;
        let all = self
            .ctx
            .data_cell
            .exchange(self.my_local.0, self.size(), Some(value));
        if self.my_local == root {
            Ok(Some(all.into_iter().map(|v| v.unwrap()).collect()))
        } else {
            Ok(None)
        }
    }

    fn scatter(&self, root: Rank, values: Option<Vec<T>>) -> Result<T> {
        self.check_local(root)?;
        let n = self.size() as usize;
        if self.my_local == root {
            let values = values.ok_or(CommError::MissingRootValue)?;
            if values.len() != n {
                return Err(CommError::SizeMismatch {
                    expected: n,
                    actual: values.len(),
                });
            }
            // Internal tag space; user tags never reach u32::MAX
            let mut mine = None;
            for (i, value) in values.into_iter().enumerate() {
                if i == root.0 as usize {
                    mine = Some(value);
                } else {
                    self.send(Rank(i as u32), u32::MAX, value)?;
                }
            }
            Ok(mine.unwrap())
        } else {
            self.recv(root, u32::MAX)
        }
    }

    fn allreduce_maxloc(&self, value: TimeRank) -> TimeRank {
        let all = self
            .ctx
            .timerank_cell
            .exchange(self.my_local.0, self.size(), value);
        all.into_iter().reduce(TimeRank::maxloc).unwrap()
    }

    fn allreduce_minloc(&self, value: TimeRank) -> TimeRank {
        let all = self
            .ctx
            .timerank_cell
            .exchange(self.my_local.0, self.size(), value);
        all.into_iter().reduce(TimeRank::minloc).unwrap()
    }

    fn reduce_sum(&self, root: Rank, values: Vec<f64>) -> Result<Option<Vec<f64>>> {
        self.check_local(root)?;
        let len = values.len();
        let all = self
            .ctx
            .vec_cell
            .exchange(self.my_local.0, self.size(), values);
        if self.my_local != root {
            return Ok(None);
        }
        let mut sum = vec![0.0; len];
        for contribution in &all {
            if contribution.len() != len {
                return Err(CommError::SizeMismatch {
                    expected: len,
                    actual: contribution.len(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(contribution) {
                *acc += v;
            }
        }
        Ok(Some(sum))
    }

    fn split(&self, members: Vec<Rank>) -> Result<LocalComm<T>> {
        let my_global = self.global_rank(self.my_local);
        let my_local = members
            .iter()
            .position(|r| *r == my_global)
            .map(|i| Rank(i as u32))
            .ok_or(CommError::InvalidRank(my_global))?;
        let mut contexts = self.shared.contexts.lock().unwrap();
        let ctx = contexts
            .entry((self.ctx.id, members.clone()))
            .or_insert_with(|| {
                let mut next = self.shared.next_ctx.lock().unwrap();
                let id = *next;
                *next += 1;
                Arc::new(Context::new(id, members.len() as u32))
            })
            .clone();
        drop(contexts);
        Ok(LocalComm {
            shared: Arc::clone(&self.shared),
            ctx,
            my_local,
            members: Arc::new(members),
        })
    }
}

/// Bounded pool of outstanding analysis-metadata sends. Drained
/// opportunistically whenever it fills up and forcibly at end of replay;
/// payloads the partner never collected are cancelled with a warning, since
/// residue is expected when a partner takes a different path through the
/// analysis.
#[derive(Debug)]
pub struct RequestPool {
    capacity: usize,
    outstanding: VecDeque<SendRequest>,
}

impl RequestPool {
    pub fn new(capacity: usize) -> RequestPool {
        RequestPool {
            capacity,
            outstanding: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Track a new outstanding send, draining delivered ones first if the
    /// pool is at capacity.
    pub fn record<T: Clone + Send, C: Communicator<T>>(&mut self, comm: &C, req: SendRequest) {
        if self.outstanding.len() >= self.capacity {
            self.drain(comm);
        }
        self.outstanding.push_back(req);
    }

    /// Drop every request whose payload has been received.
    pub fn drain<T: Clone + Send, C: Communicator<T>>(&mut self, comm: &C) {
        self.outstanding.retain(|req| !comm.test(req));
    }

    /// End-of-replay cleanup: cancel whatever is still in flight.
    pub fn finalize<T: Clone + Send, C: Communicator<T>>(&mut self, comm: &C) {
        self.drain(comm);
        let mut cancelled = 0usize;
        while let Some(req) = self.outstanding.pop_front() {
            if comm.cancel(&req) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(
                "rank {}: cancelled {} unreceived analysis message(s) at shutdown",
                comm.rank(),
                cancelled
            );
        }
    }
}
