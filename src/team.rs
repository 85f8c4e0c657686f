use std::sync::{Condvar, Mutex};

use crate::state::Timestamp;

/// Coordination context shared by the analysis threads replaying one rank's
/// thread team. Each team construct (team begin, team end) is one exchange
/// round: every member publishes its entry timestamp and leaves with the
/// team-wide maximum. Rounds are kept apart by a fill/drain cycle on the
/// shared slot; all waiting is condvar based.
///
/// The context is reference counted and passed explicitly into the replay of
/// each team location; there is no process-global state.
#[derive(Debug)]
pub struct TeamContext {
    state: Mutex<TeamState>,
    cv: Condvar,
}

#[derive(Debug)]
struct TeamState {
    size: u32,
    arrived: u32,
    departed: u32,
    full: bool,
    max_enter: Timestamp,
}

impl TeamContext {
    pub fn new(size: u32) -> TeamContext {
        assert!(size > 0);
        TeamContext {
            state: Mutex::new(TeamState {
                size,
                arrived: 0,
                departed: 0,
                full: false,
                max_enter: Timestamp::ZERO,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.state.lock().unwrap().size
    }

    /// Publish this thread's entry time for the current construct and block
    /// until every team member has done the same; returns the maximum entry
    /// time across the team.
    pub fn publish_enter(&self, time: Timestamp) -> Timestamp {
        let mut st = self.state.lock().unwrap();
        while st.full {
            st = self.cv.wait(st).unwrap();
        }
        if st.arrived == 0 {
            st.max_enter = time;
        } else {
            st.max_enter = st.max_enter.max(time);
        }
        st.arrived += 1;
        if st.arrived == st.size {
            st.full = true;
            self.cv.notify_all();
        } else {
            while !st.full {
                st = self.cv.wait(st).unwrap();
            }
        }
        let max = st.max_enter;
        st.departed += 1;
        if st.departed == st.size {
            st.arrived = 0;
            st.departed = 0;
            st.full = false;
            self.cv.notify_all();
        }
        max
    }
}
