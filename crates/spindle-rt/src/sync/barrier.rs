// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reusable N-party barrier.

use parking_lot::Mutex;

use crate::context::Cx;
use crate::error::Cancelled;
use crate::event::Event;

pub struct Barrier {
    parties: usize,
    state: Mutex<Round>,
}

struct Round {
    arrived: usize,
    release: Event,
}

impl Barrier {
    /// A barrier of zero parties behaves like one of one.
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(Round {
                arrived: 0,
                release: Event::new(),
            }),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Arrival index within the current round and the round's release event.
    fn arrive(&self) -> (usize, Event) {
        let mut round = self.state.lock();
        let index = round.arrived;
        round.arrived += 1;
        let release = round.release.clone();
        if round.arrived == self.parties {
            release.set();
            round.arrived = 0;
            round.release = Event::new();
        }
        (index, release)
    }

    /// Wait for the round to fill. Returns this caller's arrival index,
    /// `0..parties`. A cancelled waiter still counts as arrived.
    pub async fn wait(&self, cx: &Cx) -> Result<usize, Cancelled> {
        let (index, release) = self.arrive();
        release.wait(cx, None).await?;
        Ok(index)
    }
}
