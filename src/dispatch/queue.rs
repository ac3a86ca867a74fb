//! Per-backend admission control.
//!
//! `DispatchQueue` is the bookkeeping half of the dispatcher: it counts
//! in-flight operations against a limit and parks the overflow in a FIFO
//! backlog. It never runs anything itself; callers act on the returned
//! [`Admission`] and [`Release`] values.
//!
//! # Slot accounting
//!
//! Every `Admitted` result charges one slot. Every completed unit of work must
//! call [`DispatchQueue::release`] exactly once. A release either hands the
//! slot to the next live backlog entry (`Handoff`, count unchanged) or gives
//! it back (`Freed`, count decremented). Entries whose requester is gone are
//! dropped inside the same release call and never consume a slot of their own.

use std::collections::VecDeque;
use std::fmt::Display;
use tracing::{debug, error, warn};

/// Result of offering work to the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<P> {
    /// A slot was charged; the caller must dispatch the payload on a new task.
    Admitted(P),
    /// The limit is reached; the payload now sits in the backlog.
    Queued,
}

/// Result of giving a slot back.
#[derive(Debug, PartialEq, Eq)]
pub enum Release<H, P> {
    /// The slot moved to this requester, which must process the payload.
    Handoff { requester: H, payload: P },
    /// No live backlog entry; the slot was returned.
    Freed,
    /// Release without a charged slot. Indicates a pairing bug; nothing changed.
    Underflow,
}

/// A request parked while the backend was saturated.
#[derive(Debug)]
pub struct BacklogEntry<K, P> {
    pub requester: K,
    pub payload: P,
}

#[derive(Debug)]
pub struct DispatchQueue<K, P> {
    in_flight: usize,
    /// 0 means unlimited.
    limit: usize,
    backlog: VecDeque<BacklogEntry<K, P>>,
}

impl<K: Display, P> DispatchQueue<K, P> {
    pub fn new(limit: usize) -> Self {
        Self {
            in_flight: 0,
            limit,
            backlog: VecDeque::new(),
        }
    }

    /// Charge a slot for `payload`, or park it when the limit is reached.
    pub fn admit(&mut self, requester: K, payload: P) -> Admission<P> {
        if self.limit > 0 && self.in_flight >= self.limit {
            debug!(
                requester = %requester,
                in_flight = self.in_flight,
                backlog = self.backlog.len() + 1,
                "Backend saturated, request queued"
            );
            self.backlog.push_back(BacklogEntry { requester, payload });
            return Admission::Queued;
        }
        self.in_flight += 1;
        Admission::Admitted(payload)
    }

    /// Give back the slot of one completed unit of work.
    ///
    /// `resolve` maps a backlog requester to a live handle; `None` means the
    /// requester was torn down and its entry is skipped.
    pub fn release<H>(&mut self, mut resolve: impl FnMut(&K) -> Option<H>) -> Release<H, P> {
        if self.in_flight == 0 {
            error!(
                backlog = self.backlog.len(),
                "In-flight count would go negative; release without a charged slot"
            );
            return Release::Underflow;
        }

        while let Some(entry) = self.backlog.pop_front() {
            match resolve(&entry.requester) {
                Some(requester) => {
                    return Release::Handoff {
                        requester,
                        payload: entry.payload,
                    };
                }
                None => {
                    warn!(
                        requester = %entry.requester,
                        "Requester was removed while having a pending request"
                    );
                }
            }
        }

        self.in_flight -= 1;
        Release::Freed
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Nothing running and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.backlog.is_empty()
    }
}
