use std::collections::VecDeque;

use tokio::time::Instant;

use crate::host::{Cid, Transport};
use crate::util::Timer;

use super::*;

/// Channel transaction slot. At most one request is outstanding per channel
/// ([Vol 3] Part F, Section 3.3.2).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum Slot {
    #[default]
    Idle,
    Busy(ReqId),
    /// Sentinel left by a cancelled request. The late response is discarded.
    Cancelled(Opcode),
}

/// ATT channel ([Vol 3] Part F, Section 3.2.11).
#[derive(Debug)]
pub(crate) struct Chan<T: Transport> {
    pub cid: Cid,
    pub enhanced: bool,
    pub rx_mtu: u16,
    pub tx_mtu: u16,
    pub slot: Slot,
    /// Same-channel responses and confirmations.
    pub queue: VecDeque<Buf<T>>,
    /// Transport returned `WouldBlock`.
    pub blocked: bool,
    /// Transaction timeout.
    pub timer: Timer,
}

impl<T: Transport> Chan<T> {
    /// Creates a new channel.
    #[must_use]
    pub fn new(cid: Cid, enhanced: bool, rx_mtu: u16, tx_mtu: u16) -> Self {
        Self {
            cid,
            enhanced,
            rx_mtu,
            tx_mtu,
            slot: Slot::Idle,
            queue: VecDeque::new(),
            blocked: false,
            timer: Timer::default(),
        }
    }

    /// Updates channel MTUs.
    #[inline]
    pub fn set_mtu(&mut self, rx_mtu: u16, tx_mtu: u16) {
        self.rx_mtu = rx_mtu.max(DEFAULT_MTU);
        self.tx_mtu = tx_mtu.max(DEFAULT_MTU);
    }

    /// Returns whether a new request can be claimed.
    #[inline(always)]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.slot == Slot::Idle
    }

    /// Returns the in-flight request.
    #[inline]
    #[must_use]
    pub fn req(&self) -> Option<ReqId> {
        match self.slot {
            Slot::Busy(id) => Some(id),
            Slot::Idle | Slot::Cancelled(_) => None,
        }
    }

    /// Frees the transaction slot and stops the timer.
    #[inline]
    pub fn release(&mut self) {
        self.slot = Slot::Idle;
        self.timer.stop();
    }

    /// Returns whether the transaction timer expired.
    #[inline]
    pub fn expired(&mut self, now: Instant) -> bool {
        self.timer.expire(now)
    }

    /// Empties the channel, returning the in-flight request and queued
    /// buffers.
    pub fn drain(mut self) -> (Option<ReqId>, Vec<Buf<T>>) {
        let req = self.req();
        self.release();
        (req, self.queue.drain(..).collect())
    }
}
