// Copyright 2026 cowspace Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use cowspace_common::{
    error::{Error, Result},
    sub_counter,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify, RwLock};

use crate::{
    block_group::{BlockGroup, BlockGroupRef},
    external::DeviceLayout,
    profile::{BlockGroupFlags, ContentClass, ProfileSet, RaidProfile},
};

/// Whether a reservation may wait for space to be made available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushMode {
    /// Fail immediately if the bytes don't fit.
    NoFlush,
    /// Queue a ticket, allocate chunks and wait until the bytes are granted or the class is exhausted.
    Flush,
}

/// Escalation level of a chunk allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ChunkAllocForce {
    /// Allocate only if the class is nearly full.
    #[default]
    NoForce,
    /// Also allocate if free space drops below a small floor.
    Limited,
    /// Always allocate.
    Force,
}

#[derive(Debug)]
pub(crate) struct Ticket {
    bytes: u64,
    flush: FlushMode,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Default)]
pub(crate) struct SpaceInfoState {
    pub total: u64,
    pub used: u64,
    pub reserved: u64,
    pub pinned: u64,
    pub readonly: u64,
    pub zone_unusable: u64,
    pub may_use: u64,
    pub bytes_super: u64,

    pub disk_total: u64,
    pub disk_used: u64,

    pub max_extent_size: u64,

    pub chunk_alloc: bool,
    pub force_alloc: ChunkAllocForce,
    pub full: bool,

    pub avail_profiles: ProfileSet,
    pub ro_groups: Vec<Weak<BlockGroup>>,

    pub tickets: VecDeque<Ticket>,
}

impl SpaceInfoState {
    /// Bytes owned by somebody, excluding soft reservations.
    pub fn used_bytes(&self) -> u64 {
        self.used + self.reserved + self.pinned + self.readonly + self.bytes_super + self.zone_unusable
    }

    /// Bytes owned by somebody, including soft reservations.
    pub fn used_with_may_use(&self) -> u64 {
        self.used_bytes() + self.may_use
    }

    /// Whether nothing outstanding can free space any more.
    fn exhausted(&self) -> bool {
        self.full && self.pinned == 0 && self.reserved == 0 && self.may_use == 0
    }
}

/// Member groups of a space info, one list per redundancy profile.
#[derive(Debug)]
pub(crate) struct GroupLists {
    lists: [Vec<BlockGroupRef>; RaidProfile::COUNT],
}

impl Default for GroupLists {
    fn default() -> Self {
        Self {
            lists: std::array::from_fn(|_| vec![]),
        }
    }
}

impl GroupLists {
    pub fn list(&self, profile: RaidProfile) -> &[BlockGroupRef] {
        &self.lists[profile.index()]
    }

    pub fn push(&mut self, group: BlockGroupRef) {
        self.lists[group.profile().index()].push(group);
    }

    /// Returns `true` if the profile list became empty.
    pub fn remove(&mut self, group: &BlockGroupRef) -> bool {
        let list = &mut self.lists[group.profile().index()];
        list.retain(|g| !Arc::ptr_eq(g, group));
        list.is_empty()
    }

    /// Groups of `first` followed by groups of every other profile.
    pub fn ordered_from(&self, first: RaidProfile) -> impl Iterator<Item = &BlockGroupRef> {
        self.lists[first.index()].iter().chain(
            RaidProfile::ALL
                .into_iter()
                .filter(move |p| *p != first)
                .flat_map(move |p| self.lists[p.index()].iter()),
        )
    }

    pub fn clear(&mut self) {
        self.lists.iter_mut().for_each(|l| l.clear());
    }
}

/// Aggregate accounting of one content class.
pub struct SpaceInfo {
    flags: BlockGroupFlags,
    name: &'static str,

    state: Mutex<SpaceInfoState>,
    pub(crate) groups: RwLock<GroupLists>,
    pub(crate) chunk_alloc_done: Notify,

    reclaim_threshold: AtomicU64,
    alloc_factor: AtomicU64,

    layout: Arc<dyn DeviceLayout>,
}

impl Debug for SpaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceInfo")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

impl SpaceInfo {
    pub(crate) fn new(flags: BlockGroupFlags, layout: Arc<dyn DeviceLayout>, reclaim_threshold: u64) -> Self {
        let name = if flags.is_mixed() {
            "mixed"
        } else {
            match ContentClass::of(flags) {
                ContentClass::Data => "data",
                ContentClass::Metadata => "metadata",
                ContentClass::System => "system",
            }
        };
        Self {
            flags,
            name,
            state: Mutex::new(SpaceInfoState::default()),
            groups: RwLock::new(GroupLists::default()),
            chunk_alloc_done: Notify::new(),
            reclaim_threshold: AtomicU64::new(reclaim_threshold),
            alloc_factor: AtomicU64::new(1),
            layout,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(class: ContentClass) -> Self {
        use crate::test_utils::MemoryDeviceLayout;
        Self::new(class.flag(), Arc::new(MemoryDeviceLayout::new(1, 0)), 0)
    }

    /// Content type flags of the class.
    pub fn flags(&self) -> BlockGroupFlags {
        self.flags
    }

    /// Name used in logs and stats.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SpaceInfoState> {
        self.state.lock()
    }

    /// Underused reclaim threshold, in percent of a group's length. 0 disables it.
    pub fn reclaim_threshold(&self) -> u64 {
        self.reclaim_threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn set_reclaim_threshold(&self, percent: u64) {
        self.reclaim_threshold.store(percent.min(100), Ordering::Relaxed);
    }

    pub(crate) fn set_alloc_factor(&self, factor: u64) {
        self.alloc_factor.store(factor.max(1), Ordering::Relaxed);
    }

    /// Whether `bytes` more may be promised beyond the class total, against unallocated device space.
    ///
    /// Data never overcommits.
    pub(crate) fn can_overcommit(&self, state: &SpaceInfoState, bytes: u64, flush: FlushMode) -> bool {
        if self.flags.contains(BlockGroupFlags::DATA) {
            return false;
        }
        let factor = self.alloc_factor.load(Ordering::Relaxed).max(1);
        let mut avail = self.layout.unallocated_bytes() / factor;
        avail >>= match flush {
            FlushMode::Flush => 1,
            FlushMode::NoFlush => 3,
        };
        state.used_with_may_use() + bytes < state.total + avail
    }

    fn can_fit(&self, state: &SpaceInfoState, bytes: u64, flush: FlushMode) -> bool {
        state.used_with_may_use() + bytes <= state.total || self.can_overcommit(state, bytes, flush)
    }

    /// Grant queued tickets in order while they fit.
    pub(crate) fn try_grant_tickets(&self, state: &mut SpaceInfoState) {
        // Waiters that gave up must not hold the queue.
        state.tickets.retain(|ticket| !ticket.tx.is_closed());
        loop {
            let Some(ticket) = state.tickets.front() else {
                break;
            };
            let (bytes, flush) = (ticket.bytes, ticket.flush);
            if !self.can_fit(state, bytes, flush) {
                break;
            }
            let Some(ticket) = state.tickets.pop_front() else {
                break;
            };
            state.may_use += bytes;
            if ticket.tx.send(Ok(())).is_err() {
                // The waiter is gone.
                state.may_use -= bytes;
            } else {
                tracing::trace!(class = self.name, bytes, "[space info]: ticket granted");
            }
        }
    }

    /// Fail every queued ticket once the class is full and nothing outstanding can free space.
    pub(crate) fn fail_tickets_if_exhausted(&self, state: &mut SpaceInfoState) {
        if state.tickets.is_empty() || !state.exhausted() {
            return;
        }
        let available = state.total.saturating_sub(state.used_with_may_use());
        tracing::debug!(
            class = self.name,
            tickets = state.tickets.len(),
            "[space info]: class exhausted, failing tickets"
        );
        for ticket in state.tickets.drain(..) {
            let _ = ticket.tx.send(Err(Error::no_space(self.name, ticket.bytes, available)));
        }
    }

    /// Re-evaluate queued tickets after space was freed or added.
    pub(crate) fn settle_tickets(&self, state: &mut SpaceInfoState) {
        self.try_grant_tickets(state);
        self.fail_tickets_if_exhausted(state);
    }

    /// Soft-reserve `bytes`, or queue a ticket for them.
    pub(crate) fn admit(self: &Arc<Self>, bytes: u64, flush: FlushMode) -> Admission {
        let mut state = self.state.lock();
        state.tickets.retain(|ticket| !ticket.tx.is_closed());
        let queue_empty = state.tickets.is_empty() || flush == FlushMode::NoFlush;
        if queue_empty && self.can_fit(&state, bytes, flush) {
            state.may_use += bytes;
            return Admission::Granted;
        }
        match flush {
            FlushMode::NoFlush => Admission::Refused {
                available: state.total.saturating_sub(state.used_with_may_use()),
            },
            FlushMode::Flush => {
                let (tx, rx) = oneshot::channel();
                state.tickets.push_back(Ticket { bytes, flush, tx });
                Admission::Queued(PendingTicket {
                    rx: Some(rx),
                    verdict: None,
                    bytes,
                    space_info: self.clone(),
                })
            }
        }
    }

    /// Return soft-reserved bytes to the class.
    pub(crate) fn release_may_use(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        sub_counter!(state.may_use, bytes, "space_info.may_use");
        self.settle_tickets(&mut state);
    }

    /// Account a group joining the class. The caller holds the membership lock exclusively.
    pub(crate) fn attach_group(&self, lists: &mut GroupLists, group: &BlockGroupRef) {
        lists.push(group.clone());

        let factor = group.profile().factor();
        let mut state = self.state.lock();
        let bg = group.state();
        state.total += group.length();
        state.used += bg.used;
        state.reserved += bg.reserved;
        state.pinned += bg.pinned;
        state.bytes_super += group.bytes_super();
        state.zone_unusable += bg.zone_unusable;
        state.disk_total += group.length() * factor;
        state.disk_used += bg.used * factor;
        state.avail_profiles |= group.profile().into();
        state.full = false;
        drop(bg);
        self.settle_tickets(&mut state);
    }

    /// Account a read-only, empty group leaving the class. The caller holds the membership lock exclusively.
    pub(crate) fn detach_group(&self, lists: &mut GroupLists, group: &BlockGroupRef) {
        let profile_gone = lists.remove(group);

        let factor = group.profile().factor();
        let mut state = self.state.lock();
        sub_counter!(state.total, group.length(), "space_info.total");
        sub_counter!(
            state.readonly,
            group.length() - group.bytes_super(),
            "space_info.readonly"
        );
        sub_counter!(state.bytes_super, group.bytes_super(), "space_info.bytes_super");
        sub_counter!(state.disk_total, group.length() * factor, "space_info.disk_total");
        if profile_gone {
            state.avail_profiles.remove(group.profile().into());
        }
        state
            .ro_groups
            .retain(|g| g.upgrade().is_some_and(|g| !Arc::ptr_eq(&g, group)));
    }

    /// A best-effort snapshot of the class counters.
    pub fn stats(&self) -> SpaceInfoStats {
        let state = self.state.lock();
        SpaceInfoStats {
            name: self.name.to_string(),
            flags: self.flags.bits(),
            total: state.total,
            used: state.used,
            reserved: state.reserved,
            pinned: state.pinned,
            readonly: state.readonly,
            zone_unusable: state.zone_unusable,
            may_use: state.may_use,
            bytes_super: state.bytes_super,
            disk_total: state.disk_total,
            disk_used: state.disk_used,
            max_extent_size: state.max_extent_size,
            full: state.full,
            chunk_alloc: state.chunk_alloc,
            tickets: state.tickets.len(),
            ro_groups: state.ro_groups.iter().filter(|g| g.strong_count() > 0).count(),
            reclaim_threshold: self.reclaim_threshold(),
        }
    }
}

pub(crate) enum Admission {
    Granted,
    Queued(PendingTicket),
    Refused { available: u64 },
}

/// A queued ticket.
///
/// Dropping it before the grant is handed over returns the granted bytes to the class.
#[derive(Debug)]
pub(crate) struct PendingTicket {
    rx: Option<oneshot::Receiver<Result<()>>>,
    verdict: Option<Result<()>>,
    bytes: u64,
    space_info: Arc<SpaceInfo>,
}

impl PendingTicket {
    fn poll_verdict(&mut self) {
        if self.verdict.is_some() {
            return;
        }
        let Some(rx) = self.rx.as_mut() else {
            return;
        };
        match rx.try_recv() {
            Ok(res) => self.verdict = Some(res),
            Err(oneshot::error::TryRecvError::Empty) => return,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.verdict = Some(Err(Error::no_space(self.space_info.name(), self.bytes, 0)))
            }
        }
        self.rx = None;
    }

    /// Whether the ticket has been granted.
    pub fn is_granted(&mut self) -> bool {
        self.poll_verdict();
        matches!(self.verdict, Some(Ok(())))
    }

    /// Wait until the ticket is granted or failed. On success the granted bytes belong to the caller.
    pub async fn wait(mut self) -> Result<()> {
        if let Some(verdict) = self.verdict.take() {
            return verdict;
        }
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::no_space(self.space_info.name(), self.bytes, 0));
        };
        let res = match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::no_space(self.space_info.name(), self.bytes, 0)),
        };
        self.rx = None;
        res
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        let granted = match self.rx.take() {
            Some(mut rx) => {
                rx.close();
                matches!(rx.try_recv(), Ok(Ok(())))
            }
            None => matches!(self.verdict, Some(Ok(()))),
        };
        if granted {
            self.space_info.release_may_use(self.bytes);
        } else {
            // Tickets queued behind this one may fit now.
            let mut state = self.space_info.state.lock();
            self.space_info.settle_tickets(&mut state);
        }
    }
}

/// Soft-reserved bytes of a content class, not yet attached to any block group.
///
/// Dropping the reservation returns the unconsumed bytes to the class.
#[derive(Debug)]
pub struct SpaceReservation {
    space_info: Arc<SpaceInfo>,
    class: ContentClass,
    bytes: u64,
}

impl SpaceReservation {
    pub(crate) fn new(space_info: Arc<SpaceInfo>, class: ContentClass, bytes: u64) -> Self {
        Self {
            space_info,
            class,
            bytes,
        }
    }

    /// Remaining reserved bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Content class of the reservation.
    pub fn class(&self) -> ContentClass {
        self.class
    }

    pub(crate) fn space_info(&self) -> &Arc<SpaceInfo> {
        &self.space_info
    }

    /// Mark `bytes` as consumed. The caller already moved them out of the class's may-use bytes.
    pub(crate) fn consume(&mut self, bytes: u64) {
        self.bytes -= bytes.min(self.bytes);
    }

    /// Return `bytes` of the reservation to the class early.
    pub fn shrink(&mut self, bytes: u64) {
        let bytes = bytes.min(self.bytes);
        self.bytes -= bytes;
        self.space_info.release_may_use(bytes);
    }
}

impl Drop for SpaceReservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.space_info.release_may_use(self.bytes);
        }
    }
}

/// A serializable snapshot of a space info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfoStats {
    /// Class name.
    pub name: String,
    /// Raw content type flag bits.
    pub flags: u64,
    /// Bytes of all member groups.
    pub total: u64,
    /// Committed bytes.
    pub used: u64,
    /// Allocated, not yet committed bytes.
    pub reserved: u64,
    /// Bytes freed in the running transaction.
    pub pinned: u64,
    /// Free bytes of read-only groups.
    pub readonly: u64,
    /// Zone unusable bytes.
    pub zone_unusable: u64,
    /// Soft-reserved bytes.
    pub may_use: u64,
    /// Superblock copy bytes.
    pub bytes_super: u64,
    /// Device bytes of all member groups.
    pub disk_total: u64,
    /// Device bytes of committed data.
    pub disk_used: u64,
    /// Largest free extent seen by the last failed search, 0 if unknown.
    pub max_extent_size: u64,
    /// Whether chunk allocation for the class has failed.
    pub full: bool,
    /// Whether a chunk allocation is in flight.
    pub chunk_alloc: bool,
    /// Queued reservation tickets.
    pub tickets: usize,
    /// Read-only member groups.
    pub ro_groups: usize,
    /// Underused reclaim threshold in percent.
    pub reclaim_threshold: u64,
}

#[cfg(test)]
mod tests {
    use cowspace_common::{error::ErrorKind, units::MIB};

    use super::*;
    use crate::test_utils::MemoryDeviceLayout;

    fn space_info(class: ContentClass, total: u64, unallocated: u64) -> Arc<SpaceInfo> {
        let si = Arc::new(SpaceInfo::new(
            class.flag(),
            Arc::new(MemoryDeviceLayout::new(1, unallocated)),
            0,
        ));
        si.state().total = total;
        si
    }

    #[test_log::test]
    fn test_admit_fast_path_and_refusal() {
        let si = space_info(ContentClass::Data, 100 * MIB, 0);
        assert!(matches!(si.admit(60 * MIB, FlushMode::NoFlush), Admission::Granted));
        assert!(matches!(
            si.admit(60 * MIB, FlushMode::NoFlush),
            Admission::Refused { available } if available == 40 * MIB
        ));
        assert_eq!(si.stats().may_use, 60 * MIB);
    }

    #[test_log::test]
    fn test_metadata_overcommit_is_strict() {
        // 800 MiB unallocated, NoFlush keeps 1/8 of it: 100 MiB.
        let si = space_info(ContentClass::Metadata, 100 * MIB, 800 * MIB);
        let state = si.state();
        assert!(si.can_overcommit(&state, 199 * MIB, FlushMode::NoFlush));
        assert!(!si.can_overcommit(&state, 200 * MIB, FlushMode::NoFlush));
        // Flushing keeps 1/2 of it.
        assert!(si.can_overcommit(&state, 499 * MIB, FlushMode::Flush));
        drop(state);

        let data = space_info(ContentClass::Data, 100 * MIB, 800 * MIB);
        let state = data.state();
        assert!(!data.can_overcommit(&state, MIB, FlushMode::Flush));
    }

    #[test_log::test(tokio::test)]
    async fn test_tickets_granted_in_order() {
        let si = space_info(ContentClass::Data, 100 * MIB, 0);
        let reservation = match si.admit(100 * MIB, FlushMode::Flush) {
            Admission::Granted => SpaceReservation::new(si.clone(), ContentClass::Data, 100 * MIB),
            _ => panic!("expected fast path"),
        };

        let Admission::Queued(mut a) = si.admit(60 * MIB, FlushMode::Flush) else {
            panic!("expected ticket");
        };
        let Admission::Queued(mut b) = si.admit(10 * MIB, FlushMode::Flush) else {
            panic!("expected ticket");
        };
        // A later small request must not jump the queue.
        assert!(!b.is_granted());

        drop(reservation);
        assert!(a.is_granted());
        assert!(b.is_granted());
        assert_eq!(si.stats().may_use, 70 * MIB);
        assert_eq!(si.stats().tickets, 0);

        // Granted tickets hand their bytes over to the caller.
        a.wait().await.unwrap();
        drop(b);
        assert_eq!(si.stats().may_use, 60 * MIB);
        si.release_may_use(60 * MIB);
        assert_eq!(si.stats().may_use, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_dropped_ticket_returns_bytes() {
        let si = space_info(ContentClass::Data, 100 * MIB, 0);
        let Admission::Granted = si.admit(100 * MIB, FlushMode::Flush) else {
            panic!("expected fast path");
        };
        let Admission::Queued(ticket) = si.admit(50 * MIB, FlushMode::Flush) else {
            panic!("expected ticket");
        };
        drop(ticket);

        si.release_may_use(100 * MIB);
        assert_eq!(si.stats().may_use, 0);
        assert_eq!(si.stats().tickets, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_abandoned_ticket_does_not_block_queue() {
        let si = space_info(ContentClass::Data, 100 * MIB, 0);
        let Admission::Granted = si.admit(60 * MIB, FlushMode::Flush) else {
            panic!("expected fast path");
        };
        let Admission::Queued(big) = si.admit(50 * MIB, FlushMode::Flush) else {
            panic!("expected ticket");
        };
        let Admission::Queued(mut small) = si.admit(10 * MIB, FlushMode::Flush) else {
            panic!("expected ticket");
        };
        assert!(!small.is_granted());

        // The waiter of the head ticket gives up.
        drop(big);
        assert!(small.is_granted());
        assert_eq!(si.stats().tickets, 0);
        assert_eq!(si.stats().may_use, 70 * MIB);

        // A closed ticket left in the queue does not send new requests behind it.
        let (tx, rx) = oneshot::channel();
        si.state().tickets.push_back(Ticket {
            bytes: 50 * MIB,
            flush: FlushMode::Flush,
            tx,
        });
        drop(rx);
        assert!(matches!(si.admit(10 * MIB, FlushMode::Flush), Admission::Granted));
        assert_eq!(si.stats().tickets, 0);
        assert_eq!(si.stats().may_use, 80 * MIB);
        small.wait().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_exhausted_class_fails_tickets() {
        let si = space_info(ContentClass::Data, 0, 0);
        let Admission::Queued(ticket) = si.admit(MIB, FlushMode::Flush) else {
            panic!("expected ticket");
        };
        {
            let mut state = si.state();
            state.full = true;
            si.settle_tickets(&mut state);
        }
        let err = ticket.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }
}
