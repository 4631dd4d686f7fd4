//! Per-endpoint transfer slot pools
//!
//! Each endpoint gets a fixed number of slots carved out of one contiguous
//! buffer. Slots move through an explicit state machine:
//!
//! ```text
//! Free -> Reserved -> InFlight -> Completed -> Free
//!                        ^            |
//!                        +------------+  (resubmit)
//! ```
//!
//! Free slots are tracked by index on a stack, so `acquire` and `release`
//! never allocate and never block.

use crate::backend::{TransferBuffers, TransferKind, TransferRequest, UsbBackend};
use crate::error::{BackendError, PoolError};
use tracing::trace;

/// Transfers kept per endpoint unless configured otherwise
pub const DEFAULT_SLOTS_PER_ENDPOINT: usize = 4;

/// Largest HCI packet handled in one transfer
pub const HCI_MAX_BUFFER_SIZE: usize = 256;

/// Size of the setup packet in front of every control transfer
pub const CONTROL_SETUP_SIZE: usize = 8;

/// Logical channel an endpoint carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointRole {
    /// HCI commands, host to controller
    Control,
    /// HCI events, controller to host
    InterruptIn,
    /// ACL data, controller to host
    BulkIn,
    /// ACL data, host to controller
    BulkOut,
}

impl EndpointRole {
    pub const ALL: [EndpointRole; 4] = [
        EndpointRole::Control,
        EndpointRole::InterruptIn,
        EndpointRole::BulkIn,
        EndpointRole::BulkOut,
    ];

    /// Endpoint address fixed by the Bluetooth USB transport
    pub fn address(self) -> u8 {
        match self {
            EndpointRole::Control => 0x00,
            EndpointRole::InterruptIn => 0x81,
            EndpointRole::BulkIn => 0x82,
            EndpointRole::BulkOut => 0x02,
        }
    }

    pub fn transfer_kind(self) -> TransferKind {
        match self {
            EndpointRole::Control => TransferKind::Control,
            EndpointRole::InterruptIn => TransferKind::Interrupt,
            EndpointRole::BulkIn | EndpointRole::BulkOut => TransferKind::Bulk,
        }
    }

    pub fn is_inbound(self) -> bool {
        matches!(self, EndpointRole::InterruptIn | EndpointRole::BulkIn)
    }
}

/// A USB endpoint and the size of each of its transfer regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub address: u8,
    pub role: EndpointRole,
    pub buffer_size: usize,
}

impl Endpoint {
    pub fn new(role: EndpointRole, buffer_size: usize) -> Self {
        Self {
            address: role.address(),
            role,
            buffer_size,
        }
    }
}

/// Handle to one slot: owning endpoint plus index into its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub role: EndpointRole,
    pub index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// On the free list
    Free,
    /// Handed out by `acquire`, not yet submitted
    Reserved,
    /// Owned by the backend
    InFlight,
    /// Returned by the backend, waiting for the dispatcher
    Completed,
}

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    state: SlotState,
    length: usize,
}

/// Fixed set of transfer slots for one endpoint
#[derive(Debug)]
pub struct EndpointPool {
    endpoint: Endpoint,
    storage: Box<[u8]>,
    slots: Vec<SlotMeta>,
    free: Vec<u8>,
}

impl EndpointPool {
    /// Allocate `slot_count` regions of `endpoint.buffer_size` bytes each
    ///
    /// All slots start free. Inbound slots have their length preset to the
    /// full region.
    pub fn configure(endpoint: Endpoint, slot_count: usize) -> Self {
        let slot_count = slot_count.min(u8::MAX as usize);
        let length = if endpoint.role.is_inbound() {
            endpoint.buffer_size
        } else {
            0
        };

        Self {
            endpoint,
            storage: vec![0u8; endpoint.buffer_size * slot_count].into_boxed_slice(),
            slots: vec![
                SlotMeta {
                    state: SlotState::Free,
                    length,
                };
                slot_count
            ],
            // Popped from the back, so slot 0 is handed out first
            free: (0..slot_count as u8).rev().collect(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::InFlight)
            .count()
    }

    pub fn state(&self, slot: SlotId) -> Result<SlotState, PoolError> {
        Ok(self.meta(slot)?.state)
    }

    /// Take a slot off the free list
    pub fn acquire(&mut self) -> Result<SlotId, PoolError> {
        let index = self.free.pop().ok_or(PoolError::Empty)?;
        self.slots[index as usize].state = SlotState::Reserved;
        Ok(self.id(index))
    }

    /// Put a reserved or completed slot back on the free list
    pub fn release(&mut self, slot: SlotId) -> Result<(), PoolError> {
        let meta = self.meta_mut(slot)?;
        match meta.state {
            SlotState::Reserved | SlotState::Completed => {
                meta.state = SlotState::Free;
                self.free.push(slot.index);
                Ok(())
            }
            SlotState::Free => Err(PoolError::AlreadyFree { slot }),
            state @ SlotState::InFlight => Err(PoolError::BadState {
                slot,
                state,
                expected: "Reserved or Completed",
            }),
        }
    }

    /// Record that the backend accepted the slot
    pub fn mark_in_flight(&mut self, slot: SlotId) -> Result<(), PoolError> {
        let meta = self.meta_mut(slot)?;
        match meta.state {
            SlotState::Reserved | SlotState::Completed => {
                meta.state = SlotState::InFlight;
                Ok(())
            }
            state => Err(PoolError::BadState {
                slot,
                state,
                expected: "Reserved or Completed",
            }),
        }
    }

    /// Record that the backend handed the slot back
    pub fn mark_completed(&mut self, slot: SlotId) -> Result<(), PoolError> {
        let meta = self.meta_mut(slot)?;
        match meta.state {
            SlotState::InFlight => {
                meta.state = SlotState::Completed;
                Ok(())
            }
            state => Err(PoolError::BadState {
                slot,
                state,
                expected: "InFlight",
            }),
        }
    }

    /// Set how many bytes of the region the next transfer uses
    pub fn set_length(&mut self, slot: SlotId, length: usize) -> Result<(), PoolError> {
        let max = self.endpoint.buffer_size;
        let meta = self.meta_mut(slot)?;
        meta.length = length.min(max);
        Ok(())
    }

    /// Transfer description for a slot, as handed to the backend
    pub fn request(&self, slot: SlotId) -> Result<TransferRequest, PoolError> {
        let meta = self.meta(slot)?;
        Ok(TransferRequest {
            slot,
            endpoint: self.endpoint.address,
            kind: self.endpoint.role.transfer_kind(),
            length: meta.length,
        })
    }

    /// Whole region of a slot
    pub fn buffer(&self, slot: SlotId) -> Result<&[u8], PoolError> {
        self.meta(slot)?;
        let size = self.endpoint.buffer_size;
        let start = slot.index as usize * size;
        Ok(&self.storage[start..start + size])
    }

    pub fn buffer_mut(&mut self, slot: SlotId) -> Result<&mut [u8], PoolError> {
        self.meta(slot)?;
        let size = self.endpoint.buffer_size;
        let start = slot.index as usize * size;
        Ok(&mut self.storage[start..start + size])
    }

    /// Region of a slot cut to its current transfer length
    fn transfer_region(&self, slot: SlotId) -> &[u8] {
        let size = self.endpoint.buffer_size;
        let Some(meta) = self.slots.get(slot.index as usize) else {
            return &[];
        };
        let start = slot.index as usize * size;
        &self.storage[start..start + meta.length]
    }

    fn transfer_region_mut(&mut self, slot: SlotId) -> &mut [u8] {
        let size = self.endpoint.buffer_size;
        let Some(meta) = self.slots.get(slot.index as usize) else {
            return &mut [];
        };
        let start = slot.index as usize * size;
        &mut self.storage[start..start + meta.length]
    }

    /// Submit every free slot
    ///
    /// Used for inbound endpoints, which keep all their transfers outstanding
    /// for the life of the session. Returns the number submitted. On a
    /// submission failure the slot goes back on the free list and the error
    /// is returned; slots submitted before it stay in flight.
    pub fn prime_all<B: UsbBackend>(&mut self, backend: &mut B) -> Result<usize, BackendError> {
        let mut primed = 0;
        while let Ok(slot) = self.acquire() {
            let length = self.endpoint.buffer_size;
            self.slots[slot.index as usize].length = length;
            let request = self.id_request(slot, length);
            if let Err(e) = backend.submit(request) {
                self.slots[slot.index as usize].state = SlotState::Free;
                self.free.push(slot.index);
                return Err(e);
            }
            self.slots[slot.index as usize].state = SlotState::InFlight;
            primed += 1;
        }
        trace!(
            endpoint = self.endpoint.address,
            primed, "Primed inbound transfers"
        );
        Ok(primed)
    }

    fn id_request(&self, slot: SlotId, length: usize) -> TransferRequest {
        TransferRequest {
            slot,
            endpoint: self.endpoint.address,
            kind: self.endpoint.role.transfer_kind(),
            length,
        }
    }

    /// Slots currently owned by the backend
    pub fn in_flight(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, m)| m.state == SlotState::InFlight)
            .map(|(i, _)| self.id(i as u8))
    }

    fn id(&self, index: u8) -> SlotId {
        SlotId {
            role: self.endpoint.role,
            index,
        }
    }

    fn check(&self, slot: SlotId) -> Result<(), PoolError> {
        if slot.role != self.endpoint.role {
            return Err(PoolError::WrongEndpoint {
                slot,
                role: self.endpoint.role,
            });
        }
        if slot.index as usize >= self.slots.len() {
            return Err(PoolError::InvalidSlot {
                index: slot.index,
                capacity: self.slots.len(),
            });
        }
        Ok(())
    }

    fn meta(&self, slot: SlotId) -> Result<&SlotMeta, PoolError> {
        self.check(slot)?;
        Ok(&self.slots[slot.index as usize])
    }

    fn meta_mut(&mut self, slot: SlotId) -> Result<&mut SlotMeta, PoolError> {
        self.check(slot)?;
        Ok(&mut self.slots[slot.index as usize])
    }
}

/// The four pools of a session, one per logical channel
#[derive(Debug)]
pub struct EndpointPools {
    pub command: EndpointPool,
    pub event: EndpointPool,
    pub acl_in: EndpointPool,
    pub acl_out: EndpointPool,
}

impl EndpointPools {
    /// Allocate all four pools
    ///
    /// The control pool gets room for the setup packet on top of
    /// `buffer_size`.
    pub fn allocate(slots_per_endpoint: usize, buffer_size: usize) -> Self {
        let pool = |role: EndpointRole, size: usize| {
            EndpointPool::configure(Endpoint::new(role, size), slots_per_endpoint)
        };
        Self {
            command: pool(EndpointRole::Control, buffer_size + CONTROL_SETUP_SIZE),
            event: pool(EndpointRole::InterruptIn, buffer_size),
            acl_in: pool(EndpointRole::BulkIn, buffer_size),
            acl_out: pool(EndpointRole::BulkOut, buffer_size),
        }
    }

    pub fn get(&self, role: EndpointRole) -> &EndpointPool {
        match role {
            EndpointRole::Control => &self.command,
            EndpointRole::InterruptIn => &self.event,
            EndpointRole::BulkIn => &self.acl_in,
            EndpointRole::BulkOut => &self.acl_out,
        }
    }

    pub fn get_mut(&mut self, role: EndpointRole) -> &mut EndpointPool {
        match role {
            EndpointRole::Control => &mut self.command,
            EndpointRole::InterruptIn => &mut self.event,
            EndpointRole::BulkIn => &mut self.acl_in,
            EndpointRole::BulkOut => &mut self.acl_out,
        }
    }

    /// Total transfers the backend currently owns, across all endpoints
    pub fn in_flight_count(&self) -> usize {
        EndpointRole::ALL
            .iter()
            .map(|&role| self.get(role).in_flight_count())
            .sum()
    }
}

impl TransferBuffers for EndpointPools {
    fn transfer_buffer(&self, slot: SlotId) -> &[u8] {
        self.get(slot.role).transfer_region(slot)
    }

    fn transfer_buffer_mut(&mut self, slot: SlotId) -> &mut [u8] {
        self.get_mut(slot.role).transfer_region_mut(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn acl_out_pool(n: usize) -> EndpointPool {
        EndpointPool::configure(Endpoint::new(EndpointRole::BulkOut, 64), n)
    }

    #[test]
    fn test_acquire_until_empty() {
        let mut pool = acl_out_pool(DEFAULT_SLOTS_PER_ENDPOINT);
        for expected in 0..DEFAULT_SLOTS_PER_ENDPOINT as u8 {
            assert_eq!(pool.acquire().unwrap().index, expected);
        }
        assert_eq!(pool.acquire(), Err(PoolError::Empty));
    }

    #[test]
    fn test_release_rejects_free_slot() {
        let mut pool = acl_out_pool(2);
        let slot = pool.acquire().unwrap();
        pool.release(slot).unwrap();
        assert_eq!(pool.release(slot), Err(PoolError::AlreadyFree { slot }));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_release_rejects_in_flight_slot() {
        let mut pool = acl_out_pool(2);
        let slot = pool.acquire().unwrap();
        pool.mark_in_flight(slot).unwrap();
        assert!(matches!(
            pool.release(slot),
            Err(PoolError::BadState {
                state: SlotState::InFlight,
                ..
            })
        ));
    }

    #[test]
    fn test_wrong_endpoint_slot_rejected() {
        let mut pool = acl_out_pool(2);
        let foreign = SlotId {
            role: EndpointRole::BulkIn,
            index: 0,
        };
        assert!(matches!(
            pool.release(foreign),
            Err(PoolError::WrongEndpoint { .. })
        ));
    }

    #[test]
    fn test_regions_do_not_overlap() {
        let mut pool = acl_out_pool(3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.buffer_mut(a).unwrap().fill(0xAA);
        pool.buffer_mut(b).unwrap().fill(0xBB);
        assert!(pool.buffer(a).unwrap().iter().all(|&x| x == 0xAA));
        assert!(pool.buffer(b).unwrap().iter().all(|&x| x == 0xBB));
    }

    #[test]
    fn test_control_pool_has_setup_room() {
        let pools = EndpointPools::allocate(4, HCI_MAX_BUFFER_SIZE);
        assert_eq!(
            pools.command.endpoint().buffer_size,
            HCI_MAX_BUFFER_SIZE + CONTROL_SETUP_SIZE
        );
        assert_eq!(pools.event.endpoint().address, 0x81);
        assert_eq!(pools.acl_in.endpoint().address, 0x82);
        assert_eq!(pools.acl_out.endpoint().address, 0x02);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Submit(usize),
        Complete(usize),
        Release(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Acquire),
            (0usize..8).prop_map(Op::Submit),
            (0usize..8).prop_map(Op::Complete),
            (0usize..8).prop_map(Op::Release),
        ]
    }

    proptest! {
        /// Whatever the sequence of legal and illegal operations, a slot is
        /// never on the free list twice and every slot is accounted for.
        #[test]
        fn prop_free_list_accounts_for_every_slot(
            n in 1usize..8,
            ops in proptest::collection::vec(op_strategy(), 0..64),
        ) {
            let mut pool = acl_out_pool(n);
            let mut held: Vec<SlotId> = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire => {
                        if let Ok(slot) = pool.acquire() {
                            held.push(slot);
                        }
                    }
                    Op::Submit(i) => {
                        if let Some(&slot) = held.get(i % held.len().max(1)) {
                            let _ = pool.mark_in_flight(slot);
                        }
                    }
                    Op::Complete(i) => {
                        if let Some(&slot) = held.get(i % held.len().max(1)) {
                            let _ = pool.mark_completed(slot);
                        }
                    }
                    Op::Release(i) => {
                        if !held.is_empty() {
                            let slot = held[i % held.len()];
                            if pool.release(slot).is_ok() {
                                held.retain(|s| *s != slot);
                            }
                        }
                    }
                }

                let mut free = pool.free.clone();
                free.sort_unstable();
                free.dedup();
                prop_assert_eq!(free.len(), pool.free_count());
                prop_assert_eq!(pool.free_count() + held.len(), n);
            }

            // Quiescent point: finish and release everything still held
            for slot in held.drain(..) {
                if pool.state(slot).unwrap() == SlotState::InFlight {
                    pool.mark_completed(slot).unwrap();
                }
                pool.release(slot).unwrap();
            }
            prop_assert_eq!(pool.in_flight_count() + pool.free_count(), n);
        }
    }
}
