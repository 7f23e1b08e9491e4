//! DMA descriptor memory: transfer segments and the transmit rings.
//!
//! The hardware walks three rings on DMA channel 8. Control and bulk have
//! one node per endpoint table row; the node for a row points at the
//! segment chain of that row's active transfer. The interrupt ring has one
//! slot per frame of the longest polling interval, and every scheduled
//! interrupt endpoint gets a transient node in each slot it polls in.
//!
//! Nothing here is addressed by pointer. Segments live in a bounded arena
//! and are referred to by [`SegId`]; ring nodes are addressed by row.

use alloc::vec::Vec;

use bitflags::bitflags;
use thunderdome::{Arena, Index};
use tinyvec::ArrayVec;

use crate::types::{Epid, NBR_OF_EPIDS};
use crate::{Result, SetupPacket, UrbError};

/// Segments available to all rings together.
pub const MAX_SEGMENTS: usize = 2048;

/// Slots in the interrupt ring, also the longest polling interval in frames.
pub const MAX_INTR_INTERVAL: usize = 128;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SbCommand: u8 {
        /// Last segment of the chain.
        const EOL = 1 << 0;
        /// Last segment of the transfer.
        const EOT = 1 << 1;
        const INTR = 1 << 2;
        /// The final IN packet is a full `max_packet` one.
        const FULL = 1 << 3;
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EpCommand: u8 {
        const ENABLE = 1 << 0;
        const EOL = 1 << 1;
        const INTR = 1 << 2;
        const EOF = 1 << 3;
    }
}

/// Token the controller issues for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// Zero length OUT.
    Zout,
    In,
    Out,
    Setup,
}

/// Where a segment is in its life. A freed segment is simply gone from
/// the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    Building,
    Submitted,
    InFlight,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegId(Index);

#[derive(Debug, Clone)]
pub struct Segment {
    pub tt: TokenType,
    pub command: SbCommand,
    /// Byte count for OUT and SETUP, packet count for IN.
    pub sw_len: u16,
    /// Size of the last IN packet when it is short.
    pub rem: u8,
    pub data: Vec<u8>,
    pub next: Option<SegId>,
    pub state: DescState,
}

impl Segment {
    fn new(tt: TokenType, sw_len: u16, data: Vec<u8>) -> Self {
        Self {
            tt,
            command: SbCommand::empty(),
            sw_len,
            rem: 0,
            data,
            next: None,
            state: DescState::Building,
        }
    }

    pub fn setup(setup: &SetupPacket) -> Self {
        Self::new(TokenType::Setup, SetupPacket::LEN as u16, setup.to_bytes().to_vec())
    }

    /// IN data of `len` bytes, expressed in packets of `max_packet`.
    pub fn data_in(len: usize, max_packet: u16) -> Self {
        let max_packet = max_packet.max(1) as usize;
        let mut seg = Self::new(TokenType::In, len.div_ceil(max_packet) as u16, Vec::new());
        seg.rem = (len % max_packet) as u8;
        if seg.rem == 0 {
            seg.command |= SbCommand::FULL;
        }
        seg
    }

    pub fn data_out(data: &[u8]) -> Self {
        Self::new(TokenType::Out, data.len() as u16, data.to_vec())
    }

    /// Zero length IN, the status stage after an OUT data stage and the
    /// placeholder interrupt IN poll.
    pub fn zero_in() -> Self {
        Self::new(TokenType::In, 0, Vec::new())
    }

    pub fn zout() -> Self {
        Self::new(TokenType::Zout, 0, Vec::new())
    }

    pub fn last(mut self) -> Self {
        self.command |= SbCommand::EOL | SbCommand::EOT | SbCommand::INTR;
        self
    }
}

pub struct SegmentPool {
    arena: Arena<Segment>,
    capacity: usize,
}

impl SegmentPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            arena: Arena::with_capacity(capacity),
            capacity,
        }
    }

    pub fn alloc(&mut self, seg: Segment) -> Result<SegId> {
        if self.arena.len() >= self.capacity {
            return Err(UrbError::NoMemory);
        }
        Ok(SegId(self.arena.insert(seg)))
    }

    pub fn get(&self, id: SegId) -> Option<&Segment> {
        self.arena.get(id.0)
    }

    pub fn get_mut(&mut self, id: SegId) -> Option<&mut Segment> {
        self.arena.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Ids of a chain in hardware order.
    pub fn chain(&self, head: SegId) -> Vec<SegId> {
        let mut ids = Vec::new();
        let mut cur = Some(head);
        while let Some(id) = cur {
            let Some(seg) = self.get(id) else { break };
            ids.push(id);
            cur = seg.next;
        }
        ids
    }

    pub fn set_chain_state(&mut self, head: SegId, state: DescState) {
        for id in self.chain(head) {
            if let Some(seg) = self.get_mut(id) {
                seg.state = state;
            }
        }
    }

    /// Returns how many segments were freed.
    pub fn release_chain(&mut self, head: SegId) -> usize {
        let ids = self.chain(head);
        for &id in &ids {
            self.arena.remove(id.0);
        }
        ids.len()
    }
}

/// Links segments into a chain. Dropping an unfinished builder frees
/// whatever it allocated.
pub struct ChainBuilder<'a> {
    pool: &'a mut SegmentPool,
    ids: Vec<SegId>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(pool: &'a mut SegmentPool) -> Self {
        Self {
            pool,
            ids: Vec::new(),
        }
    }

    pub fn push(&mut self, seg: Segment) -> Result<()> {
        let id = self.pool.alloc(seg)?;
        if let Some(&prev) = self.ids.last() {
            if let Some(prev) = self.pool.get_mut(prev) {
                prev.next = Some(id);
            }
        }
        self.ids.push(id);
        Ok(())
    }

    /// Marks the tail as end of chain and returns the head.
    pub fn finish(mut self) -> Option<SegId> {
        let head = *self.ids.first()?;
        let tail = *self.ids.last()?;
        if let Some(tail) = self.pool.get_mut(tail) {
            tail.command |= SbCommand::EOL | SbCommand::EOT | SbCommand::INTR;
        }
        self.ids.clear();
        Some(head)
    }
}

impl Drop for ChainBuilder<'_> {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            self.pool.arena.remove(id.0);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RingNode {
    pub command: EpCommand,
    pub epid: Epid,
    pub sub: Option<SegId>,
    pub next: u8,
}

/// Control or bulk ring: node `n` belongs to endpoint row `n`.
pub struct EpRing {
    nodes: [RingNode; NBR_OF_EPIDS],
}

impl EpRing {
    pub fn new() -> Self {
        let nodes = core::array::from_fn(|i| RingNode {
            command: if i == NBR_OF_EPIDS - 1 {
                EpCommand::EOL
            } else {
                EpCommand::empty()
            },
            epid: Epid::new(i).unwrap_or(Epid::DUMMY),
            sub: None,
            next: ((i + 1) % NBR_OF_EPIDS) as u8,
        });
        Self { nodes }
    }

    pub fn node(&self, epid: Epid) -> &RingNode {
        &self.nodes[epid.index()]
    }

    pub fn node_mut(&mut self, epid: Epid) -> &mut RingNode {
        &mut self.nodes[epid.index()]
    }

    pub fn enabled(&self, epid: Epid) -> bool {
        self.node(epid).command.contains(EpCommand::ENABLE)
    }

    pub fn arm(&mut self, epid: Epid, head: SegId) {
        let node = self.node_mut(epid);
        node.sub = Some(head);
        node.command.insert(EpCommand::ENABLE);
    }

    pub fn disable(&mut self, epid: Epid) {
        self.node_mut(epid).command.remove(EpCommand::ENABLE);
    }

    /// Detaches the chain from the node and hands it back.
    pub fn disarm(&mut self, epid: Epid) -> Option<SegId> {
        let node = self.node_mut(epid);
        node.command.remove(EpCommand::ENABLE);
        node.sub.take()
    }
}

impl Default for EpRing {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IntrNode {
    pub command: EpCommand,
    pub epid: Epid,
    pub sub: Option<SegId>,
}

type IntrSlot = ArrayVec<[IntrNode; NBR_OF_EPIDS]>;

/// The periodic ring, one slot per frame.
pub struct IntrRing {
    slots: Vec<IntrSlot>,
}

impl IntrRing {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_INTR_INTERVAL).map(|_| IntrSlot::new()).collect(),
        }
    }

    pub fn insert(&mut self, slot: usize, node: IntrNode) -> Result<()> {
        match self.slots[slot % MAX_INTR_INTERVAL].try_push(node) {
            None => Ok(()),
            Some(_) => Err(UrbError::NoMemory),
        }
    }

    /// Unlinks every node of `epid` and returns their segments.
    pub fn remove(&mut self, epid: Epid) -> Vec<SegId> {
        let mut segs = Vec::new();
        for slot in self.slots.iter_mut() {
            slot.retain(|node| {
                if node.epid == epid {
                    segs.extend(node.sub);
                    false
                } else {
                    true
                }
            });
        }
        segs
    }

    pub fn set_enabled(&mut self, epid: Epid, enabled: bool) {
        for node in self.slots.iter_mut().flat_map(|s| s.iter_mut()) {
            if node.epid == epid {
                node.command.set(EpCommand::ENABLE, enabled);
            }
        }
    }

    /// Slots `epid` is polled in.
    pub fn slots_of(&self, epid: Epid) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.iter().any(|n| n.epid == epid))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn slot(&self, slot: usize) -> &[IntrNode] {
        &self.slots[slot % MAX_INTR_INTERVAL]
    }
}

impl Default for IntrRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest power of two not above `requested`, within `1..=MAX_INTR_INTERVAL`.
pub fn effective_interval(requested: u8) -> usize {
    let requested = (requested as usize).clamp(1, MAX_INTR_INTERVAL);
    1 << (usize::BITS - 1 - requested.leading_zeros())
}
