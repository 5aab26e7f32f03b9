//! Per-target channel allocation
//!
//! Edge masks pack several generators into the channels of one target. Each
//! pool resource carries a small slot table; generators acquire and release
//! channel bitmasks instead of bumping a shared counter, so out-of-order
//! frees never collide.

use super::ResourceRole;
use crate::generator::GeneratorId;

/// Up to eight channel slots of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelMask(u8);

impl ChannelMask {
    pub const EMPTY: ChannelMask = ChannelMask(0);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Mask covering the first `count` channels
    pub fn first(count: u32) -> Self {
        match count {
            0 => Self::EMPTY,
            c if c >= 8 => Self(u8::MAX),
            c => Self(((1u16 << c) - 1) as u8),
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn contains(self, channel: u32) -> bool {
        channel < 8 && self.0 & (1 << channel) != 0
    }

    pub fn union(self, other: ChannelMask) -> ChannelMask {
        Self(self.0 | other.0)
    }

    /// Indices of the set channels, lowest first
    pub fn channels(self) -> impl Iterator<Item = u32> {
        (0..8).filter(move |&c| self.contains(c))
    }

    /// Color write mask for the channels that live in an RGBA target
    pub fn color_writes(self) -> wgpu::ColorWrites {
        wgpu::ColorWrites::from_bits_truncate((self.0 & 0x0f) as u32)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelSlot {
    owner: Option<GeneratorId>,
    role: Option<ResourceRole>,
    last_filler: Option<GeneratorId>,
}

/// Slot table for one pooled target
#[derive(Debug, Clone)]
pub struct ChannelAllocator {
    slots: Vec<ChannelSlot>,
}

impl ChannelAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: vec![ChannelSlot::default(); capacity.clamp(1, 8) as usize],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn all(&self) -> ChannelMask {
        ChannelMask::first(self.capacity())
    }

    pub fn free(&self) -> ChannelMask {
        self.mask_where(|slot| slot.owner.is_none())
    }

    /// Nobody has ever written to this target
    pub fn is_pristine(&self) -> bool {
        self.slots.iter().all(|s| s.owner.is_none() && s.last_filler.is_none())
    }

    /// Number of channels a request for `count` really needs (0 = whole target)
    pub fn requested(&self, count: u32) -> u32 {
        if count == 0 {
            self.capacity()
        } else {
            count
        }
    }

    /// Claim `count` channels, reusing `preferred` when all of it is free.
    pub fn acquire(
        &mut self,
        owner: GeneratorId,
        role: ResourceRole,
        count: u32,
        preferred: Option<ChannelMask>,
    ) -> Option<ChannelMask> {
        let count = self.requested(count);
        let free = self.free();
        if free.count() < count {
            return None;
        }

        let mask = match preferred {
            Some(p) if p.count() == count && free.union(p) == free => p,
            _ => Self::lowest(free, count),
        };
        self.claim(owner, role, mask);
        Some(mask)
    }

    /// Claim exactly `mask`, failing if any channel is taken.
    pub fn acquire_exact(&mut self, owner: GeneratorId, role: ResourceRole, mask: ChannelMask) -> bool {
        let free = self.free();
        if free.union(mask) != free {
            return false;
        }
        self.claim(owner, role, mask);
        true
    }

    /// Free every channel held by `owner`
    pub fn release(&mut self, owner: GeneratorId) -> ChannelMask {
        let mut freed = 0u8;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.owner == Some(owner) {
                slot.owner = None;
                slot.role = None;
                slot.last_filler = Some(owner);
                freed |= 1 << i;
            }
        }
        ChannelMask(freed)
    }

    /// Channels currently held by `owner`
    pub fn owned(&self, owner: GeneratorId) -> ChannelMask {
        self.mask_where(|slot| slot.owner == Some(owner))
    }

    /// Channels held by `owner`, or free but last filled by it
    pub fn channel_mask(&self, owner: GeneratorId) -> ChannelMask {
        self.mask_where(|slot| {
            slot.owner == Some(owner) || (slot.owner.is_none() && slot.last_filler == Some(owner))
        })
    }

    /// Drop all owners, remembering who filled each channel
    pub fn reset_owners(&mut self) {
        for slot in &mut self.slots {
            if let Some(owner) = slot.owner.take() {
                slot.last_filler = Some(owner);
                slot.role = None;
            }
        }
    }

    fn claim(&mut self, owner: GeneratorId, role: ResourceRole, mask: ChannelMask) {
        for channel in mask.channels() {
            if let Some(slot) = self.slots.get_mut(channel as usize) {
                slot.owner = Some(owner);
                slot.role = Some(role);
                slot.last_filler = Some(owner);
            }
        }
    }

    fn mask_where(&self, pred: impl Fn(&ChannelSlot) -> bool) -> ChannelMask {
        let bits = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| pred(slot))
            .fold(0u8, |acc, (i, _)| acc | (1 << i));
        ChannelMask(bits)
    }

    fn lowest(free: ChannelMask, count: u32) -> ChannelMask {
        let bits = free
            .channels()
            .take(count as usize)
            .fold(0u8, |acc, c| acc | (1 << c));
        ChannelMask(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: GeneratorId = GeneratorId(1);
    const B: GeneratorId = GeneratorId(2);
    const C: GeneratorId = GeneratorId(3);

    #[test]
    fn out_of_order_release_never_collides() {
        let mut alloc = ChannelAllocator::new(4);
        let a = alloc.acquire(A, ResourceRole::EdgeMap, 1, None).unwrap();
        let b = alloc.acquire(B, ResourceRole::EdgeMap, 2, None).unwrap();
        assert_eq!(a.bits(), 0b0001);
        assert_eq!(b.bits(), 0b0110);

        // A frees first; C must land in A's hole, not on top of B
        alloc.release(A);
        let c = alloc.acquire(C, ResourceRole::EdgeMap, 1, None).unwrap();
        assert_eq!(c.bits(), 0b0001);
        assert_eq!(c.bits() & b.bits(), 0);

        assert!(alloc.acquire(A, ResourceRole::EdgeMap, 2, None).is_none());
        assert!(alloc.acquire(A, ResourceRole::EdgeMap, 1, None).is_some());
    }

    #[test]
    fn preferred_mask_is_reused_when_free() {
        let mut alloc = ChannelAllocator::new(4);
        let first = alloc.acquire(A, ResourceRole::EdgeMap, 1, Some(ChannelMask::from_bits(0b0100))).unwrap();
        assert_eq!(first.bits(), 0b0100);
        alloc.release(A);

        assert_eq!(alloc.channel_mask(A).bits(), 0b0100);
        assert!(alloc.acquire_exact(A, ResourceRole::EdgeMap, first));
        assert!(!alloc.acquire_exact(B, ResourceRole::EdgeMap, first));
    }

    #[test]
    fn eight_owners_fill_a_packed_target() {
        let mut alloc = ChannelAllocator::new(8);
        let masks: Vec<_> = (0..8)
            .map(|i| alloc.acquire(GeneratorId(10 + i), ResourceRole::EdgeMap, 1, None).unwrap())
            .collect();
        for (i, mask) in masks.iter().enumerate() {
            assert_eq!(mask.bits(), 1 << i);
        }
        assert!(alloc.free().is_empty());
        assert!(alloc.acquire(GeneratorId(18), ResourceRole::EdgeMap, 1, None).is_none());

        alloc.release(GeneratorId(13));
        let late = alloc.acquire(GeneratorId(18), ResourceRole::EdgeMap, 1, None).unwrap();
        assert_eq!(late.bits(), 1 << 3);
        // Only four of the channels reach an RGBA write mask
        assert_eq!(ChannelMask::first(8).color_writes(), wgpu::ColorWrites::ALL);
    }

    #[test]
    fn capacity_is_capped_at_eight() {
        assert_eq!(ChannelAllocator::new(12).capacity(), 8);
        assert_eq!(ChannelAllocator::new(0).capacity(), 1);
    }

    #[test]
    fn whole_target_request() {
        let mut alloc = ChannelAllocator::new(2);
        let all = alloc.acquire(A, ResourceRole::DepthMap, 0, None).unwrap();
        assert_eq!(all, alloc.all());
        assert!(alloc.acquire(B, ResourceRole::DepthMap, 1, None).is_none());
        alloc.reset_owners();
        assert_eq!(alloc.free(), alloc.all());
        assert!(!alloc.is_pristine());
    }
}
