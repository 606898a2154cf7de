use crate::packet::Packet;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Deduplicates cached packets by identity.
///
/// Cached packets (session summary, thread info, application user) carry
/// invariant content and must appear exactly once per stream. The cache keeps
/// them in insertion order, keyed by their cache id, so every sink can prime
/// a fresh stream with the same packets in the same order.
#[derive(Debug, Default)]
pub struct PacketCache {
    packets: Vec<Arc<dyn Packet>>,
    index: HashMap<Uuid, usize>,
}

impl PacketCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Inserts `packet` if its id is unseen; idempotent per id. Returns the
    /// packet's index and whether this call inserted it. Packets without a
    /// cache id are not cacheable and return `None`.
    pub fn add_or_get(&mut self, packet: &Arc<dyn Packet>) -> Option<(usize, bool)> {
        let id = packet.cache_id()?;
        if let Some(&existing) = self.index.get(&id) {
            return Some((existing, false));
        }
        let slot = self.packets.len();
        self.packets.push(Arc::clone(packet));
        self.index.insert(id, slot);
        Some((slot, true))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Packet>> {
        self.packets.get(index)
    }

    /// Packets in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Packet>> {
        self.packets.iter()
    }

    /// Drops everything; used at session rollover.
    pub fn clear(&mut self) {
        self.packets.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::ThreadInfoPacket;

    #[test]
    fn add_or_get_is_idempotent() {
        let mut cache = PacketCache::new();
        let packet: Arc<dyn Packet> = Arc::new(ThreadInfoPacket::new(1, None, false));

        let (first, inserted) = cache.add_or_get(&packet).unwrap();
        assert!(inserted);
        let (second, inserted) = cache.add_or_get(&packet).unwrap();
        assert!(!inserted);

        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn insertion_order_preserved() {
        let mut cache = PacketCache::new();
        let a: Arc<dyn Packet> = Arc::new(ThreadInfoPacket::new(1, Some("a".into()), false));
        let b: Arc<dyn Packet> = Arc::new(ThreadInfoPacket::new(2, Some("b".into()), false));
        cache.add_or_get(&a);
        cache.add_or_get(&b);

        let names: Vec<_> = cache.iter().map(|p| p.cache_id().unwrap()).collect();
        assert_eq!(names, vec![a.cache_id().unwrap(), b.cache_id().unwrap()]);
    }

    #[test]
    fn non_cachable_packet_rejected() {
        use crate::packet::{CommandPacket, MessengerCommand};
        let mut cache = PacketCache::new();
        let packet = CommandPacket::arc(MessengerCommand::Flush);
        assert!(cache.add_or_get(&packet).is_none());
        assert!(cache.is_empty());
    }
}
