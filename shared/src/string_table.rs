//! Interning table that replaces repeated asset paths and entity type tags
//! with small integer indices on the wire.
//!
//! Both ends hold the same table: the server registers strings as content is
//! loaded and ships the mapping in `NetworkStrings` packets; the client fills
//! its table from those packets before any index is dereferenced.

use std::collections::HashMap;

use crate::packets::Packet;

/// Bidirectional string <-> index mapping. Indices are dense and assigned in
/// registration order, so a partial sync can be expressed as "everything from
/// index N onward".
#[derive(Debug, Default, Clone)]
pub struct NetworkStringTable {
    strings: Vec<String>,
    indices: HashMap<String, u32>,
}

impl NetworkStringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its index. Registering the same string
    /// twice returns the original index.
    pub fn register(&mut self, value: &str) -> u32 {
        if let Some(&index) = self.indices.get(value) {
            return index;
        }

        let index = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.indices.insert(value.to_string(), index);
        index
    }

    /// Looks up the index of an already-registered string.
    pub fn get_index(&self, value: &str) -> Option<u32> {
        self.indices.get(value).copied()
    }

    /// Looks up the string behind an index.
    pub fn get_string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Replaces the table contents from `first_index` onward with `strings`,
    /// exactly as a `NetworkStrings` packet describes. Entries past the end
    /// of the replacement range are discarded.
    pub fn fill(&mut self, first_index: u32, strings: Vec<String>) {
        let first = first_index as usize;

        for stale in self.strings.drain(first.min(self.strings.len())..) {
            self.indices.remove(&stale);
        }

        for value in strings {
            let index = self.strings.len() as u32;
            self.indices.insert(value.clone(), index);
            self.strings.push(value);
        }
    }

    /// Builds the packet that syncs every entry from `first_index` onward to
    /// a peer.
    pub fn build_packet(&self, first_index: u32) -> Packet {
        let first = (first_index as usize).min(self.strings.len());
        Packet::NetworkStrings {
            start_id: first_index,
            strings: self.strings[first..].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let mut table = NetworkStringTable::new();
        let first = table.register("spaceship/spaceship.obj");
        let second = table.register("spaceship/spaceship.obj");
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_indices_are_dense_registration_order() {
        let mut table = NetworkStringTable::new();
        assert_eq!(table.register("a"), 0);
        assert_eq!(table.register("b"), 1);
        assert_eq!(table.register("c"), 2);
        assert_eq!(table.get_string(1), Some("b"));
        assert_eq!(table.get_index("c"), Some(2));
        assert_eq!(table.get_string(3), None);
    }

    #[test]
    fn test_fill_replays_packet_contents() {
        let mut server = NetworkStringTable::new();
        server.register("earth/earth.obj");
        server.register("ball/ball.obj");
        server.register("plasmabeam");

        let packet = server.build_packet(0);
        let mut client = NetworkStringTable::new();
        match packet {
            Packet::NetworkStrings { start_id, strings } => client.fill(start_id, strings),
            other => panic!("unexpected packet {:?}", other),
        }

        assert_eq!(client.len(), server.len());
        for index in 0..server.len() as u32 {
            assert_eq!(client.get_string(index), server.get_string(index));
        }
    }

    #[test]
    fn test_partial_fill_discards_stale_tail() {
        let mut table = NetworkStringTable::new();
        table.register("keep");
        table.register("stale_a");
        table.register("stale_b");

        table.fill(1, vec!["fresh".to_string()]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get_string(0), Some("keep"));
        assert_eq!(table.get_string(1), Some("fresh"));
        assert_eq!(table.get_index("stale_a"), None);
        assert_eq!(table.get_index("stale_b"), None);
        assert_eq!(table.get_index("fresh"), Some(1));
    }

    #[test]
    fn test_build_packet_from_offset() {
        let mut table = NetworkStringTable::new();
        table.register("a");
        table.register("b");
        table.register("c");

        match table.build_packet(1) {
            Packet::NetworkStrings { start_id, strings } => {
                assert_eq!(start_id, 1);
                assert_eq!(strings, vec!["b".to_string(), "c".to_string()]);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }
}
