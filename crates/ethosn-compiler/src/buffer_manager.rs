//! DRAM buffer bookkeeping for the emitted network.
//!
//! The real allocator lives in the driver library; the compiler's job is to
//! hand it sizes, roles, constant payloads, and lifetime intervals so that
//! intermediates with disjoint lifetimes can share DRAM.

use bytes::Bytes;

use crate::plan::BufferType;

/// One reserved DRAM buffer.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    /// Dense buffer id, as referenced by the command stream.
    pub id: u32,
    /// Size in bytes.
    pub size: u32,
    /// Role.
    pub buffer_type: BufferType,
    /// `[first_agent, last_agent + 1)` during which the buffer is live.
    /// Only set for intermediates.
    pub lifetime: Option<(u32, u32)>,
    /// Payload for constant buffers.
    pub constant_data: Option<Bytes>,
}

/// Collects every DRAM buffer of one compiled network.
#[derive(Debug, Default)]
pub struct BufferManager {
    buffers: Vec<BufferInfo>,
}

impl BufferManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a non-constant buffer, returning its id.
    pub fn reserve(&mut self, size: u32, buffer_type: BufferType) -> u32 {
        let id = self.buffers.len() as u32;
        self.buffers.push(BufferInfo {
            id,
            size,
            buffer_type,
            lifetime: None,
            constant_data: None,
        });
        id
    }

    /// Add a constant buffer with its payload, returning its id.
    pub fn add_constant(&mut self, data: Bytes, buffer_type: BufferType) -> u32 {
        let id = self.buffers.len() as u32;
        self.buffers.push(BufferInfo {
            id,
            size: data.len() as u32,
            buffer_type,
            lifetime: None,
            constant_data: Some(data),
        });
        id
    }

    /// Publish the lifetime interval of an intermediate buffer.
    pub fn mark_buffer_used(&mut self, id: u32, start: u32, end: u32) {
        if let Some(info) = self.buffers.get_mut(id as usize) {
            info.lifetime = Some((start, end));
        }
    }

    /// All buffers in id order.
    pub fn buffers(&self) -> &[BufferInfo] {
        &self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense() {
        let mut manager = BufferManager::new();
        let a = manager.reserve(100, BufferType::Input);
        let b = manager.add_constant(Bytes::from_static(b"xyz"), BufferType::ConstantDma);
        assert_eq!((a, b), (0, 1));
        assert_eq!(manager.buffers()[1].size, 3);
    }

    #[test]
    fn test_lifetime_marking() {
        let mut manager = BufferManager::new();
        let id = manager.reserve(64, BufferType::Intermediate);
        manager.mark_buffer_used(id, 2, 5);
        assert_eq!(manager.buffers()[0].lifetime, Some((2, 5)));
    }
}
