//! Per-instance vertex data
//!
//! Instancing and particles upload their per-copy data the same way: one
//! buffer holding every instance drawn by the system this frame, advanced
//! once per instance by the vertex stage. Each entity draws its own
//! sub-range of that buffer.
//!
//! A system can render several times in one frame when a capture re-renders
//! it. Every upload in a frame goes to fresh space after the previous one,
//! because a backend may encode all of the frame's passes after the last
//! write.

use std::marker::PhantomData;
use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::*;
use crate::error::EngineResult;
use crate::scene::Transform;

/// Vertex slot instance data is bound to; slot 0 holds the mesh
pub const INSTANCE_SLOT: u32 = 1;

/// Data streamed once per instance
pub trait InstanceData: Pod {
    fn layout() -> VertexBufferLayout;
}

/// Model matrix in locations 4-7, one column each
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceTransform {
    pub model: Mat4,
}

impl From<&Transform> for InstanceTransform {
    fn from(transform: &Transform) -> Self {
        Self {
            model: transform.matrix(),
        }
    }
}

impl InstanceData for InstanceTransform {
    fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Instance,
            attributes: (0..4)
                .map(|column| VertexAttribute {
                    location: 4 + column,
                    format: VertexFormat::Float32x4,
                    offset: column as u64 * 16,
                })
                .collect(),
        }
    }
}

/// Billboard center and size plus normalized age, in locations 4 and 5
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ParticleInstance {
    /// xyz = center, w = size
    pub center_size: Vec4,
    /// x = age / lifetime
    pub life: Vec4,
}

impl InstanceData for ParticleInstance {
    fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Instance,
            attributes: vec![
                VertexAttribute {
                    location: 4,
                    format: VertexFormat::Float32x4,
                    offset: 0,
                },
                VertexAttribute {
                    location: 5,
                    format: VertexFormat::Float32x4,
                    offset: 16,
                },
            ],
        }
    }
}

/// Growable GPU buffer of instance data
#[derive(Debug)]
pub struct InstanceBuffer<T: InstanceData> {
    label: &'static str,
    buffer: Option<BufferHandle>,
    capacity: usize,
    /// First free instance slot in the current frame
    cursor: usize,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: InstanceData> InstanceBuffer<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            buffer: None,
            capacity: 0,
            cursor: 0,
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Start a new frame; earlier uploads may be overwritten from here on
    pub fn begin_frame(&mut self) {
        self.cursor = 0;
    }

    /// Append `instances` after everything uploaded this frame and return the
    /// index of the first one, to offset draw ranges by.
    ///
    /// When they no longer fit, a larger buffer takes over with the new
    /// instances at the same index. Draws already recorded keep reading the
    /// old buffer until it is destroyed.
    pub fn upload(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        instances: &[T],
    ) -> EngineResult<u32> {
        self.len = instances.len();
        if instances.is_empty() {
            return Ok(self.cursor as u32);
        }

        let bytes: &[u8] = bytemuck::cast_slice(instances);
        let base = self.cursor;
        let offset = base * std::mem::size_of::<T>();
        let end = base + instances.len();
        match self.buffer {
            Some(buffer) if end <= self.capacity => {
                backend.write_buffer(buffer, offset as u64, bytes);
            }
            _ => {
                if let Some(old) = self.buffer.take() {
                    backend.destroy_buffer(old);
                }
                let capacity = end.next_power_of_two();
                let mut contents = vec![0; offset];
                contents.extend_from_slice(bytes);
                let buffer = backend.create_buffer_init(
                    &BufferDescriptor {
                        label: Some(format!("{} instances", self.label)),
                        size: (capacity * std::mem::size_of::<T>()) as u64,
                        usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                    },
                    &contents,
                )?;
                log::debug!("{} instance buffer grown to {}", self.label, capacity);
                self.buffer = Some(buffer);
                self.capacity = capacity;
            }
        }
        self.cursor = end;
        Ok(base as u32)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.buffer
    }

    pub fn bind(&self, backend: &mut dyn GraphicsBackend) {
        if let Some(buffer) = self.buffer {
            backend.set_vertex_buffer(INSTANCE_SLOT, buffer, &T::layout());
        }
    }

    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(buffer) = self.buffer.take() {
            backend.destroy_buffer(buffer);
        }
        self.capacity = 0;
        self.cursor = 0;
        self.len = 0;
    }
}

impl<T: InstanceData> Drop for InstanceBuffer<T> {
    fn drop(&mut self) {
        if self.buffer.is_some() {
            log::warn!("{} instance buffer dropped without release", self.label);
        }
    }
}

/// Packs per-entity instance lists back to back and remembers each entity's range
#[derive(Debug)]
pub struct InstanceBatch<T> {
    data: Vec<T>,
    ranges: Vec<Range<u32>>,
}

impl<T: Copy> InstanceBatch<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            ranges: Vec::new(),
        }
    }

    pub fn push(&mut self, instances: impl IntoIterator<Item = T>) -> Range<u32> {
        let start = self.data.len() as u32;
        self.data.extend(instances);
        let range = start..self.data.len() as u32;
        self.ranges.push(range.clone());
        range
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn ranges(&self) -> &[Range<u32>] {
        &self.ranges
    }

    /// Each entity's range moved to start at `base` within the instance buffer
    pub fn ranges_from(&self, base: u32) -> impl Iterator<Item = Range<u32>> + '_ {
        self.ranges
            .iter()
            .map(move |range| range.start + base..range.end + base)
    }
}

impl<T: Copy> Default for InstanceBatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_upload_reuses_buffer_until_capacity() {
        let mut backend = HeadlessBackend::default();
        let mut buffer = InstanceBuffer::<InstanceTransform>::new("test");
        let one = InstanceTransform::from(&Transform::from_position(Vec3::X));

        assert_eq!(buffer.upload(&mut backend, &[one; 3]).unwrap(), 0);
        let first = buffer.handle();
        assert_eq!(buffer.capacity(), 4);

        buffer.begin_frame();
        assert_eq!(buffer.upload(&mut backend, &[one; 4]).unwrap(), 0);
        assert_eq!(buffer.handle(), first);

        buffer.begin_frame();
        buffer.upload(&mut backend, &[one; 5]).unwrap();
        assert_ne!(buffer.handle(), first);
        assert_eq!(backend.live_buffers(), 1);

        buffer.release(&mut backend);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_uploads_in_one_frame_do_not_overlap() {
        let mut backend = HeadlessBackend::default();
        let mut buffer = InstanceBuffer::<InstanceTransform>::new("test");
        let near = InstanceTransform::from(&Transform::from_position(Vec3::X));
        let far = InstanceTransform::from(&Transform::from_position(Vec3::Z * 9.0));

        buffer.upload(&mut backend, &[near; 3]).unwrap();
        let handle = buffer.handle().unwrap();
        assert_eq!(buffer.upload(&mut backend, &[far]).unwrap(), 3);
        assert_eq!(buffer.handle(), Some(handle));

        let binding = [near, near, near, far];
        let expected: &[u8] = bytemuck::cast_slice(&binding);
        let data = backend.buffer_data(handle).unwrap();
        assert_eq!(&data[..expected.len()], expected);

        // Grows once the frame outruns the buffer, keeping the frame's indices
        assert_eq!(buffer.upload(&mut backend, &[far]).unwrap(), 4);
        assert_eq!(buffer.capacity(), 8);
        assert_ne!(buffer.handle(), Some(handle));
        let grown = backend.buffer_data(buffer.handle().unwrap()).unwrap();
        assert_eq!(&grown[4 * 64..5 * 64], bytemuck::bytes_of(&far));

        buffer.begin_frame();
        assert_eq!(buffer.upload(&mut backend, &[near; 3]).unwrap(), 0);
        buffer.release(&mut backend);
    }

    #[test]
    fn test_transform_layout_spans_four_locations() {
        let layout = InstanceTransform::layout();
        let locations: Vec<u32> = layout.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![4, 5, 6, 7]);
        assert_eq!(layout.array_stride, 64);
        assert_eq!(layout.step_mode, VertexStepMode::Instance);
    }

    #[test]
    fn test_batch_ranges_are_contiguous() {
        let mut batch = InstanceBatch::new();
        assert_eq!(batch.push([1, 2, 3]), 0..3);
        assert_eq!(batch.push([4]), 3..4);
        assert_eq!(batch.data(), &[1, 2, 3, 4]);
        assert_eq!(batch.ranges_from(6).collect::<Vec<_>>(), vec![6..9, 9..10]);
    }
}
