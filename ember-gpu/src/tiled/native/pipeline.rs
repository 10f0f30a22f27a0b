//! Raw root signatures and pipeline state objects. The engine's builder
//! computes the binding-slot layout; these types are what the executor
//! consults to validate tables and run built-in compute programs.

use std::sync::Arc;

use crate::{PrimitiveTopology, SampleCount, TextureFormat};

use super::shader::{ComputeProgram, FragmentProgram, VertexProgram};
use super::RawDevice;

/// Which logical binding group a descriptor table serves. The engine resolves
/// a dirty group to the root-parameter index carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindGroup {
    VertexSamplers,
    VertexSampledTextures,
    VertexStorageTextures,
    VertexStorageBuffers,
    FragmentSamplers,
    FragmentSampledTextures,
    FragmentStorageTextures,
    FragmentStorageBuffers,
    ComputeReadStorageTextures,
    ComputeReadStorageBuffers,
    ComputeWriteStorageTextures,
    ComputeWriteStorageBuffers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableKind {
    Sampler,
    Srv,
    Uav,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UniformStage {
    Vertex,
    Fragment,
    Compute,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum RootParameter {
    /// A contiguous descriptor-table range bound with one root index.
    Table {
        group: BindGroup,
        kind: TableKind,
        count: u32,
        register_space: u32,
    },
    /// A root CBV: a GPU virtual address written directly into the root.
    ConstantBuffer {
        stage: UniformStage,
        slot: u32,
        register_space: u32,
    },
}

#[derive(Debug)]
pub(crate) struct RawRootSignature {
    pub(crate) id: u64,
    pub(crate) parameters: Vec<RootParameter>,
}

impl RawRootSignature {
    pub(crate) fn new(device: &RawDevice, parameters: Vec<RootParameter>) -> Arc<Self> {
        Arc::new(Self { id: device.next_resource_id(), parameters })
    }
}

#[derive(Debug)]
pub(crate) struct RawGraphicsPipeline {
    pub(crate) id: u64,
    pub(crate) root_signature: Arc<RawRootSignature>,
    pub(crate) vertex_program: VertexProgram,
    pub(crate) fragment_program: FragmentProgram,
    pub(crate) topology: PrimitiveTopology,
    pub(crate) color_formats: Vec<TextureFormat>,
    pub(crate) depth_format: Option<TextureFormat>,
    pub(crate) sample_count: SampleCount,
}

impl RawGraphicsPipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device: &RawDevice,
        root_signature: Arc<RawRootSignature>,
        vertex_program: VertexProgram,
        fragment_program: FragmentProgram,
        topology: PrimitiveTopology,
        color_formats: Vec<TextureFormat>,
        depth_format: Option<TextureFormat>,
        sample_count: SampleCount,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: device.next_resource_id(),
            root_signature,
            vertex_program,
            fragment_program,
            topology,
            color_formats,
            depth_format,
            sample_count,
        })
    }
}

#[derive(Debug)]
pub(crate) struct RawComputePipeline {
    pub(crate) id: u64,
    pub(crate) root_signature: Arc<RawRootSignature>,
    pub(crate) program: ComputeProgram,
    pub(crate) thread_count: (u32, u32, u32),
}

impl RawComputePipeline {
    pub(crate) fn new(
        device: &RawDevice,
        root_signature: Arc<RawRootSignature>,
        program: ComputeProgram,
        thread_count: (u32, u32, u32),
    ) -> Arc<Self> {
        Arc::new(Self {
            id: device.next_resource_id(),
            root_signature,
            program,
            thread_count,
        })
    }
}
