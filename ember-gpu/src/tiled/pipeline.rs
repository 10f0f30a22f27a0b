//! Shaders, samplers, root-signature layout, and pipeline construction.
//!
//! Each shader declares how many samplers, storage textures, storage buffers
//! and uniform buffers it consumes; the builder lays root parameters out in a
//! fixed group order per stage, skipping empty groups, and records the root
//! parameter index every logical bind point resolved to. A negative index
//! means the stage has no such group. Vertex and fragment groups live in
//! disjoint register spaces so registers do not clobber across stages.

use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::{
    ComputePipelineCreateInfo, GraphicsPipelineCreateInfo, PrimitiveTopology, SamplerCreateInfo,
    ShaderCreateInfo, ShaderStage, TextureFormat, MAX_COLOR_TARGETS, MAX_VERTEX_ATTRIBUTES,
    MAX_VERTEX_BUFFERS,
};

use super::descriptor::CpuDescriptor;
use super::native::heap::RawDescriptor;
use super::native::pipeline::{
    BindGroup, RawComputePipeline, RawGraphicsPipeline, RawRootSignature, RootParameter,
    TableKind, UniformStage,
};
use super::native::shader::{self, ShaderProgram};
use super::DeviceShared;

/// Register spaces assigned per stage so bind points stay disjoint.
const VERTEX_TABLE_SPACE: u32 = 0;
const VERTEX_UNIFORM_SPACE: u32 = 1;
const FRAGMENT_TABLE_SPACE: u32 = 2;
const FRAGMENT_UNIFORM_SPACE: u32 = 3;
const COMPUTE_READ_SPACE: u32 = 0;
const COMPUTE_WRITE_SPACE: u32 = 1;
const COMPUTE_UNIFORM_SPACE: u32 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ResourceCounts {
    pub(crate) samplers: u32,
    pub(crate) storage_textures: u32,
    pub(crate) storage_buffers: u32,
    pub(crate) uniform_buffers: u32,
}

pub(crate) struct ShaderInner {
    pub(crate) stage: ShaderStage,
    pub(crate) program: ShaderProgram,
    pub(crate) entry_point: String,
    pub(crate) counts: ResourceCounts,
}

/// A compiled shader plus its declared resource counts.
#[derive(Clone)]
pub struct Shader {
    pub(crate) inner: Arc<ShaderInner>,
}

impl Shader {
    pub fn stage(&self) -> ShaderStage {
        self.inner.stage
    }
}

impl std::fmt::Debug for Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("stage", &self.inner.stage)
            .field("entry_point", &self.inner.entry_point)
            .finish()
    }
}

pub(crate) fn create_shader(info: &ShaderCreateInfo<'_>) -> Result<Shader> {
    let program = shader::parse(info.bytecode).map_err(Error::InvalidBytecode)?;
    match (info.stage, program) {
        (ShaderStage::Vertex, ShaderProgram::Vertex(_))
        | (ShaderStage::Fragment, ShaderProgram::Fragment(_)) => {}
        _ => {
            return Err(Error::InvalidBytecode(format!(
                "bytecode does not contain a {:?} program",
                info.stage
            )))
        }
    }
    Ok(Shader {
        inner: Arc::new(ShaderInner {
            stage: info.stage,
            program,
            entry_point: info.entry_point.to_owned(),
            counts: ResourceCounts {
                samplers: info.num_samplers,
                storage_textures: info.num_storage_textures,
                storage_buffers: info.num_storage_buffers,
                uniform_buffers: info.num_uniform_buffers,
            },
        }),
    })
}

pub(crate) struct SamplerInner {
    device: Weak<DeviceShared>,
    pub(crate) desc: SamplerCreateInfo,
    pub(crate) descriptor: CpuDescriptor,
}

impl Drop for SamplerInner {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            device.staging.lock().unwrap().sampler.release(&mut self.descriptor);
        }
    }
}

/// A sampler state object backed by one staging sampler descriptor.
#[derive(Clone)]
pub struct Sampler {
    pub(crate) inner: Arc<SamplerInner>,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").field("desc", &self.inner.desc).finish()
    }
}

pub(crate) fn create_sampler(
    device: &Arc<DeviceShared>,
    info: &SamplerCreateInfo,
) -> Result<Sampler> {
    let descriptor = device.staging.lock().unwrap().sampler.allocate();
    if !descriptor.is_valid() {
        return Err(Error::ResourceCreation("sampler staging heap exhausted".into()));
    }
    descriptor.write(RawDescriptor::Sampler { desc: info.clone() });
    Ok(Sampler {
        inner: Arc::new(SamplerInner {
            device: Arc::downgrade(device),
            desc: info.clone(),
            descriptor,
        }),
    })
}

/// Root parameter indices one stage's bind groups resolved to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageRootIndices {
    pub(crate) sampler_table: i32,
    pub(crate) sampler_texture_table: i32,
    pub(crate) storage_texture_table: i32,
    pub(crate) storage_buffer_table: i32,
    /// Index of uniform slot 0's root CBV; slot `i` is at `base + i`.
    pub(crate) uniform_base: i32,
}

impl StageRootIndices {
    const NONE: Self = Self {
        sampler_table: -1,
        sampler_texture_table: -1,
        storage_texture_table: -1,
        storage_buffer_table: -1,
        uniform_base: -1,
    };
}

pub(crate) struct GraphicsRootLayout {
    pub(crate) signature: Arc<RawRootSignature>,
    pub(crate) vertex: StageRootIndices,
    pub(crate) fragment: StageRootIndices,
}

fn stage_parameters(
    parameters: &mut Vec<RootParameter>,
    counts: &ResourceCounts,
    stage: ShaderStage,
) -> StageRootIndices {
    let (sampler_group, texture_group, storage_texture_group, storage_buffer_group) = match stage {
        ShaderStage::Vertex => (
            BindGroup::VertexSamplers,
            BindGroup::VertexSampledTextures,
            BindGroup::VertexStorageTextures,
            BindGroup::VertexStorageBuffers,
        ),
        ShaderStage::Fragment => (
            BindGroup::FragmentSamplers,
            BindGroup::FragmentSampledTextures,
            BindGroup::FragmentStorageTextures,
            BindGroup::FragmentStorageBuffers,
        ),
    };
    let (table_space, uniform_space, uniform_stage) = match stage {
        ShaderStage::Vertex => (VERTEX_TABLE_SPACE, VERTEX_UNIFORM_SPACE, UniformStage::Vertex),
        ShaderStage::Fragment => {
            (FRAGMENT_TABLE_SPACE, FRAGMENT_UNIFORM_SPACE, UniformStage::Fragment)
        }
    };

    let mut indices = StageRootIndices::NONE;
    let mut push = |parameters: &mut Vec<RootParameter>, parameter: RootParameter| -> i32 {
        parameters.push(parameter);
        parameters.len() as i32 - 1
    };

    if counts.samplers > 0 {
        indices.sampler_table = push(
            parameters,
            RootParameter::Table {
                group: sampler_group,
                kind: TableKind::Sampler,
                count: counts.samplers,
                register_space: table_space,
            },
        );
        indices.sampler_texture_table = push(
            parameters,
            RootParameter::Table {
                group: texture_group,
                kind: TableKind::Srv,
                count: counts.samplers,
                register_space: table_space,
            },
        );
    }
    if counts.storage_textures > 0 {
        indices.storage_texture_table = push(
            parameters,
            RootParameter::Table {
                group: storage_texture_group,
                kind: TableKind::Srv,
                count: counts.storage_textures,
                register_space: table_space,
            },
        );
    }
    if counts.storage_buffers > 0 {
        indices.storage_buffer_table = push(
            parameters,
            RootParameter::Table {
                group: storage_buffer_group,
                kind: TableKind::Srv,
                count: counts.storage_buffers,
                register_space: table_space,
            },
        );
    }
    for slot in 0..counts.uniform_buffers {
        let index = push(
            parameters,
            RootParameter::ConstantBuffer {
                stage: uniform_stage,
                slot,
                register_space: uniform_space,
            },
        );
        if slot == 0 {
            indices.uniform_base = index;
        }
    }
    indices
}

pub(crate) fn build_graphics_root_layout(
    device: &DeviceShared,
    vertex: &ResourceCounts,
    fragment: &ResourceCounts,
) -> GraphicsRootLayout {
    let mut parameters = Vec::new();
    let vertex_indices = stage_parameters(&mut parameters, vertex, ShaderStage::Vertex);
    let fragment_indices = stage_parameters(&mut parameters, fragment, ShaderStage::Fragment);
    GraphicsRootLayout {
        signature: RawRootSignature::new(&device.raw, parameters),
        vertex: vertex_indices,
        fragment: fragment_indices,
    }
}

pub(crate) struct ComputeRootLayout {
    pub(crate) signature: Arc<RawRootSignature>,
    pub(crate) read_texture_table: i32,
    pub(crate) read_buffer_table: i32,
    pub(crate) write_texture_table: i32,
    pub(crate) write_buffer_table: i32,
    pub(crate) uniform_base: i32,
}

pub(crate) fn build_compute_root_layout(
    device: &DeviceShared,
    info: &ComputePipelineCreateInfo<'_>,
) -> ComputeRootLayout {
    let mut parameters = Vec::new();
    let mut push = |parameter: RootParameter| -> i32 {
        parameters.push(parameter);
        parameters.len() as i32 - 1
    };
    let mut read_texture_table = -1;
    let mut read_buffer_table = -1;
    let mut write_texture_table = -1;
    let mut write_buffer_table = -1;
    let mut uniform_base = -1;
    if info.num_readonly_storage_textures > 0 {
        read_texture_table = push(RootParameter::Table {
            group: BindGroup::ComputeReadStorageTextures,
            kind: TableKind::Srv,
            count: info.num_readonly_storage_textures,
            register_space: COMPUTE_READ_SPACE,
        });
    }
    if info.num_readonly_storage_buffers > 0 {
        read_buffer_table = push(RootParameter::Table {
            group: BindGroup::ComputeReadStorageBuffers,
            kind: TableKind::Srv,
            count: info.num_readonly_storage_buffers,
            register_space: COMPUTE_READ_SPACE,
        });
    }
    if info.num_readwrite_storage_textures > 0 {
        write_texture_table = push(RootParameter::Table {
            group: BindGroup::ComputeWriteStorageTextures,
            kind: TableKind::Uav,
            count: info.num_readwrite_storage_textures,
            register_space: COMPUTE_WRITE_SPACE,
        });
    }
    if info.num_readwrite_storage_buffers > 0 {
        write_buffer_table = push(RootParameter::Table {
            group: BindGroup::ComputeWriteStorageBuffers,
            kind: TableKind::Uav,
            count: info.num_readwrite_storage_buffers,
            register_space: COMPUTE_WRITE_SPACE,
        });
    }
    for slot in 0..info.num_uniform_buffers {
        let index = push(RootParameter::ConstantBuffer {
            stage: UniformStage::Compute,
            slot,
            register_space: COMPUTE_UNIFORM_SPACE,
        });
        if slot == 0 {
            uniform_base = index;
        }
    }
    ComputeRootLayout {
        signature: RawRootSignature::new(&device.raw, parameters),
        read_texture_table,
        read_buffer_table,
        write_texture_table,
        write_buffer_table,
        uniform_base,
    }
}

pub(crate) struct GraphicsPipelineInner {
    pub(crate) raw: Arc<RawGraphicsPipeline>,
    pub(crate) root: GraphicsRootLayout,
    pub(crate) vertex_counts: ResourceCounts,
    pub(crate) fragment_counts: ResourceCounts,
    pub(crate) topology: PrimitiveTopology,
    pub(crate) blend_constants: [f32; 4],
    pub(crate) stencil_reference: u8,
}

/// Graphics pipeline state plus its root signature.
#[derive(Clone)]
pub struct GraphicsPipeline {
    pub(crate) inner: Arc<GraphicsPipelineInner>,
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("topology", &self.inner.topology)
            .field("color_targets", &self.inner.raw.color_formats)
            .finish()
    }
}

pub(crate) fn create_graphics_pipeline(
    device: &Arc<DeviceShared>,
    info: &GraphicsPipelineCreateInfo<'_>,
) -> Result<GraphicsPipeline> {
    if info.vertex_shader.inner.stage != ShaderStage::Vertex {
        return Err(Error::ResourceCreation("vertex_shader is not a vertex shader".into()));
    }
    if info.fragment_shader.inner.stage != ShaderStage::Fragment {
        return Err(Error::ResourceCreation("fragment_shader is not a fragment shader".into()));
    }
    if info.target_info.color_targets.len() > MAX_COLOR_TARGETS {
        return Err(Error::ResourceCreation(format!(
            "more than {MAX_COLOR_TARGETS} color targets"
        )));
    }
    if info.target_info.color_targets.is_empty() && info.target_info.depth_stencil_format.is_none()
    {
        return Err(Error::ResourceCreation("pipeline renders into no attachments".into()));
    }
    if info.vertex_input_state.vertex_buffers.len() > MAX_VERTEX_BUFFERS
        || info.vertex_input_state.vertex_attributes.len() > MAX_VERTEX_ATTRIBUTES
    {
        return Err(Error::ResourceCreation("vertex input exceeds the slot limits".into()));
    }
    let ShaderProgram::Vertex(vertex_program) = info.vertex_shader.inner.program else {
        return Err(Error::InvalidBytecode("vertex shader program mismatch".into()));
    };
    let ShaderProgram::Fragment(fragment_program) = info.fragment_shader.inner.program else {
        return Err(Error::InvalidBytecode("fragment shader program mismatch".into()));
    };

    let vertex_counts = info.vertex_shader.inner.counts;
    let fragment_counts = info.fragment_shader.inner.counts;
    let root = build_graphics_root_layout(device, &vertex_counts, &fragment_counts);
    let color_formats: Vec<TextureFormat> =
        info.target_info.color_targets.iter().map(|target| target.format).collect();
    let raw = RawGraphicsPipeline::new(
        &device.raw,
        Arc::clone(&root.signature),
        vertex_program,
        fragment_program,
        info.primitive_topology,
        color_formats,
        info.target_info.depth_stencil_format,
        info.sample_count,
    );
    Ok(GraphicsPipeline {
        inner: Arc::new(GraphicsPipelineInner {
            raw,
            root,
            vertex_counts,
            fragment_counts,
            topology: info.primitive_topology,
            blend_constants: info.blend_constants,
            stencil_reference: info.depth_stencil_state.reference,
        }),
    })
}

pub(crate) struct ComputePipelineInner {
    pub(crate) raw: Arc<RawComputePipeline>,
    pub(crate) root: ComputeRootLayout,
    pub(crate) num_readonly_storage_textures: u32,
    pub(crate) num_readonly_storage_buffers: u32,
    pub(crate) num_readwrite_storage_textures: u32,
    pub(crate) num_readwrite_storage_buffers: u32,
    pub(crate) num_uniform_buffers: u32,
}

/// Compute pipeline state plus its root signature.
#[derive(Clone)]
pub struct ComputePipeline {
    pub(crate) inner: Arc<ComputePipelineInner>,
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("thread_count", &self.inner.raw.thread_count)
            .finish()
    }
}

pub(crate) fn create_compute_pipeline(
    device: &Arc<DeviceShared>,
    info: &ComputePipelineCreateInfo<'_>,
) -> Result<ComputePipeline> {
    let program = shader::parse(info.bytecode).map_err(Error::InvalidBytecode)?;
    let ShaderProgram::Compute(program) = program else {
        return Err(Error::InvalidBytecode("bytecode does not contain a compute program".into()));
    };
    let (tx, ty, tz) = info.thread_count;
    if tx == 0 || ty == 0 || tz == 0 {
        return Err(Error::ResourceCreation("zero compute thread count".into()));
    }
    let root = build_compute_root_layout(device, info);
    let raw = RawComputePipeline::new(
        &device.raw,
        Arc::clone(&root.signature),
        program,
        info.thread_count,
    );
    Ok(ComputePipeline {
        inner: Arc::new(ComputePipelineInner {
            raw,
            root,
            num_readonly_storage_textures: info.num_readonly_storage_textures,
            num_readonly_storage_buffers: info.num_readonly_storage_buffers,
            num_readwrite_storage_textures: info.num_readwrite_storage_textures,
            num_readwrite_storage_buffers: info.num_readwrite_storage_buffers,
            num_uniform_buffers: info.num_uniform_buffers,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiled::Device;
    use crate::DeviceCreateInfo;

    fn counts(samplers: u32, textures: u32, buffers: u32, uniforms: u32) -> ResourceCounts {
        ResourceCounts {
            samplers,
            storage_textures: textures,
            storage_buffers: buffers,
            uniform_buffers: uniforms,
        }
    }

    #[test]
    fn empty_groups_are_skipped_and_indices_stay_negative() {
        let device = Device::new(&DeviceCreateInfo::default()).unwrap();
        let layout = build_graphics_root_layout(
            device.shared(),
            &counts(0, 0, 0, 1),
            &counts(2, 0, 1, 0),
        );
        // Vertex: one root CBV. Fragment: sampler table, SRV table for the
        // sampled textures, storage-buffer table.
        assert_eq!(layout.signature.parameters.len(), 4);
        assert_eq!(layout.vertex.sampler_table, -1);
        assert_eq!(layout.vertex.uniform_base, 0);
        assert_eq!(layout.fragment.sampler_table, 1);
        assert_eq!(layout.fragment.sampler_texture_table, 2);
        assert_eq!(layout.fragment.storage_buffer_table, 3);
        assert_eq!(layout.fragment.uniform_base, -1);
    }

    #[test]
    fn stages_get_disjoint_register_spaces() {
        let device = Device::new(&DeviceCreateInfo::default()).unwrap();
        let layout = build_graphics_root_layout(
            device.shared(),
            &counts(1, 0, 0, 1),
            &counts(1, 0, 0, 1),
        );
        let spaces: Vec<u32> = layout
            .signature
            .parameters
            .iter()
            .map(|parameter| match parameter {
                RootParameter::Table { register_space, .. }
                | RootParameter::ConstantBuffer { register_space, .. } => *register_space,
            })
            .collect();
        assert_eq!(spaces, vec![0, 0, 1, 2, 2, 3]);
    }
}
