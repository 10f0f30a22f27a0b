//! Internal blit pipelines and samplers.
//!
//! Device initialization compiles a fullscreen-triangle vertex program plus
//! one fragment program per source dimensionality (2D, 2D array, 3D, cube)
//! and creates a nearest and a linear sampler. The generic region-to-region
//! blit records a one-draw render pass against the destination; mipmap
//! generation chains per-level blits through the same path.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::{
    BlitInfo, ColorAttachmentInfo, ColorTargetBlendState, ColorTargetDescription, DepthStencilState,
    Filter, GraphicsPipelineCreateInfo, GraphicsPipelineTargetInfo, LoadOp, PrimitiveTopology,
    RasterizerState, SampleCount, SamplerCreateInfo, ShaderCreateInfo, ShaderStage, StoreOp,
    TextureFormat, TextureSamplerBinding, TextureType, TextureUsage, VertexInputState, Viewport,
};

use super::command::CommandBuffer;
use super::pipeline::{self, GraphicsPipeline, Sampler, Shader};
use super::resource::Texture;
use super::{bytecode, DeviceShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlitPipelineKey {
    source_type: TextureType,
    format: TextureFormat,
}

pub(crate) struct BlitResources {
    nearest: Sampler,
    linear: Sampler,
    vertex_shader: Shader,
    fragment_2d: Shader,
    fragment_2d_array: Shader,
    fragment_3d: Shader,
    fragment_cube: Shader,
    pipelines: Mutex<Vec<(BlitPipelineKey, GraphicsPipeline)>>,
}

impl BlitResources {
    pub(crate) fn create(device: &Arc<DeviceShared>) -> Result<Self> {
        let sampler = |filter: Filter| SamplerCreateInfo {
            min_filter: filter,
            mag_filter: filter,
            ..SamplerCreateInfo::default()
        };
        let fragment = |blob: Vec<u8>| -> Result<Shader> {
            pipeline::create_shader(&ShaderCreateInfo {
                stage: ShaderStage::Fragment,
                bytecode: &blob,
                entry_point: "main",
                num_samplers: 1,
                num_storage_textures: 0,
                num_storage_buffers: 0,
                num_uniform_buffers: 1,
            })
        };
        let vertex_blob = bytecode::vertex_fullscreen_triangle();
        Ok(Self {
            nearest: pipeline::create_sampler(device, &sampler(Filter::Nearest))?,
            linear: pipeline::create_sampler(device, &sampler(Filter::Linear))?,
            vertex_shader: pipeline::create_shader(&ShaderCreateInfo {
                stage: ShaderStage::Vertex,
                bytecode: &vertex_blob,
                entry_point: "main",
                num_samplers: 0,
                num_storage_textures: 0,
                num_storage_buffers: 0,
                num_uniform_buffers: 0,
            })?,
            fragment_2d: fragment(bytecode::fragment_blit_from_2d())?,
            fragment_2d_array: fragment(bytecode::fragment_blit_from_2d_array())?,
            fragment_3d: fragment(bytecode::fragment_blit_from_3d())?,
            fragment_cube: fragment(bytecode::fragment_blit_from_cube())?,
            pipelines: Mutex::new(Vec::new()),
        })
    }

    fn sampler(&self, filter: Filter) -> &Sampler {
        match filter {
            Filter::Nearest => &self.nearest,
            Filter::Linear => &self.linear,
        }
    }

    /// Looks up (or lazily creates) the pipeline for one source
    /// dimensionality and destination format.
    fn pipeline_for(
        &self,
        device: &Arc<DeviceShared>,
        source_type: TextureType,
        format: TextureFormat,
    ) -> Result<GraphicsPipeline> {
        let key = BlitPipelineKey { source_type, format };
        let mut pipelines = self.pipelines.lock().unwrap();
        if let Some((_, pipeline)) = pipelines.iter().find(|(cached, _)| *cached == key) {
            return Ok(pipeline.clone());
        }
        let fragment_shader = match source_type {
            TextureType::D2 => &self.fragment_2d,
            TextureType::D2Array => &self.fragment_2d_array,
            TextureType::D3 => &self.fragment_3d,
            TextureType::Cube => &self.fragment_cube,
        };
        let pipeline = pipeline::create_graphics_pipeline(
            device,
            &GraphicsPipelineCreateInfo {
                vertex_shader: &self.vertex_shader,
                fragment_shader,
                vertex_input_state: VertexInputState::default(),
                primitive_topology: PrimitiveTopology::TriangleList,
                rasterizer_state: RasterizerState::default(),
                depth_stencil_state: DepthStencilState::default(),
                blend_constants: [0.0; 4],
                sample_count: SampleCount::One,
                target_info: GraphicsPipelineTargetInfo {
                    color_targets: vec![ColorTargetDescription {
                        format,
                        blend_state: ColorTargetBlendState::default(),
                    }],
                    depth_stencil_format: None,
                },
            },
        )?;
        pipelines.push((key, pipeline.clone()));
        Ok(pipeline)
    }
}

/// The fragment-uniform block: source region normalized to the source level
/// dimensions, plus the sampled mip and layer (or depth plane).
fn blit_uniforms(info: &BlitInfo<'_>) -> [u8; 24] {
    let source = &info.source;
    let desc = &source.texture.container.info;
    let level_w = (desc.width >> source.mip_level).max(1) as f32;
    let level_h = (desc.height >> source.mip_level).max(1) as f32;
    let values = [
        source.x as f32 / level_w,
        source.y as f32 / level_h,
        source.w as f32 / level_w,
        source.h as f32 / level_h,
        source.mip_level as f32,
        source.layer_or_depth_plane as f32,
    ];
    let mut bytes = [0u8; 24];
    for (chunk, value) in bytes.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    bytes
}

impl CommandBuffer {
    /// Region-to-region blit through the internal fullscreen pipeline. Must
    /// be recorded outside of any pass. The destination loads its previous
    /// contents unless the region covers the whole destination sub-resource,
    /// in which case it is cleared (and may cycle).
    pub fn blit(&mut self, info: &BlitInfo<'_>) -> Result<()> {
        let source = info.source.texture;
        let destination = info.destination.texture;
        if !source.usage().contains(TextureUsage::SAMPLER) {
            return Err(Error::ResourceCreation("blit source requires sampler usage".into()));
        }
        if !destination.usage().contains(TextureUsage::COLOR_TARGET) {
            return Err(Error::ResourceCreation(
                "blit destination requires color-target usage".into(),
            ));
        }

        let device = Arc::clone(&self.device);
        let resources = device.blit_resources();
        let pipeline =
            resources.pipeline_for(&device, source.texture_type(), destination.format())?;
        let sampler = resources.sampler(info.filter).clone();

        let dst = &info.destination;
        let dst_level_w = (destination.width() >> dst.mip_level).max(1);
        let dst_level_h = (destination.height() >> dst.mip_level).max(1);
        let full_coverage =
            dst.x == 0 && dst.y == 0 && dst.w == dst_level_w && dst.h == dst_level_h;
        let uniforms = blit_uniforms(info);

        let mut pass = self.begin_render_pass(
            &[ColorAttachmentInfo {
                texture: destination,
                mip_level: dst.mip_level,
                layer_or_depth_plane: dst.layer_or_depth_plane,
                clear_color: [0.0; 4],
                load_op: if full_coverage { LoadOp::Clear } else { LoadOp::Load },
                store_op: StoreOp::Store,
                cycle: info.cycle && full_coverage,
            }],
            None,
        )?;
        pass.bind_graphics_pipeline(&pipeline);
        pass.bind_fragment_samplers(0, &[TextureSamplerBinding { texture: source, sampler: &sampler }]);
        pass.push_fragment_uniform_data(0, &uniforms);
        pass.set_viewport(&Viewport {
            x: dst.x as f32,
            y: dst.y as f32,
            w: dst.w as f32,
            h: dst.h as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        pass.draw_primitives(3, 1, 0, 0);
        pass.end();
        Ok(())
    }

    /// Generates levels `1..n` of a texture by blitting each level from the
    /// one above it. Requires sampler and color-target usage.
    pub fn generate_mipmaps(&mut self, texture: &Texture) -> Result<()> {
        let info = &texture.container.info;
        if !info.usage.contains(TextureUsage::SAMPLER | TextureUsage::COLOR_TARGET) {
            return Err(Error::ResourceCreation(
                "mipmap generation requires sampler and color-target usage".into(),
            ));
        }
        if info.level_count < 2 {
            return Ok(());
        }
        for layer in 0..info.layer_count() {
            for level in 1..info.level_count {
                let src_w = (info.width >> (level - 1)).max(1);
                let src_h = (info.height >> (level - 1)).max(1);
                let dst_w = (info.width >> level).max(1);
                let dst_h = (info.height >> level).max(1);
                self.blit(&BlitInfo {
                    source: crate::BlitRegion {
                        texture,
                        mip_level: level - 1,
                        layer_or_depth_plane: layer,
                        x: 0,
                        y: 0,
                        w: src_w,
                        h: src_h,
                    },
                    destination: crate::BlitRegion {
                        texture,
                        mip_level: level,
                        layer_or_depth_plane: layer,
                        x: 0,
                        y: 0,
                        w: dst_w,
                        h: dst_h,
                    },
                    filter: Filter::Linear,
                    cycle: false,
                })?;
            }
        }
        Ok(())
    }
}
