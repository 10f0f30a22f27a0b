//! Ember GPU: a command-buffer-oriented GPU abstraction core.
//!
//! Applications describe pipelines and resources through uniform descriptor
//! structs, record commands into transient command buffers, and submit them to
//! a GPU queue; the library handles resource state transitions, descriptor
//! allocation, swapchain acquisition, and inter-frame synchronization.
//!
//! This crate ships the reference **tiled-resource** backend (the desktop
//! explicit API with descriptor heaps and root signatures). The Vulkan and
//! Metal backends obey the same contracts with backend-specific transition
//! and binding primitives and live out of tree.

pub mod error;
pub mod tiled;

pub use error::Error;
pub use tiled::{
    Buffer, CommandBuffer, ComputePass, ComputePipeline, CopyPass, Device, Fence,
    GraphicsPipeline, RenderPass, Sampler, Shader, SwapchainTexture, Texture, TransferBuffer,
    TransferMap, Window,
};

/// Identifies which native backend a device talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Tiled,
    Vulkan,
    Metal,
}

/// Number of swapchain back buffers and in-flight frames per claimed window.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Per-stage binding slot limits. Pipelines declare how many of each slot
/// they consume; bind calls may not exceed these.
pub const MAX_TEXTURE_SAMPLERS_PER_STAGE: usize = 16;
pub const MAX_STORAGE_TEXTURES_PER_STAGE: usize = 8;
pub const MAX_STORAGE_BUFFERS_PER_STAGE: usize = 8;
pub const MAX_UNIFORM_BUFFERS_PER_STAGE: usize = 4;
pub const MAX_COLOR_TARGETS: usize = 4;
pub const MAX_VERTEX_BUFFERS: usize = 16;
pub const MAX_VERTEX_ATTRIBUTES: usize = 16;

bitflags::bitflags! {
    /// How a buffer may be used for the lifetime of its container.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const INDIRECT = 1 << 2;
        const GRAPHICS_STORAGE_READ = 1 << 3;
        const GRAPHICS_STORAGE_WRITE = 1 << 4;
        const COMPUTE_STORAGE_READ = 1 << 5;
        const COMPUTE_STORAGE_WRITE = 1 << 6;
    }
}

bitflags::bitflags! {
    /// How a texture may be used for the lifetime of its container.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLER = 1 << 0;
        const COLOR_TARGET = 1 << 1;
        const DEPTH_STENCIL_TARGET = 1 << 2;
        const GRAPHICS_STORAGE_READ = 1 << 3;
        const GRAPHICS_STORAGE_WRITE = 1 << 4;
        const COMPUTE_STORAGE_READ = 1 << 5;
        const COMPUTE_STORAGE_WRITE = 1 << 6;
    }
}

/// Transfer buffers are host-visible staging memory on one side of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferBufferUsage {
    /// Persistently mapped; source of uploads.
    Upload,
    /// Mapped on demand; destination of downloads.
    Download,
}

/// Texture dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureType {
    #[default]
    D2,
    D2Array,
    D3,
    Cube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgb10A2Unorm,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    Rgba32Uint,
    Bc1RgbaUnorm,
    Bc3RgbaUnorm,
    Bc7RgbaUnorm,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8Uint,
}

impl TextureFormat {
    /// Byte size of one texel block (the whole 4x4 block for BC formats).
    pub fn texel_block_size(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm | TextureFormat::R16Float | TextureFormat::D16Unorm => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Rgb10A2Unorm
            | TextureFormat::Rg16Float
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::D24UnormS8Uint
            | TextureFormat::D32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float | TextureFormat::D32FloatS8Uint => 8,
            TextureFormat::Rgba32Float | TextureFormat::Rgba32Uint => 16,
            TextureFormat::Bc1RgbaUnorm => 8,
            TextureFormat::Bc3RgbaUnorm | TextureFormat::Bc7RgbaUnorm => 16,
        }
    }

    /// Side length in texels of one block (1 for uncompressed formats).
    pub fn block_dimension(self) -> u32 {
        match self {
            TextureFormat::Bc1RgbaUnorm | TextureFormat::Bc3RgbaUnorm | TextureFormat::Bc7RgbaUnorm => 4,
            _ => 1,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            TextureFormat::D16Unorm
                | TextureFormat::D24UnormS8Uint
                | TextureFormat::D32Float
                | TextureFormat::D32FloatS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::D24UnormS8Uint | TextureFormat::D32FloatS8Uint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SampleCount {
    #[default]
    One,
    Two,
    Four,
    Eight,
}

impl SampleCount {
    pub fn as_u32(self) -> u32 {
        match self {
            SampleCount::One => 1,
            SampleCount::Two => 2,
            SampleCount::Four => 4,
            SampleCount::Eight => 8,
        }
    }
}

/// Presentation policy for a claimed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentMode {
    /// Sync interval 0; tearing allowed when the device supports it.
    Immediate,
    /// Sync interval 1; acquisition blocks until the in-flight slot retires.
    #[default]
    Vsync,
    /// Sync interval 0; acquisition never blocks and may skip frames.
    Mailbox,
}

/// Back-buffer format/colorspace pairing for a claimed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwapchainComposition {
    /// 8-bit non-linear.
    #[default]
    Sdr,
    /// 8-bit non-linear texture with a linear (sRGB) render-target view.
    SdrLinear,
    /// 16-bit float scRGB linear.
    Hdr16Float,
    /// 10-bit non-linear PQ.
    Hdr10,
}

impl SwapchainComposition {
    pub fn texture_format(self) -> TextureFormat {
        match self {
            SwapchainComposition::Sdr => TextureFormat::Bgra8Unorm,
            SwapchainComposition::SdrLinear => TextureFormat::Bgra8UnormSrgb,
            SwapchainComposition::Hdr16Float => TextureFormat::Rgba16Float,
            SwapchainComposition::Hdr10 => TextureFormat::Rgb10A2Unorm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadOp {
    #[default]
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerMipmapMode {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerAddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareOp {
    #[default]
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendFactor {
    #[default]
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ColorComponentFlags: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

impl Default for ColorComponentFlags {
    fn default() -> Self {
        ColorComponentFlags::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    #[default]
    Fill,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveTopology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    LineStrip,
    PointList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexElementSize {
    #[default]
    U16,
    U32,
}

impl IndexElementSize {
    pub fn byte_size(self) -> u64 {
        match self {
            IndexElementSize::U16 => 2,
            IndexElementSize::U32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexInputRate {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexElementFormat {
    Float,
    Float2,
    #[default]
    Float3,
    Float4,
    Int,
    Int4,
    Uint,
    Uint4,
    Ubyte4Norm,
}

impl VertexElementFormat {
    pub fn byte_size(self) -> u32 {
        match self {
            VertexElementFormat::Float | VertexElementFormat::Int | VertexElementFormat::Uint => 4,
            VertexElementFormat::Float2 => 8,
            VertexElementFormat::Float3 => 12,
            VertexElementFormat::Float4 | VertexElementFormat::Int4 | VertexElementFormat::Uint4 => 16,
            VertexElementFormat::Ubyte4Norm => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VertexAttribute {
    pub location: u32,
    pub buffer_slot: u32,
    pub format: VertexElementFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VertexBufferDescription {
    pub slot: u32,
    pub pitch: u32,
    pub input_rate: VertexInputRate,
}

#[derive(Debug, Clone, Default)]
pub struct VertexInputState {
    pub vertex_buffers: Vec<VertexBufferDescription>,
    pub vertex_attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RasterizerState {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_bias_constant_factor: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope_factor: f32,
    pub enable_depth_bias: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StencilOpState {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DepthStencilState {
    pub enable_depth_test: bool,
    pub enable_depth_write: bool,
    pub compare_op: CompareOp,
    pub enable_stencil_test: bool,
    pub front_stencil_state: StencilOpState,
    pub back_stencil_state: StencilOpState,
    pub compare_mask: u8,
    pub write_mask: u8,
    pub reference: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ColorTargetBlendState {
    pub enable_blend: bool,
    pub src_color_blend_factor: BlendFactor,
    pub dst_color_blend_factor: BlendFactor,
    pub color_blend_op: BlendOp,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
    pub color_write_mask: ColorComponentFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct ColorTargetDescription {
    pub format: TextureFormat,
    pub blend_state: ColorTargetBlendState,
}

/// Attachment formats a graphics pipeline renders into.
#[derive(Debug, Clone, Default)]
pub struct GraphicsPipelineTargetInfo {
    pub color_targets: Vec<ColorTargetDescription>,
    pub depth_stencil_format: Option<TextureFormat>,
}

#[derive(Debug, Clone)]
pub struct TextureCreateInfo {
    pub texture_type: TextureType,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub width: u32,
    pub height: u32,
    /// Array layers for D2Array (6 for Cube), depth for D3, 1 for D2.
    pub layer_count_or_depth: u32,
    pub level_count: u32,
    pub sample_count: SampleCount,
}

impl Default for TextureCreateInfo {
    fn default() -> Self {
        Self {
            texture_type: TextureType::D2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLER,
            width: 1,
            height: 1,
            layer_count_or_depth: 1,
            level_count: 1,
            sample_count: SampleCount::One,
        }
    }
}

impl TextureCreateInfo {
    /// Array layers as seen by sub-resource addressing (depth slices of a 3D
    /// texture belong to a single sub-resource per level).
    pub fn layer_count(&self) -> u32 {
        match self.texture_type {
            TextureType::D3 => 1,
            _ => self.layer_count_or_depth,
        }
    }

    pub fn depth(&self) -> u32 {
        match self.texture_type {
            TextureType::D3 => self.layer_count_or_depth,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SamplerCreateInfo {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mipmap_mode: SamplerMipmapMode,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub compare_op: Option<CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
}

/// Shader bytecode plus the resource counts the root-signature builder
/// consumes. Bytecode is opaque to the API and must match the backend's
/// declared format (see [`tiled::bytecode`] for the tiled backend).
#[derive(Debug, Clone)]
pub struct ShaderCreateInfo<'a> {
    pub stage: ShaderStage,
    pub bytecode: &'a [u8],
    pub entry_point: &'a str,
    pub num_samplers: u32,
    pub num_storage_textures: u32,
    pub num_storage_buffers: u32,
    pub num_uniform_buffers: u32,
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineCreateInfo<'a> {
    pub vertex_shader: &'a Shader,
    pub fragment_shader: &'a Shader,
    pub vertex_input_state: VertexInputState,
    pub primitive_topology: PrimitiveTopology,
    pub rasterizer_state: RasterizerState,
    pub depth_stencil_state: DepthStencilState,
    pub blend_constants: [f32; 4],
    pub sample_count: SampleCount,
    pub target_info: GraphicsPipelineTargetInfo,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineCreateInfo<'a> {
    pub bytecode: &'a [u8],
    pub entry_point: &'a str,
    pub num_readonly_storage_textures: u32,
    pub num_readonly_storage_buffers: u32,
    pub num_readwrite_storage_textures: u32,
    pub num_readwrite_storage_buffers: u32,
    pub num_uniform_buffers: u32,
    pub thread_count: (u32, u32, u32),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// One color attachment of a render pass.
#[derive(Clone)]
pub struct ColorAttachmentInfo<'a> {
    pub texture: &'a Texture,
    pub mip_level: u32,
    pub layer_or_depth_plane: u32,
    pub clear_color: [f32; 4],
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    /// Rotate the container to an unreferenced concrete texture before
    /// writing. Ignored (forced off) when `load_op` is `Load`.
    pub cycle: bool,
}

#[derive(Clone)]
pub struct DepthStencilAttachmentInfo<'a> {
    pub texture: &'a Texture,
    pub clear_depth: f32,
    pub clear_stencil: u8,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub cycle: bool,
}

/// Texture + sampler pair for a sampler binding slot.
#[derive(Clone, Copy)]
pub struct TextureSamplerBinding<'a> {
    pub texture: &'a Texture,
    pub sampler: &'a Sampler,
}

/// Read-write storage texture binding of a compute pass.
#[derive(Clone, Copy)]
pub struct StorageTextureReadWriteBinding<'a> {
    pub texture: &'a Texture,
    pub mip_level: u32,
    pub layer: u32,
    pub cycle: bool,
}

/// Read-write storage buffer binding of a compute pass.
#[derive(Clone, Copy)]
pub struct StorageBufferReadWriteBinding<'a> {
    pub buffer: &'a Buffer,
    pub cycle: bool,
}

#[derive(Clone, Copy)]
pub struct BufferBinding<'a> {
    pub buffer: &'a Buffer,
    pub offset: u64,
}

/// Source/destination of a buffer upload or download.
#[derive(Clone, Copy)]
pub struct TransferBufferLocation<'a> {
    pub transfer_buffer: &'a TransferBuffer,
    pub offset: u64,
}

/// Layout of texture data inside a transfer buffer. Zero `pixels_per_row` or
/// `rows_per_layer` means tightly packed from the region dimensions.
#[derive(Clone, Copy)]
pub struct TextureTransferInfo<'a> {
    pub transfer_buffer: &'a TransferBuffer,
    pub offset: u64,
    pub pixels_per_row: u32,
    pub rows_per_layer: u32,
}

#[derive(Clone, Copy)]
pub struct TextureRegion<'a> {
    pub texture: &'a Texture,
    pub mip_level: u32,
    pub layer: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
    pub h: u32,
    pub d: u32,
}

#[derive(Clone, Copy)]
pub struct TextureLocation<'a> {
    pub texture: &'a Texture,
    pub mip_level: u32,
    pub layer: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Clone, Copy)]
pub struct BufferRegion<'a> {
    pub buffer: &'a Buffer,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy)]
pub struct BlitRegion<'a> {
    pub texture: &'a Texture,
    pub mip_level: u32,
    pub layer_or_depth_plane: u32,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Clone, Copy)]
pub struct BlitInfo<'a> {
    pub source: BlitRegion<'a>,
    pub destination: BlitRegion<'a>,
    pub filter: Filter,
    /// Cycle the destination container when the full destination is covered.
    pub cycle: bool,
}

/// Device-wide capabilities surfaced read-only after creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFeatures {
    pub uma: bool,
    pub cache_coherent_uma: bool,
    pub fast_uniform_upload_heap: bool,
    pub tearing: bool,
}

/// Property bag consumed at device creation.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    /// Default semantic name assigned to vertex input elements.
    pub vertex_semantic: String,
    /// How many submissions the driver keeps in flight before work completes
    /// on a poll. Models GPU latency on the in-process driver.
    pub completion_latency: u64,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            vertex_semantic: "TEXCOORD".to_string(),
            completion_latency: 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceCreateInfo {
    /// Enables the driver debug layer and barrier validation. Overridden by
    /// the `EMBER_DEBUG` environment variable (`1`/`0`).
    pub debug_mode: bool,
    pub prefer_low_power: bool,
    pub props: DeviceProperties,
}

/// Indirect draw argument record (matches the tiled backend's 16-byte layout).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndirectDrawArguments {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// Indexed indirect draw argument record (20 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndirectDrawIndexedArguments {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Indirect dispatch argument record (12 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndirectDispatchArguments {
    pub group_count_x: u32,
    pub group_count_y: u32,
    pub group_count_z: u32,
}
