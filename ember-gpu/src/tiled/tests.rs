//! End-to-end scenarios against the in-process driver: frame recording,
//! compute readback, cycling under load, swapchain policies, and fence
//! lifecycles. Every test asserts the debug layer stayed silent.

use std::sync::Arc;

use super::bytecode;
use super::native::list::DrawKind;
use super::native::resource::ResourceState;
use super::{Device, Window};
use crate::{
    BlitInfo, BlitRegion, BufferRegion, BufferUsage, ColorAttachmentInfo,
    ComputePipelineCreateInfo, DeviceCreateInfo, DeviceProperties, Driver,
    GraphicsPipelineCreateInfo, GraphicsPipelineTargetInfo, ColorTargetDescription,
    ColorTargetBlendState, DepthStencilState, Filter, LoadOp, PresentMode, PrimitiveTopology,
    RasterizerState, SampleCount, ShaderCreateInfo, ShaderStage, StorageBufferReadWriteBinding,
    StoreOp, SwapchainComposition, TextureCreateInfo, TextureRegion, TextureTransferInfo,
    TextureType, TextureUsage, TransferBufferLocation, TransferBufferUsage, VertexInputState,
};

fn test_device(completion_latency: u64) -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    Device::new(&DeviceCreateInfo {
        debug_mode: true,
        prefer_low_power: false,
        props: DeviceProperties { completion_latency, ..DeviceProperties::default() },
    })
    .unwrap()
}

fn assert_clean(device: &Device) {
    let messages = device.take_validation_messages();
    assert!(messages.is_empty(), "debug layer reported: {messages:?}");
}

fn simple_pipeline(
    device: &Device,
    format: crate::TextureFormat,
    vertex_uniforms: u32,
) -> super::GraphicsPipeline {
    let vertex_blob = bytecode::vertex_passthrough();
    let fragment_blob = bytecode::fragment_solid_color();
    let vertex_shader = device
        .create_shader(&ShaderCreateInfo {
            stage: ShaderStage::Vertex,
            bytecode: &vertex_blob,
            entry_point: "main",
            num_samplers: 0,
            num_storage_textures: 0,
            num_storage_buffers: 0,
            num_uniform_buffers: vertex_uniforms,
        })
        .unwrap();
    let fragment_shader = device
        .create_shader(&ShaderCreateInfo {
            stage: ShaderStage::Fragment,
            bytecode: &fragment_blob,
            entry_point: "main",
            num_samplers: 0,
            num_storage_textures: 0,
            num_storage_buffers: 0,
            num_uniform_buffers: 0,
        })
        .unwrap();
    device
        .create_graphics_pipeline(&GraphicsPipelineCreateInfo {
            vertex_shader: &vertex_shader,
            fragment_shader: &fragment_shader,
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
        })
        .unwrap()
}

fn color_target(device: &Device, width: u32, height: u32) -> super::Texture {
    device
        .create_texture(&TextureCreateInfo {
            texture_type: TextureType::D2,
            format: crate::TextureFormat::Rgba8Unorm,
            usage: TextureUsage::COLOR_TARGET,
            width,
            height,
            layer_count_or_depth: 1,
            level_count: 1,
            sample_count: SampleCount::One,
        })
        .unwrap()
}

fn clear_attachment<'a>(texture: &'a super::Texture, color: [f32; 4]) -> ColorAttachmentInfo<'a> {
    ColorAttachmentInfo {
        texture,
        mip_level: 0,
        layer_or_depth_plane: 0,
        clear_color: color,
        load_op: LoadOp::Clear,
        store_op: StoreOp::Store,
        cycle: false,
    }
}

#[test]
fn device_reports_tiled_driver() {
    let device = test_device(0);
    assert_eq!(device.driver(), Driver::Tiled);
    assert!(device.features().tearing);
}

#[test]
fn scenario_triangle_frame() {
    let device = test_device(2);
    let window = Window::new(640, 480);
    device
        .claim_window(&window, SwapchainComposition::SdrLinear, PresentMode::Vsync)
        .unwrap();
    let format = device.swapchain_texture_format(&window).unwrap();
    let pipeline = simple_pipeline(&device, format, 1);

    let mut cb = device.acquire_command_buffer().unwrap();
    let acquired = device.acquire_swapchain_texture(&mut cb, &window).unwrap().unwrap();
    assert_eq!((acquired.width, acquired.height), (640, 480));

    let mut pass = cb
        .begin_render_pass(&[clear_attachment(&acquired.texture, [0.0, 0.0, 0.0, 1.0])], None)
        .unwrap();
    pass.bind_graphics_pipeline(&pipeline);
    let mvp = [0x11u8; 64];
    pass.push_vertex_uniform_data(0, &mvp);
    pass.draw_primitives(3, 1, 0, 0);
    pass.end();

    let fence = cb.submit_and_acquire_fence().unwrap();
    device.wait_for_fences(true, &[&fence]);
    assert!(device.query_fence(&fence));
    drop(fence);

    assert_clean(&device);
    // The clear landed in the presented back buffer (BGRA, opaque black).
    let back_buffer = acquired.texture.container.active();
    let slab = back_buffer.raw.slab(0);
    assert_eq!(&slab[0..4], &[0, 0, 0, 255]);
    // The draw saw the pushed mat4 through its root CBV.
    let log = device.shared().raw.take_draw_log();
    assert_eq!(log.len(), 1);
    assert_eq!(&log[0].uniforms[0].data[0..64], &mvp[..]);
}

#[test]
fn scenario_compute_fill_and_readback() {
    let device = test_device(2);
    let buffer = device.create_buffer(BufferUsage::COMPUTE_STORAGE_WRITE, 4096).unwrap();
    let readback = device.create_transfer_buffer(TransferBufferUsage::Download, 4096).unwrap();
    let blob = bytecode::compute_store_global_index();
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineCreateInfo {
            bytecode: &blob,
            entry_point: "main",
            num_readonly_storage_textures: 0,
            num_readonly_storage_buffers: 0,
            num_readwrite_storage_textures: 0,
            num_readwrite_storage_buffers: 1,
            num_uniform_buffers: 0,
            thread_count: (64, 1, 1),
        })
        .unwrap();

    let mut cb = device.acquire_command_buffer().unwrap();
    let mut pass = cb
        .begin_compute_pass(&[], &[StorageBufferReadWriteBinding { buffer: &buffer, cycle: true }])
        .unwrap();
    pass.bind_compute_pipeline(&pipeline);
    pass.dispatch(64, 1, 1);
    pass.end();

    let mut copy = cb.begin_copy_pass();
    copy.download_from_buffer(
        &BufferRegion { buffer: &buffer, offset: 0, size: 4096 },
        &TransferBufferLocation { transfer_buffer: &readback, offset: 0 },
    );
    copy.end();

    let fence = cb.submit_and_acquire_fence().unwrap();
    device.wait_for_fences(true, &[&fence]);
    assert!(device.query_fence(&fence));
    assert_clean(&device);

    let map = device.map_transfer_buffer(&readback, false).unwrap();
    let words: &[u32] = bytemuck::cast_slice(&map[..]);
    for (index, word) in words.iter().enumerate() {
        assert_eq!(*word, index as u32);
    }
}

#[test]
fn scenario_cycling_keeps_iterations_isolated() {
    let device = test_device(2);
    let upload = device.create_transfer_buffer(TransferBufferUsage::Upload, 1024).unwrap();
    let vertex_buffer = device.create_buffer(BufferUsage::VERTEX, 1024).unwrap();

    for iteration in 0..64u32 {
        let mut map = device.map_transfer_buffer(&upload, true).unwrap();
        map[0] = iteration as u8;
        for byte in 1..1024usize {
            map[byte] = (byte - 1) as u8;
        }
        map.unmap();

        let mut cb = device.acquire_command_buffer().unwrap();
        let mut copy = cb.begin_copy_pass();
        copy.upload_to_buffer(
            &TransferBufferLocation { transfer_buffer: &upload, offset: 0 },
            &BufferRegion { buffer: &vertex_buffer, offset: 0, size: 1024 },
            true,
        )
        .unwrap();
        copy.end();
        cb.submit().unwrap();
    }
    device.wait_idle();
    assert_clean(&device);

    // In-flight pressure forced both containers to grow past one entry.
    assert!(upload.container.entry_count() >= 2);
    assert!(vertex_buffer.container.entry_count() >= 2);

    // Every concrete buffer holds one whole iteration, back at its default
    // state, and the active one holds the final iteration.
    let entries = vertex_buffer.container.state.lock().unwrap().entries.clone();
    for concrete in &entries {
        assert_eq!(concrete.raw.current_state(), ResourceState::VertexAndConstantBuffer);
        let storage = concrete.raw.storage();
        assert!((storage[0] as u32) < 64);
        for byte in 1..1024usize {
            assert_eq!(storage[byte], (byte - 1) as u8);
        }
    }
    assert_eq!(vertex_buffer.container.active().raw.storage()[0], 63);
}

#[test]
fn scenario_swapchain_resize() {
    let device = test_device(2);
    let window = Window::new(800, 600);
    device.claim_window(&window, SwapchainComposition::Sdr, PresentMode::Vsync).unwrap();

    for _ in 0..3 {
        let mut cb = device.acquire_command_buffer().unwrap();
        let acquired = device.acquire_swapchain_texture(&mut cb, &window).unwrap().unwrap();
        let pass = cb
            .begin_render_pass(&[clear_attachment(&acquired.texture, [0.2, 0.2, 0.2, 1.0])], None)
            .unwrap();
        pass.end();
        drop(acquired);
        cb.submit().unwrap();
    }

    let (view_free_before, rtv_free_before) = {
        let staging = device.shared().staging.lock().unwrap();
        (staging.view.free_list_len(), staging.render_target.free_list_len())
    };

    window.set_size(1024, 768);
    let mut cb = device.acquire_command_buffer().unwrap();
    let acquired = device.acquire_swapchain_texture(&mut cb, &window).unwrap().unwrap();
    assert_eq!((acquired.width, acquired.height), (1024, 768));
    drop(acquired);
    cb.submit().unwrap();
    assert_clean(&device);

    // The old back-buffer ring released one whole-texture SRV and one RTV
    // per buffer back to the staging free lists.
    let staging = device.shared().staging.lock().unwrap();
    assert_eq!(
        staging.view.free_list_len(),
        view_free_before + crate::MAX_FRAMES_IN_FLIGHT
    );
    assert_eq!(
        staging.render_target.free_list_len(),
        rtv_free_before + crate::MAX_FRAMES_IN_FLIGHT
    );
}

#[test]
fn scenario_mailbox_never_blocks() {
    let device = test_device(2);
    let window = Window::new(320, 240);
    device.claim_window(&window, SwapchainComposition::Sdr, PresentMode::Mailbox).unwrap();

    let mut first = device.acquire_command_buffer().unwrap();
    let held = device.acquire_swapchain_texture(&mut first, &window).unwrap();
    assert!(held.is_some());

    // The back buffer is still owned by the unsubmitted command buffer.
    let mut second = device.acquire_command_buffer().unwrap();
    assert!(device.acquire_swapchain_texture(&mut second, &window).unwrap().is_none());

    first.submit().unwrap();
    let mut attempts = 0;
    let acquired = loop {
        if let Some(texture) = device.acquire_swapchain_texture(&mut second, &window).unwrap() {
            break texture;
        }
        attempts += 1;
        assert!(attempts < 16, "mailbox acquisition never succeeded");
    };
    drop(acquired);
    second.submit().unwrap();
    device.wait_idle();
    assert_clean(&device);
}

#[test]
fn scenario_fence_multi_wait() {
    let device = test_device(10);
    let fences: Vec<_> = (0..4)
        .map(|_| {
            let cb = device.acquire_command_buffer().unwrap();
            cb.submit_and_acquire_fence().unwrap()
        })
        .collect();

    let refs: Vec<&super::Fence> = fences.iter().collect();
    device.wait_for_fences(false, &refs);
    // Any-of: the oldest submission completed, the newest did not.
    assert!(fences[0].inner.raw.completed());
    assert!(!fences[3].inner.raw.completed());

    device.wait_for_fences(true, &refs);
    for fence in &fences {
        assert!(device.query_fence(fence));
    }
    drop(fences);
    device.wait_idle();
    assert_clean(&device);
}

#[test]
fn render_pass_round_trips_attachment_state() {
    let device = test_device(0);
    let texture = device
        .create_texture(&TextureCreateInfo {
            texture_type: TextureType::D2,
            format: crate::TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLER | TextureUsage::COLOR_TARGET,
            width: 64,
            height: 64,
            layer_count_or_depth: 1,
            level_count: 1,
            sample_count: SampleCount::One,
        })
        .unwrap();
    let mut cb = device.acquire_command_buffer().unwrap();
    let pass = cb
        .begin_render_pass(&[clear_attachment(&texture, [1.0, 0.0, 0.0, 1.0])], None)
        .unwrap();
    pass.end();
    cb.submit().unwrap();
    device.wait_idle();
    assert_clean(&device);
    // Sampler usage wins the default-state priority, so the pass must leave
    // the sub-resource back in the shader-resource state.
    let concrete = texture.container.active();
    assert_eq!(concrete.raw.subresource_state(0), ResourceState::AllShaderResource);
}

#[test]
fn uniform_pushes_snapshot_per_draw() {
    let device = test_device(0);
    let target = color_target(&device, 32, 32);
    let pipeline = simple_pipeline(&device, crate::TextureFormat::Rgba8Unorm, 1);

    let mut cb = device.acquire_command_buffer().unwrap();
    let mut pass = cb
        .begin_render_pass(&[clear_attachment(&target, [0.0; 4])], None)
        .unwrap();
    pass.bind_graphics_pipeline(&pipeline);
    pass.push_vertex_uniform_data(0, &[0xaa; 64]);
    pass.draw_primitives(3, 1, 0, 0);
    pass.push_vertex_uniform_data(0, &[0xbb; 64]);
    pass.draw_primitives(3, 1, 0, 0);
    pass.push_vertex_uniform_data(0, &[0xcc; 64]);
    pass.push_vertex_uniform_data(0, &[0xdd; 64]);
    pass.draw_primitives(3, 1, 0, 0);
    pass.end();
    cb.submit().unwrap();
    device.wait_idle();
    assert_clean(&device);

    // Each draw reads the most recent push, not the write cursor.
    let log = device.shared().raw.take_draw_log();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].uniforms[0].data[0], 0xaa);
    assert_eq!(log[1].uniforms[0].data[0], 0xbb);
    assert_eq!(log[2].uniforms[0].data[0], 0xdd);
}

#[test]
fn uniform_pushes_spill_into_a_fresh_buffer() {
    let device = test_device(0);
    let target = color_target(&device, 32, 32);
    let pipeline = simple_pipeline(&device, crate::TextureFormat::Rgba8Unorm, 1);

    let mut cb = device.acquire_command_buffer().unwrap();
    let mut pass = cb.begin_render_pass(&[clear_attachment(&target, [0.0; 4])], None).unwrap();
    pass.bind_graphics_pipeline(&pipeline);
    // 32 KiB pool / 256-byte blocks = 128 pushes fill one wrapper.
    for push in 0..130u32 {
        pass.push_vertex_uniform_data(0, &push.to_le_bytes());
        pass.draw_primitives(3, 1, 0, 0);
    }
    pass.end();
    cb.submit().unwrap();
    device.wait_idle();
    assert_clean(&device);

    let log = device.shared().raw.take_draw_log();
    assert_eq!(log.len(), 130);
    for (push, record) in log.iter().enumerate() {
        assert_eq!(record.uniforms[0].data[0..4], (push as u32).to_le_bytes());
    }
}

#[test]
fn fences_return_to_the_pool_after_retirement() {
    let device = test_device(2);
    let cb = device.acquire_command_buffer().unwrap();
    cb.submit().unwrap();
    device.wait_idle();
    assert_eq!(device.shared().available_fences.lock().unwrap().len(), 1);

    // An owned fence keeps its reference until the handle drops.
    let cb = device.acquire_command_buffer().unwrap();
    let fence = cb.submit_and_acquire_fence().unwrap();
    device.wait_idle();
    assert_eq!(device.shared().available_fences.lock().unwrap().len(), 0);
    drop(fence);
    assert_eq!(device.shared().available_fences.lock().unwrap().len(), 1);
}

#[test]
fn vsync_bounds_frames_in_flight() {
    let device = test_device(50);
    let window = Window::new(256, 256);
    device.claim_window(&window, SwapchainComposition::Sdr, PresentMode::Vsync).unwrap();

    for _ in 0..10 {
        let mut cb = device.acquire_command_buffer().unwrap();
        let acquired = device.acquire_swapchain_texture(&mut cb, &window).unwrap().unwrap();
        drop(acquired);
        cb.submit().unwrap();
        let unretired = device.shared().submitted_command_buffers.lock().unwrap().len();
        assert!(
            unretired <= crate::MAX_FRAMES_IN_FLIGHT + 1,
            "{unretired} command buffers unretired under vsync back-pressure"
        );
    }
    device.wait_idle();
    assert_clean(&device);
}

#[test]
fn blit_clears_and_samples_through_the_internal_pipeline() {
    let device = test_device(0);
    let source = device
        .create_texture(&TextureCreateInfo {
            texture_type: TextureType::D2,
            format: crate::TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLER,
            width: 64,
            height: 64,
            layer_count_or_depth: 1,
            level_count: 1,
            sample_count: SampleCount::One,
        })
        .unwrap();
    let destination = device
        .create_texture(&TextureCreateInfo {
            texture_type: TextureType::D2,
            format: crate::TextureFormat::Rgba8Unorm,
            usage: TextureUsage::COLOR_TARGET | TextureUsage::SAMPLER,
            width: 32,
            height: 32,
            layer_count_or_depth: 1,
            level_count: 1,
            sample_count: SampleCount::One,
        })
        .unwrap();

    let mut cb = device.acquire_command_buffer().unwrap();
    cb.blit(&BlitInfo {
        source: BlitRegion {
            texture: &source,
            mip_level: 0,
            layer_or_depth_plane: 0,
            x: 16,
            y: 16,
            w: 32,
            h: 32,
        },
        destination: BlitRegion {
            texture: &destination,
            mip_level: 0,
            layer_or_depth_plane: 0,
            x: 0,
            y: 0,
            w: 32,
            h: 32,
        },
        filter: Filter::Linear,
        cycle: false,
    })
    .unwrap();
    cb.submit().unwrap();
    device.wait_idle();
    assert_clean(&device);

    // One draw through the blit pipeline, with the normalized source region
    // in its fragment uniforms.
    let log = device.shared().raw.take_draw_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, DrawKind::Draw);
    let uniform = &log[0].uniforms[0].data;
    let left = f32::from_le_bytes([uniform[0], uniform[1], uniform[2], uniform[3]]);
    let width = f32::from_le_bytes([uniform[8], uniform[9], uniform[10], uniform[11]]);
    assert_eq!(left, 0.25);
    assert_eq!(width, 0.5);
}

#[test]
fn mipmap_generation_blits_every_level() {
    let device = test_device(0);
    let texture = device
        .create_texture(&TextureCreateInfo {
            texture_type: TextureType::D2,
            format: crate::TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLER | TextureUsage::COLOR_TARGET,
            width: 16,
            height: 16,
            layer_count_or_depth: 1,
            level_count: 3,
            sample_count: SampleCount::One,
        })
        .unwrap();
    let mut cb = device.acquire_command_buffer().unwrap();
    cb.generate_mipmaps(&texture).unwrap();
    cb.submit().unwrap();
    device.wait_idle();
    assert_clean(&device);
    assert_eq!(device.shared().raw.take_draw_log().len(), 2);
}

#[test]
fn misaligned_texture_transfers_round_trip() {
    let device = test_device(2);
    // A 3x3 RGBA texture has a 12-byte row pitch: far off the 256-byte
    // contract, forcing the repack path in both directions.
    let texture = device
        .create_texture(&TextureCreateInfo {
            texture_type: TextureType::D2,
            format: crate::TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLER,
            width: 3,
            height: 3,
            layer_count_or_depth: 1,
            level_count: 1,
            sample_count: SampleCount::One,
        })
        .unwrap();
    let upload = device.create_transfer_buffer(TransferBufferUsage::Upload, 36).unwrap();
    let readback = device.create_transfer_buffer(TransferBufferUsage::Download, 36).unwrap();

    let pattern: Vec<u8> = (0..36u8).collect();
    let mut map = device.map_transfer_buffer(&upload, false).unwrap();
    map.copy_from_slice(&pattern);
    map.unmap();

    let mut cb = device.acquire_command_buffer().unwrap();
    let mut copy = cb.begin_copy_pass();
    let region = TextureRegion {
        texture: &texture,
        mip_level: 0,
        layer: 0,
        x: 0,
        y: 0,
        z: 0,
        w: 3,
        h: 3,
        d: 1,
    };
    copy.upload_to_texture(
        &TextureTransferInfo { transfer_buffer: &upload, offset: 0, pixels_per_row: 0, rows_per_layer: 0 },
        &region,
        false,
    )
    .unwrap();
    copy.download_from_texture(
        &region,
        &TextureTransferInfo { transfer_buffer: &readback, offset: 0, pixels_per_row: 0, rows_per_layer: 0 },
    );
    copy.end();
    cb.submit().unwrap();
    device.wait_idle();
    assert_clean(&device);

    // The download fix-up repacked the aligned temporary into the caller's
    // tight layout at retirement.
    let map = device.map_transfer_buffer(&readback, false).unwrap();
    assert_eq!(&map[..], &pattern[..]);
}

#[test]
fn transfer_map_cycle_avoids_in_flight_buffers() {
    let device = test_device(100);
    let upload = device.create_transfer_buffer(TransferBufferUsage::Upload, 64).unwrap();
    let buffer = device.create_buffer(BufferUsage::GRAPHICS_STORAGE_READ, 64).unwrap();

    let mut cb = device.acquire_command_buffer().unwrap();
    let mut copy = cb.begin_copy_pass();
    copy.upload_to_buffer(
        &TransferBufferLocation { transfer_buffer: &upload, offset: 0 },
        &BufferRegion { buffer: &buffer, offset: 0, size: 64 },
        false,
    )
    .unwrap();
    copy.end();
    cb.submit().unwrap();

    // The submitted copy still holds the first concrete buffer; a cycling
    // map must rotate to a fresh one without blocking.
    assert_eq!(upload.container.entry_count(), 1);
    let map = device.map_transfer_buffer(&upload, true).unwrap();
    drop(map);
    assert_eq!(upload.container.entry_count(), 2);
    device.wait_idle();
    assert_clean(&device);
}

#[test]
fn upload_maps_write_back_and_persist() {
    let device = test_device(0);
    let upload = device.create_transfer_buffer(TransferBufferUsage::Upload, 16).unwrap();
    {
        let mut map = device.map_transfer_buffer(&upload, false).unwrap();
        map.copy_from_slice(&[7u8; 16]);
    }
    let map = device.map_transfer_buffer(&upload, false).unwrap();
    assert_eq!(&map[..], &[7u8; 16]);
}

#[test]
fn buffer_names_propagate_to_cycled_resources() {
    let device = test_device(100);
    let buffer = device.create_buffer(BufferUsage::VERTEX, 64).unwrap();
    device.set_buffer_name(&buffer, "instance data");
    // Force in-flight, then cycle: the fresh concrete inherits the name.
    buffer.container.active().add_ref();
    buffer.container.cycle_active(device.shared()).unwrap();
    assert_eq!(buffer.container.entry_count(), 2);
    buffer.container.state.lock().unwrap().entries[0].sub_ref();
}

#[test]
fn hdr10_composition_is_rejected_without_touching_state() {
    let device = test_device(0);
    let window = Window::new(128, 128);
    device.claim_window(&window, SwapchainComposition::Sdr, PresentMode::Vsync).unwrap();
    assert!(!device.supports_swapchain_composition(SwapchainComposition::Hdr10));
    assert!(!device.set_swapchain_parameters(
        &window,
        SwapchainComposition::Hdr10,
        PresentMode::Vsync
    ));
    // The original swapchain still works.
    let mut cb = device.acquire_command_buffer().unwrap();
    assert!(device.acquire_swapchain_texture(&mut cb, &window).unwrap().is_some());
    cb.submit().unwrap();
    device.wait_idle();
    assert_clean(&device);
}

#[test]
fn switching_present_mode_recreates_the_swapchain() {
    let device = test_device(0);
    let window = Window::new(128, 128);
    device.claim_window(&window, SwapchainComposition::Sdr, PresentMode::Vsync).unwrap();
    assert!(device.set_swapchain_parameters(
        &window,
        SwapchainComposition::Sdr,
        PresentMode::Mailbox
    ));
    let mut cb = device.acquire_command_buffer().unwrap();
    assert!(device.acquire_swapchain_texture(&mut cb, &window).unwrap().is_some());
    cb.submit().unwrap();
    device.wait_idle();
    assert_clean(&device);
}

#[test]
fn unclaimed_window_acquisition_fails() {
    let device = test_device(0);
    let window = Window::new(64, 64);
    let mut cb = device.acquire_command_buffer().unwrap();
    assert!(matches!(
        device.acquire_swapchain_texture(&mut cb, &window),
        Err(crate::Error::WindowNotClaimed)
    ));
    cb.submit().unwrap();
}

#[test]
fn submits_fail_noisily_after_device_removal() {
    let device = test_device(0);
    device.simulate_device_removed("page fault in command stream");
    let cb = device.acquire_command_buffer().unwrap();
    assert!(matches!(cb.submit(), Err(crate::Error::DeviceRemoved(_))));
    // The device keeps accepting calls until destroyed.
    let another = device.acquire_command_buffer().unwrap();
    assert!(another.submit().is_err());
}

#[test]
fn foreign_bytecode_is_rejected() {
    let device = test_device(0);
    let result = device.create_shader(&ShaderCreateInfo {
        stage: ShaderStage::Vertex,
        bytecode: b"DXBC\x00\x01",
        entry_point: "main",
        num_samplers: 0,
        num_storage_textures: 0,
        num_storage_buffers: 0,
        num_uniform_buffers: 0,
    });
    assert!(matches!(result, Err(crate::Error::InvalidBytecode(_))));
}

#[test]
fn compute_pass_cycles_only_in_flight_targets() {
    let device = test_device(100);
    let buffer = device.create_buffer(BufferUsage::COMPUTE_STORAGE_WRITE, 256).unwrap();
    let blob = bytecode::compute_fill_word(0xffff_ffff);
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineCreateInfo {
            bytecode: &blob,
            entry_point: "main",
            num_readonly_storage_textures: 0,
            num_readonly_storage_buffers: 0,
            num_readwrite_storage_textures: 0,
            num_readwrite_storage_buffers: 1,
            num_uniform_buffers: 0,
            thread_count: (64, 1, 1),
        })
        .unwrap();

    // Not in flight: cycling is a no-op.
    let mut cb = device.acquire_command_buffer().unwrap();
    let mut pass = cb
        .begin_compute_pass(&[], &[StorageBufferReadWriteBinding { buffer: &buffer, cycle: true }])
        .unwrap();
    pass.bind_compute_pipeline(&pipeline);
    pass.dispatch(1, 1, 1);
    pass.end();
    cb.submit().unwrap();
    assert_eq!(buffer.container.entry_count(), 1);

    // Still in flight (huge completion latency): cycling must rotate.
    let mut cb = device.acquire_command_buffer().unwrap();
    let mut pass = cb
        .begin_compute_pass(&[], &[StorageBufferReadWriteBinding { buffer: &buffer, cycle: true }])
        .unwrap();
    pass.bind_compute_pipeline(&pipeline);
    pass.dispatch(1, 1, 1);
    pass.end();
    cb.submit().unwrap();
    assert_eq!(buffer.container.entry_count(), 2);

    device.wait_idle();
    assert_clean(&device);
}

#[test]
fn deferred_destruction_waits_for_retirement() {
    let device = test_device(100);
    let buffer = device.create_buffer(BufferUsage::GRAPHICS_STORAGE_READ, 64).unwrap();
    let upload = device.create_transfer_buffer(TransferBufferUsage::Upload, 64).unwrap();

    let mut cb = device.acquire_command_buffer().unwrap();
    let mut copy = cb.begin_copy_pass();
    copy.upload_to_buffer(
        &TransferBufferLocation { transfer_buffer: &upload, offset: 0 },
        &BufferRegion { buffer: &buffer, offset: 0, size: 64 },
        false,
    )
    .unwrap();
    copy.end();
    cb.submit().unwrap();

    // Dropping the handle while the copy is in flight parks the concrete
    // buffers on the deferred queue instead of destroying them.
    drop(buffer);
    let concrete = Arc::clone(&device.shared().deferred.lock().unwrap().buffers[0]);
    assert!(concrete.in_flight());

    device.wait_idle();
    assert!(!concrete.in_flight());
    assert!(device.shared().deferred.lock().unwrap().buffers.is_empty());
    assert_clean(&device);
}
