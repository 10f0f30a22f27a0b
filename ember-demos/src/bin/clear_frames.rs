//! Frame loop against a logical window: clears the swapchain through a few
//! frames, then downloads the last back buffer (inside the same command
//! buffer, before it is presented) and prints its top-left texel. Exercises
//! claim, acquire, render pass, copy pass, submit, and present pacing.

use ember_gpu::{
    ColorAttachmentInfo, Device, DeviceCreateInfo, LoadOp, PresentMode, StoreOp,
    SwapchainComposition, TextureRegion, TextureTransferInfo, TransferBufferUsage, Window,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn main() {
    env_logger::init();

    let device = Device::new(&DeviceCreateInfo {
        debug_mode: true,
        ..DeviceCreateInfo::default()
    })
    .expect("create device");
    log::info!("driver: {:?}", device.driver());

    let window = Window::new(WIDTH, HEIGHT);
    device
        .claim_window(&window, SwapchainComposition::Sdr, PresentMode::Vsync)
        .expect("claim window");
    let readback = device
        .create_transfer_buffer(TransferBufferUsage::Download, (WIDTH * HEIGHT * 4) as u64)
        .expect("create readback buffer");

    let frame_count = 8u32;
    for frame in 0..frame_count {
        let mut cb = device.acquire_command_buffer().expect("acquire command buffer");
        let Some(acquired) = device
            .acquire_swapchain_texture(&mut cb, &window)
            .expect("acquire swapchain texture")
        else {
            continue;
        };
        let shade = frame as f32 / frame_count as f32;
        let pass = cb
            .begin_render_pass(
                &[ColorAttachmentInfo {
                    texture: &acquired.texture,
                    mip_level: 0,
                    layer_or_depth_plane: 0,
                    clear_color: [shade, 0.0, 1.0 - shade, 1.0],
                    load_op: LoadOp::Clear,
                    store_op: StoreOp::Store,
                    cycle: false,
                }],
                None,
            )
            .expect("begin render pass");
        pass.end();

        if frame + 1 == frame_count {
            // Swapchain textures only live within the acquiring command
            // buffer, so the readback records before this one presents.
            let mut copy = cb.begin_copy_pass();
            copy.download_from_texture(
                &TextureRegion {
                    texture: &acquired.texture,
                    mip_level: 0,
                    layer: 0,
                    x: 0,
                    y: 0,
                    z: 0,
                    w: WIDTH,
                    h: HEIGHT,
                    d: 1,
                },
                &TextureTransferInfo {
                    transfer_buffer: &readback,
                    offset: 0,
                    pixels_per_row: 0,
                    rows_per_layer: 0,
                },
            );
            copy.end();
            let fence = cb.submit_and_acquire_fence().expect("submit");
            device.wait_for_fences(true, &[&fence]);
        } else {
            cb.submit().expect("submit");
        }
    }

    let map = device.map_transfer_buffer(&readback, false).expect("map readback");
    println!("top-left texel (BGRA): {:?}", &map[0..4]);
    println!("validation messages: {:?}", device.take_validation_messages());
}
