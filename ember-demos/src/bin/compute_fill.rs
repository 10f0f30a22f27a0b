//! Compute + readback: dispatches the built-in index-fill program into a
//! storage buffer, downloads it, and prints the first words.

use ember_gpu::{
    tiled::bytecode, BufferRegion, BufferUsage, ComputePipelineCreateInfo, Device,
    DeviceCreateInfo, StorageBufferReadWriteBinding, TransferBufferLocation, TransferBufferUsage,
};

const BUFFER_SIZE: u64 = 4096;

fn main() {
    env_logger::init();

    let device = Device::new(&DeviceCreateInfo {
        debug_mode: true,
        ..DeviceCreateInfo::default()
    })
    .expect("create device");

    let storage = device
        .create_buffer(BufferUsage::COMPUTE_STORAGE_WRITE, BUFFER_SIZE)
        .expect("create storage buffer");
    device.set_buffer_name(&storage, "index fill target");
    let readback = device
        .create_transfer_buffer(TransferBufferUsage::Download, BUFFER_SIZE)
        .expect("create readback buffer");

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
        .expect("create compute pipeline");

    let mut cb = device.acquire_command_buffer().expect("acquire command buffer");
    let mut pass = cb
        .begin_compute_pass(
            &[],
            &[StorageBufferReadWriteBinding { buffer: &storage, cycle: true }],
        )
        .expect("begin compute pass");
    pass.bind_compute_pipeline(&pipeline);
    pass.dispatch(64, 1, 1);
    pass.end();

    let mut copy = cb.begin_copy_pass();
    copy.download_from_buffer(
        &BufferRegion { buffer: &storage, offset: 0, size: BUFFER_SIZE },
        &TransferBufferLocation { transfer_buffer: &readback, offset: 0 },
    );
    copy.end();

    let fence = cb.submit_and_acquire_fence().expect("submit");
    device.wait_for_fences(true, &[&fence]);
    assert!(device.query_fence(&fence));

    let map = device.map_transfer_buffer(&readback, false).expect("map readback");
    let words: &[u32] = bytemuck::cast_slice(&map[..]);
    println!("first words: {:?}", &words[0..8]);
    assert!(words.iter().enumerate().all(|(index, word)| *word == index as u32));
    println!("all {} words match their indices", words.len());
}
