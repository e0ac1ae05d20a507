mod common;

use accel_cl::{
    Buffer, CommandQueue, Context, ErrorKind, GlObjectToken, Image2D, ImageFormat, InteropState,
    MemAccess, MemoryObject, NdRange, Program, QueueOptions,
};
use common::rig;
use pretty_assertions::assert_eq;

fn interop_context(rig: &common::Rig) -> (Context, CommandQueue) {
    let context = Context::builder(&rig.platform)
        .devices(rig.devices.iter().cloned())
        .gl_share_group(rig.runtime.gl_share_group())
        .build()
        .unwrap();
    let queue = CommandQueue::new(&context, &rig.devices[0], QueueOptions::default()).unwrap();
    (context, queue)
}

#[test]
fn textures_are_only_usable_between_acquire_and_release() {
    let rig = rig();
    let (context, queue) = interop_context(&rig);
    let pixels: Vec<u8> = (0..2 * 2 * 4).map(|i| i as u8 * 3).collect();
    let token = rig
        .runtime
        .gl_create_texture(ImageFormat::RGBA8, 2, 2, &pixels)
        .unwrap();
    let image = Image2D::from_gl_texture(&context, MemAccess::ReadWrite, token).unwrap();
    assert_eq!((image.width(), image.height()), (2, 2));
    assert_eq!(image.interop_state(), Some(InteropState::Released));

    let mut out = vec![0u8; pixels.len()];
    let err = queue
        .read_image2d(&image, [0, 0], [2, 2], &mut out, true, &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    queue.acquire_gl_objects(&[&image], &[]).unwrap();
    assert_eq!(image.interop_state(), Some(InteropState::Acquired));
    assert_eq!(
        queue.acquire_gl_objects(&[&image], &[]).unwrap_err().kind(),
        ErrorKind::Configuration
    );
    queue
        .read_image2d(&image, [0, 0], [2, 2], &mut out, true, &[])
        .unwrap();
    assert_eq!(out, pixels);

    queue
        .write_image2d(&image, [0, 0], [1, 1], &[0xEE; 4], false, &[])
        .unwrap();
    queue.release_gl_objects(&[&image], &[]).unwrap().wait().unwrap();
    assert_eq!(rig.runtime.gl_contents(token).unwrap()[..4], [0xEE; 4]);

    let err = queue
        .write_image2d(&image, [0, 0], [1, 1], &[0; 4], false, &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(
        queue.release_gl_objects(&[&image], &[]).unwrap_err().kind(),
        ErrorKind::Configuration
    );
}

#[test]
fn kernels_reject_released_interop_arguments() {
    let rig = rig();
    rig.runtime.register_kernel("fill", |launch| {
        for i in 0..launch.global_size(0) {
            launch.store(0, i, 7u32)?;
        }
        Ok(())
    });
    let (context, queue) = interop_context(&rig);
    let token = rig.runtime.gl_create_buffer(&[0u8; 16]);
    let buffer = Buffer::from_gl_buffer(&context, MemAccess::WriteOnly, token).unwrap();
    assert_eq!(buffer.size(), 16);

    let program = Program::with_source(&context, "__kernel void fill(__global uint *v) {}").unwrap();
    program.build("").unwrap();
    let kernel = program.get_kernel("fill").unwrap();
    kernel.set_arg(0, &buffer).unwrap();

    let range = NdRange::linear(4);
    let err = queue.run_kernel(&kernel, &range, &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let acquired = queue.acquire_gl_objects(&[&buffer], &[]).unwrap();
    let ran = queue.run_kernel(&kernel, &range, &[acquired]).unwrap();
    queue.release_gl_objects(&[&buffer], &[ran]).unwrap().wait().unwrap();
    assert_eq!(
        rig.runtime.gl_contents(token).unwrap(),
        common::bytes_of_words(&[7; 4])
    );
}

#[test]
fn imports_need_a_share_group_and_interop_objects() {
    let rig = rig();
    let token = rig.runtime.gl_create_buffer(&[1, 2, 3]);
    let err = Buffer::from_gl_buffer(&rig.context, MemAccess::ReadOnly, token).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let (context, queue) = interop_context(&rig);
    let err = Image2D::from_gl_texture(&context, MemAccess::ReadOnly, token).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let err = Buffer::from_gl_buffer(&context, MemAccess::ReadOnly, GlObjectToken::buffer(999))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let plain = Buffer::new(&context, 4, MemAccess::ReadWrite).unwrap();
    assert!(!plain.is_interop());
    assert_eq!(plain.interop_state(), None);
    let err = queue.acquire_gl_objects(&[&plain], &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
