//! Cross-crate scenarios: the safe layer driving the software device end to end.

use std::sync::Arc;

use accel_cl::{
    get_platforms, Backend, Buffer, CommandQueue, Context, ErrorKind, Event, Image2D,
    ImageFormat, KernelArg, MemAccess, NdRange, Program, QueueOptions,
};
use accel_soft::{SoftConfig, SoftDeviceConfig, SoftRuntime};
use accel_sys::{EventStatus, ObjectKind};
use pretty_assertions::assert_eq;

const INVERT: &str = r#"
#ifndef CHANNELS
#error "CHANNELS must be defined"
#endif
__kernel void invert(__read_only image2d_t frame, __global uchar *out) {
    int2 pos = (int2)(get_global_id(0), get_global_id(1));
    uint4 px = read_imageui(frame, pos);
    vstore4(convert_uchar4(255 - px), pos.y * get_global_size(0) + pos.x, out);
}
"#;

fn two_device_runtime() -> (Arc<SoftRuntime>, Context) {
    let config = SoftConfig::default().with_devices(2, SoftDeviceConfig::default());
    let runtime = SoftRuntime::new(config).unwrap();
    runtime.register_kernel("invert", |launch| {
        let (frame, out) = launch.mem_pair(0, 1)?;
        for (dst, src) in out.iter_mut().zip(frame) {
            *dst = 255 - src;
        }
        Ok(())
    });
    let backend: Arc<dyn Backend> = runtime.clone();
    let platform = get_platforms(&backend).unwrap().remove(0);
    let context = Context::builder(&platform)
        .devices(platform.get_devices().unwrap())
        .gl_share_group(runtime.gl_share_group())
        .build()
        .unwrap();
    (runtime, context)
}

#[test]
fn graphics_frame_is_processed_across_two_devices() {
    const W: usize = 8;
    const H: usize = 4;
    let (runtime, context) = two_device_runtime();
    assert_eq!(context.devices().len(), 2);

    let pixels: Vec<u8> = (0..W * H * 4).map(|i| (i * 7) as u8).collect();
    let token = runtime
        .gl_create_texture(ImageFormat::RGBA8, W, H, &pixels)
        .unwrap();

    {
        let options = QueueOptions {
            out_of_order: true,
            profiling: true,
        };
        let compute = CommandQueue::new(&context, &context.devices()[0], options).unwrap();
        let transfer =
            CommandQueue::new(&context, &context.devices()[1], QueueOptions::default()).unwrap();

        let program = Program::with_source(&context, INVERT).unwrap();
        let err = program.build("").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Build);
        assert_eq!(err.build_logs().len(), 2);
        assert!(err.build_logs().iter().all(|l| l.log.contains("CHANNELS")));
        program.build("-D CHANNELS=4").unwrap();
        assert_eq!(program.kernel_names().unwrap(), ["invert"]);

        let frame = Image2D::from_gl_texture(&context, MemAccess::ReadOnly, token).unwrap();
        let inverted = Buffer::new(&context, W * H * 4, MemAccess::WriteOnly).unwrap();
        let staged = Buffer::new(&context, W * H * 4, MemAccess::ReadWrite).unwrap();

        let kernel = program.get_kernel("invert").unwrap();
        kernel.set_arg(0, &frame).unwrap();
        kernel.set_arg(1, KernelArg::from(&inverted)).unwrap();

        let acquired = compute.acquire_gl_objects(&[&frame], &[]).unwrap();
        let range = NdRange::new(&[W, H]).unwrap().with_local(&[4, 2]).unwrap();
        let ran = compute.run_kernel(&kernel, &range, &[acquired]).unwrap();
        let released = compute.release_gl_objects(&[&frame], &[ran.clone()]).unwrap();

        // The copy runs on the other device's queue, ordered only by the event.
        let copied = transfer
            .copy_buffer(&inverted, &staged, W * H * 4, 0, 0, &[ran.clone()])
            .unwrap();
        let mut out = vec![0u8; W * H * 4];
        transfer
            .read_buffer(&staged, 0, &mut out, true, &[copied])
            .unwrap();
        let expected: Vec<u8> = pixels.iter().map(|p| 255 - p).collect();
        assert_eq!(out, expected);

        Event::wait_for(&[released.clone(), ran.clone()]).unwrap();
        assert_eq!(released.status().unwrap(), EventStatus::Complete);
        let timing = ran.profiling().unwrap();
        assert!(timing.queued <= timing.start && timing.start <= timing.end);
        // Inversion only touched the buffer; the texture is handed back unchanged.
        assert_eq!(runtime.gl_contents(token).unwrap(), pixels);

        compute.finish().unwrap();
        transfer.finish().unwrap();
    }

    drop(context);
    let ledger = runtime.ledger();
    assert!(ledger.is_balanced(), "{ledger:?}");
    for kind in [ObjectKind::Context, ObjectKind::Mem, ObjectKind::Kernel] {
        assert_eq!(ledger.created(kind), ledger.destroyed(kind), "{kind}");
    }
}

#[test]
fn losing_one_device_takes_down_the_shared_context() {
    let (runtime, context) = two_device_runtime();
    let healthy = CommandQueue::new(&context, &context.devices()[1], QueueOptions::default())
        .unwrap();
    let buffer = Buffer::new(&context, 16, MemAccess::ReadWrite).unwrap();
    healthy.write_buffer(&buffer, 0, &[1; 16], true, &[]).unwrap();

    runtime.lose_device(context.devices()[0].raw()).unwrap();

    let err = healthy
        .write_buffer(&buffer, 0, &[2; 16], true, &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceLost);
    assert!(err.is_fatal());
    assert!(context.is_lost());
    assert_eq!(
        Buffer::new(&context, 16, MemAccess::ReadWrite)
            .unwrap_err()
            .kind(),
        ErrorKind::DeviceLost
    );
}
