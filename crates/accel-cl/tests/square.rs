mod common;

use accel_cl::{device_info, Buffer, KernelArg, MemAccess, NdRange, Program};
use common::rig;
use pretty_assertions::assert_eq;

const SQUARE: &str = r#"
__kernel void square(__global const float *input,
                     __global float *output,
                     const unsigned int count)
{
    size_t i = get_global_id(0);
    if (i < count)
        output[i] = input[i] * input[i];
}
"#;

#[test]
fn squares_a_vector_end_to_end() {
    const COUNT: usize = 1024;
    let rig = rig();
    rig.runtime.register_kernel("square", |launch| {
        let count: u32 = launch.scalar(2)?;
        for i in 0..launch.global_size(0).min(count as usize) {
            let x: f32 = launch.load(0, i)?;
            launch.store(1, i, x * x)?;
        }
        Ok(())
    });

    let program = Program::with_source(&rig.context, SQUARE).unwrap();
    program.build("").unwrap();
    let kernel = program.get_kernel("square").unwrap();

    let input: Vec<f32> = (0..COUNT).map(|i| i as f32 * 0.5).collect();
    let input_buf = Buffer::with_data(
        &rig.context,
        MemAccess::ReadOnly,
        bytemuck::cast_slice(&input),
    )
    .unwrap();
    let output_buf = Buffer::new(&rig.context, COUNT * 4, MemAccess::WriteOnly).unwrap();

    kernel.set_arg(0, &input_buf).unwrap();
    kernel.set_arg(1, &output_buf).unwrap();
    kernel.set_arg(2, KernelArg::scalar(COUNT as u32)).unwrap();

    let range = NdRange::linear(COUNT).with_local(&[16]).unwrap();
    let ran = rig.queue.run_kernel(&kernel, &range, &[]).unwrap();

    let mut output = vec![0f32; COUNT];
    rig.queue
        .read_buffer(
            &output_buf,
            0,
            bytemuck::cast_slice_mut(&mut output),
            false,
            &[ran],
        )
        .unwrap()
        .wait()
        .unwrap();

    let expected: Vec<f32> = input.iter().map(|x| x * x).collect();
    assert_eq!(output, expected);
}

#[test]
fn device_capabilities_are_typed() {
    let rig = rig();
    let device = &rig.devices[0];
    assert_eq!(device.info(device_info::NAME).unwrap(), "accel soft device");
    assert!(device.info(device_info::MAX_COMPUTE_UNITS).unwrap() >= 1);
    assert_eq!(device.max_work_item_sizes().unwrap().len(), 3);
    assert!(device.image_support().unwrap());

    let table = device.capabilities().unwrap();
    assert!(table.iter().any(|(key, value)| *key == "name" && value == "accel soft device"));
    assert_eq!(rig.platform.name(), "accel soft platform");
    assert_eq!(rig.context.devices().len(), 1);
}
