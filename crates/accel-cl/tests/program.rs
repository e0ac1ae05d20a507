mod common;

use accel_cl::{
    Buffer, BuildStatus, CommandQueue, ErrorKind, KernelArg, MemAccess, NdRange, Program,
    QueueOptions, Status,
};
use accel_soft::{SoftConfig, SoftDeviceConfig};
use common::{rig, rig_with, Rig};
use pretty_assertions::assert_eq;

const ADD: &str = r#"
__kernel void add(__global const float *a, __global float *out, const int n)
{
    int i = get_global_id(0);
    if (i < n) out[i] = a[i] + 1.0f;
}
"#;

const TOUCH: &str = "__kernel void touch(int x) {}";

fn two_device_rig() -> Rig {
    let rig = rig_with(
        SoftConfig::default().with_devices(2, SoftDeviceConfig::default()),
        QueueOptions::default(),
    );
    rig.runtime.register_kernel("touch", |_| Ok(()));
    rig
}

#[test]
fn failed_build_reports_logs_and_a_fixed_source_builds() {
    let rig = rig();
    rig.runtime.register_kernel("add", |_| Ok(()));

    let broken = Program::with_source(&rig.context, "__kernel void add(int n) {").unwrap();
    let err = broken.build("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Build);
    assert_eq!(err.status(), Status::BUILD_PROGRAM_FAILURE);
    assert_eq!(err.build_logs().len(), rig.devices.len());
    assert!(err.build_logs()[0].log.contains("error"), "{err}");
    assert_eq!(
        broken.build_status(&rig.devices[0]).unwrap(),
        BuildStatus::Error
    );
    assert!(!broken.build_log(&rig.devices[0]).is_empty());

    let fixed = Program::with_source(&rig.context, ADD).unwrap();
    fixed.build("-DWIDTH=4 -cl-fast-relaxed-math").unwrap();
    assert_eq!(fixed.build_status(&rig.devices[0]).unwrap(), BuildStatus::Success);
    assert_eq!(
        fixed.build_options(&rig.devices[0]).unwrap(),
        "-DWIDTH=4 -cl-fast-relaxed-math"
    );
    assert_eq!(fixed.kernel_names().unwrap(), vec!["add".to_owned()]);
    assert_eq!(fixed.source().unwrap().trim(), ADD.trim());
}

#[test]
fn bad_options_are_build_errors() {
    let rig = rig();
    let program = Program::with_source(&rig.context, ADD).unwrap();
    let err = program.build("--no-such-flag").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Build);
    assert_eq!(err.status(), Status::INVALID_BUILD_OPTIONS);
    assert!(err.build_logs()[0].log.contains("--no-such-flag"));
}

#[test]
fn kernels_need_a_successful_build_and_a_known_name() {
    let rig = rig();
    let program = Program::with_source(&rig.context, ADD).unwrap();
    assert_eq!(
        program.get_kernel("add").unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(program.kernel_names().unwrap_err().kind(), ErrorKind::NotFound);

    program.build("").unwrap();
    let err = program.get_kernel("sub").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("'sub'"), "{err}");

    let kernels = program.create_kernels().unwrap();
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].name(), "add");
    assert_eq!(kernels[0].num_args(), 3);
    assert_eq!(kernels[0].compile_work_group_size(&rig.devices[0]).unwrap(), None);

    // Attached kernels pin the executable.
    assert_eq!(program.build("").unwrap_err().kind(), ErrorKind::Configuration);
    drop(kernels);
    program.build("").unwrap();
}

#[test]
fn argument_mismatches_surface_at_enqueue() {
    let rig = rig();
    rig.runtime.register_kernel("add", |_| Ok(()));
    let program = Program::with_source(&rig.context, ADD).unwrap();
    program.build("").unwrap();
    let kernel = program.get_kernel("add").unwrap();
    let a = Buffer::new(&rig.context, 16, MemAccess::ReadOnly).unwrap();
    let out = Buffer::new(&rig.context, 16, MemAccess::WriteOnly).unwrap();
    let range = NdRange::linear(4);

    let err = kernel.set_arg(3, KernelArg::scalar(1i32)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(err.status(), Status::INVALID_ARG_INDEX);

    kernel.set_arg(0, &a).unwrap();
    kernel.set_arg(1, &out).unwrap();
    let err = rig.queue.run_kernel(&kernel, &range, &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert!(matches!(err, accel_cl::Error::Argument { index: Some(2), .. }), "{err}");

    // An 8-byte value for an `int` parameter.
    kernel.set_arg_scalar(2, 4u64).unwrap();
    let err = rig.queue.run_kernel(&kernel, &range, &[]).unwrap_err();
    assert_eq!(err.status(), Status::INVALID_ARG_SIZE);
    assert!(matches!(err, accel_cl::Error::Argument { index: Some(2), .. }), "{err}");

    // Clones share the recorded arguments.
    let clone = kernel.clone();
    clone.set_arg_scalar(2, 4i32).unwrap();
    rig.queue.run_kernel(&kernel, &range, &[]).unwrap().wait().unwrap();
}

#[test]
fn unregistered_kernel_bodies_fail_at_enqueue() {
    let rig = rig();
    let program = Program::with_source(&rig.context, "__kernel void ghost(int x) {}").unwrap();
    program.build("").unwrap();
    assert!(program.build_log(&rig.devices[0]).contains("warning"));
    let kernel = program.get_kernel("ghost").unwrap();
    kernel.set_arg_scalar(0, 1i32).unwrap();
    let err = rig
        .queue
        .run_kernel(&kernel, &NdRange::linear(1), &[])
        .unwrap_err();
    assert_eq!(err.status(), Status::INVALID_KERNEL);
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn launch_geometry_is_validated() {
    assert_eq!(NdRange::new(&[]).unwrap_err().kind(), ErrorKind::Configuration);
    assert_eq!(
        NdRange::new(&[64, 64]).unwrap().with_local(&[16]).unwrap_err().kind(),
        ErrorKind::Configuration
    );
    assert_eq!(
        NdRange::linear(1024).with_local(&[24]).unwrap_err().kind(),
        ErrorKind::Configuration
    );
    let range = NdRange::new(&[64, 32]).unwrap().with_local(&[8, 8]).unwrap();
    assert_eq!(range.global(), &[64, 32]);
    assert_eq!(range.local(), Some(&[8, 8][..]));
    assert_eq!(range.len(), 2048);
}

#[test]
fn kernels_only_run_on_devices_the_program_was_built_for() {
    let rig = two_device_rig();
    let program = Program::with_source(&rig.context, TOUCH).unwrap();
    program.build_for(&rig.devices[..1], "").unwrap();
    assert_eq!(program.build_status(&rig.devices[0]).unwrap(), BuildStatus::Success);
    assert_eq!(program.build_status(&rig.devices[1]).unwrap(), BuildStatus::None);

    let kernel = program.get_kernel("touch").unwrap();
    kernel.set_arg_scalar(0, 1i32).unwrap();
    let range = NdRange::linear(4);
    rig.queue.run_kernel(&kernel, &range, &[]).unwrap().wait().unwrap();

    let unbuilt = CommandQueue::new(&rig.context, &rig.devices[1], QueueOptions::default()).unwrap();
    let err = unbuilt.run_kernel(&kernel, &range, &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.status(), Status::INVALID_PROGRAM_EXECUTABLE);
}

#[test]
fn a_failed_build_on_one_device_keeps_the_others_executable() {
    let rig = two_device_rig();
    let program = Program::with_source(&rig.context, TOUCH).unwrap();
    program.build("").unwrap();

    let err = program
        .build_for(&rig.devices[1..], "-bogus-option")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Build);
    assert_eq!(err.build_logs().len(), 1);
    assert_eq!(program.build_status(&rig.devices[0]).unwrap(), BuildStatus::Success);
    assert_eq!(program.build_status(&rig.devices[1]).unwrap(), BuildStatus::Error);
    assert_eq!(program.build_options(&rig.devices[0]).unwrap(), "");

    assert_eq!(program.kernel_names().unwrap(), vec!["touch".to_owned()]);
    let kernel = program.get_kernel("touch").unwrap();
    kernel.set_arg_scalar(0, 1i32).unwrap();
    let range = NdRange::linear(4);
    rig.queue.run_kernel(&kernel, &range, &[]).unwrap().wait().unwrap();

    let failed = CommandQueue::new(&rig.context, &rig.devices[1], QueueOptions::default()).unwrap();
    let err = failed.run_kernel(&kernel, &range, &[]).unwrap_err();
    assert_eq!(err.status(), Status::INVALID_PROGRAM_EXECUTABLE);
}
