use std::sync::{Arc, Mutex};

use accel_soft::{SoftConfig, SoftDeviceConfig, SoftDeviceKind, SoftRuntime};
use accel_sys::{
    Backend, BuildStatus, CommandType, ContextDesc, DeviceParam, DeviceType, EventStatus,
    HostSink, KernelArgValue, MemFlags, NdRangeDesc, ObjectKind, ProgramBuildParam,
    QueueProperties, RawContext, RawQueue, Status,
};
use pretty_assertions::assert_eq;

struct Fixture {
    rt: Arc<SoftRuntime>,
    context: RawContext,
    queue: RawQueue,
}

fn fixture(properties: QueueProperties) -> Fixture {
    let rt = SoftRuntime::new(SoftConfig::default()).unwrap();
    let devices = rt.devices();
    let context = rt
        .create_context(
            &ContextDesc {
                platform: rt.platform(),
                devices: &devices,
                gl_share_group: None,
            },
            None,
        )
        .unwrap();
    let queue = rt.create_queue(context, devices[0], properties).unwrap();
    Fixture { rt, context, queue }
}

fn string_info(rt: &SoftRuntime, param: DeviceParam) -> String {
    let device = rt.devices()[0];
    let len = rt.device_info(device, param, None).unwrap();
    let mut buf = vec![0u8; len];
    rt.device_info(device, param, Some(&mut buf)).unwrap();
    String::from_utf8(buf[..len - 1].to_vec()).unwrap()
}

#[test]
fn reports_configured_devices() {
    let config = SoftConfig::default()
        .with_devices(1, SoftDeviceConfig::default())
        .with_device(SoftDeviceConfig {
            name: "gpu".into(),
            kind: SoftDeviceKind::Gpu,
            ..SoftDeviceConfig::default()
        });
    let rt = SoftRuntime::new(config).unwrap();
    let platform = rt.platform();

    assert_eq!(rt.platform_ids(None), Ok(1));
    assert_eq!(rt.device_ids(platform, DeviceType::ALL, None), Ok(2));
    assert_eq!(rt.device_ids(platform, DeviceType::GPU, None), Ok(1));
    assert_eq!(
        rt.device_ids(platform, DeviceType::ACCELERATOR, None),
        Err(Status::DEVICE_NOT_FOUND)
    );
    assert_eq!(string_info(&rt, DeviceParam::Name), "accel soft device");
}

#[test]
fn in_order_queue_runs_in_submission_order() {
    let f = fixture(QueueProperties::empty());
    let mem = f
        .rt
        .create_buffer(f.context, MemFlags::READ_WRITE, 4, None)
        .unwrap();

    f.rt.pause();
    let events: Vec<_> = (1..=8u32)
        .map(|tag| {
            let bytes = tag.to_ne_bytes().to_vec();
            f.rt.enqueue_write_buffer(f.queue, mem, false, 0, bytes.into(), &[])
                .unwrap()
        })
        .collect();
    assert_eq!(f.rt.event_status(events[0]), Ok(EventStatus::Queued));
    f.rt.resume();
    f.rt.finish(f.queue).unwrap();

    let completed: Vec<_> = f
        .rt
        .timeline()
        .into_iter()
        .filter(|t| t.status == EventStatus::Complete)
        .map(|t| t.event)
        .collect();
    assert_eq!(completed, events);

    let sink = HostSink::with_len(4);
    let read = f
        .rt
        .enqueue_read_buffer(f.queue, mem, true, 0, sink.clone(), &[])
        .unwrap();
    assert_eq!(sink.to_vec(), 8u32.to_ne_bytes());
    assert_eq!(f.rt.event_command_type(read), Ok(CommandType::ReadBuffer));
}

#[test]
fn failed_dependency_fails_dependents() {
    let f = fixture(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE);
    f.rt.register_kernel("boom", |_| Err(Status::OUT_OF_RESOURCES));

    let program = f
        .rt
        .create_program(f.context, &["__kernel void boom(int x) {}"])
        .unwrap();
    f.rt.build_program(program, &[], "").unwrap();
    let kernel = f.rt.create_kernel(program, "boom").unwrap();
    f.rt
        .set_kernel_arg(kernel, 0, KernelArgValue::Bytes(&1i32.to_ne_bytes()))
        .unwrap();

    let range = NdRangeDesc {
        work_dim: 1,
        global_offset: [0; 3],
        global: [4, 1, 1],
        local: None,
    };
    let launch = f.rt.enqueue_nd_range(f.queue, kernel, &range, &[]).unwrap();
    let marker = f.rt.enqueue_marker(f.queue, &[launch]).unwrap();

    assert_eq!(
        f.rt.wait_for_events(&[marker]),
        Err(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
    );
    assert_eq!(
        f.rt.event_status(launch),
        Ok(EventStatus::Error(Status::OUT_OF_RESOURCES))
    );
    assert_eq!(
        f.rt.event_status(marker),
        Ok(EventStatus::Error(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST))
    );
}

#[test]
fn build_log_is_kept_per_device() {
    let f = fixture(QueueProperties::empty());
    let device = f.rt.devices()[0];
    let program = f
        .rt
        .create_program(f.context, &["__kernel void f(int a) {"])
        .unwrap();

    assert_eq!(
        f.rt.build_program(program, &[], ""),
        Err(Status::BUILD_PROGRAM_FAILURE)
    );
    let mut status = [0u8; 4];
    f.rt
        .program_build_info(program, device, ProgramBuildParam::Status, Some(&mut status))
        .unwrap();
    assert_eq!(
        BuildStatus::from_code(i32::from_ne_bytes(status)),
        Some(BuildStatus::Error)
    );
    let len = f
        .rt
        .program_build_info(program, device, ProgramBuildParam::Log, None)
        .unwrap();
    assert!(len > 1);

    assert_eq!(
        f.rt.build_program(program, &[], "--bogus"),
        Err(Status::INVALID_BUILD_OPTIONS)
    );
    assert_eq!(
        f.rt.create_kernel(program, "f"),
        Err(Status::INVALID_PROGRAM_EXECUTABLE)
    );
}

#[test]
fn lost_device_fails_pending_work_and_notifies() {
    let rt = SoftRuntime::new(SoftConfig::default()).unwrap();
    let devices = rt.devices();
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    let context = rt
        .create_context(
            &ContextDesc {
                platform: rt.platform(),
                devices: &devices,
                gl_share_group: None,
            },
            Some(Arc::new(move |msg: &str, _: &[u8]| {
                sink.lock().unwrap().push(msg.to_owned())
            })),
        )
        .unwrap();
    let queue = rt
        .create_queue(context, devices[0], QueueProperties::empty())
        .unwrap();

    rt.pause();
    let marker = rt.enqueue_marker(queue, &[]).unwrap();
    rt.lose_device(devices[0]).unwrap();
    rt.resume();

    assert_eq!(
        rt.event_status(marker),
        Ok(EventStatus::Error(Status::DEVICE_LOST))
    );
    assert_eq!(rt.enqueue_marker(queue, &[]), Err(Status::DEVICE_LOST));
    assert_eq!(
        rt.create_buffer(context, MemFlags::READ_WRITE, 16, None),
        Err(Status::DEVICE_LOST)
    );
    assert_eq!(messages.lock().unwrap().len(), 1);

    // Releasing still works on a lost context.
    rt.release(ObjectKind::Event, marker.handle()).unwrap();
    rt.release(ObjectKind::Queue, queue.handle()).unwrap();
    rt.release(ObjectKind::Context, context.handle()).unwrap();
    assert!(rt.ledger().is_balanced());
}

#[test]
fn objects_outlive_host_references_while_in_flight() {
    let f = fixture(QueueProperties::empty());
    let mem = f
        .rt
        .create_buffer(f.context, MemFlags::READ_WRITE, 8, None)
        .unwrap();

    f.rt.pause();
    let write = f
        .rt
        .enqueue_write_buffer(f.queue, mem, false, 0, vec![7u8; 8].into(), &[])
        .unwrap();
    // host + in-flight command
    assert_eq!(f.rt.reference_count(ObjectKind::Mem, mem.handle()), Ok(2));
    f.rt.release(ObjectKind::Mem, mem.handle()).unwrap();
    assert_eq!(f.rt.ledger().destroyed(ObjectKind::Mem), 0);

    f.rt.resume();
    f.rt.wait_for_events(&[write]).unwrap();
    assert_eq!(f.rt.ledger().destroyed(ObjectKind::Mem), 1);

    f.rt.release(ObjectKind::Event, write.handle()).unwrap();
    f.rt.release(ObjectKind::Queue, f.queue.handle()).unwrap();
    f.rt.release(ObjectKind::Context, f.context.handle()).unwrap();
    let ledger = f.rt.ledger();
    assert!(ledger.is_balanced());
    assert_eq!(ledger.destroyed(ObjectKind::Context), 1);
}

#[test]
fn allocation_limits() {
    let f = fixture(QueueProperties::empty());
    assert_eq!(
        f.rt.create_buffer(f.context, MemFlags::READ_WRITE, 0, None),
        Err(Status::INVALID_BUFFER_SIZE)
    );
    assert_eq!(
        f.rt.create_buffer(f.context, MemFlags::READ_WRITE, 128 << 20, None),
        Err(Status::INVALID_BUFFER_SIZE)
    );
    f.rt.fail_next_allocation();
    assert_eq!(
        f.rt.create_buffer(f.context, MemFlags::READ_WRITE, 16, None),
        Err(Status::MEM_OBJECT_ALLOCATION_FAILURE)
    );
    assert!(f
        .rt
        .create_buffer(f.context, MemFlags::READ_WRITE, 16, None)
        .is_ok());
}

#[test]
fn size_race_under_reports_once() {
    let rt = SoftRuntime::new(SoftConfig::default()).unwrap();
    let device = rt.devices()[0];
    let real = rt.device_info(device, DeviceParam::Name, None).unwrap();

    rt.inject_info_size_race(1);
    let raced = rt.device_info(device, DeviceParam::Name, None).unwrap();
    assert_eq!(raced, real - 1);
    let mut short = vec![0u8; raced];
    assert_eq!(
        rt.device_info(device, DeviceParam::Name, Some(&mut short)),
        Err(Status::INVALID_VALUE)
    );
    assert_eq!(rt.device_info(device, DeviceParam::Name, None), Ok(real));
}
