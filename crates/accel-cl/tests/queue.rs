mod common;

use std::sync::{mpsc, Mutex};
use std::time::{Duration, Instant};

use accel_cl::{
    Buffer, CommandQueue, CommandType, Context, ErrorKind, Event, EventStatus, Image2D,
    ImageFormat, MemAccess, NdRange, Program, QueueOptions, Status,
};
use accel_soft::SoftConfig;
use common::{bytes_of_words, rig, rig_with, words};
use pretty_assertions::assert_eq;

#[test]
fn in_order_writes_land_in_submission_order() {
    let rig = rig();
    let buffer = Buffer::new(&rig.context, 4, MemAccess::ReadWrite).unwrap();

    rig.runtime.pause();
    let events: Vec<Event> = (1..=16u32)
        .map(|tag| {
            rig.queue
                .write_buffer(&buffer, 0, &tag.to_ne_bytes(), false, &[])
                .unwrap()
        })
        .collect();
    assert_eq!(events[0].status().unwrap(), EventStatus::Queued);
    rig.runtime.resume();
    rig.queue.finish().unwrap();

    let completed: Vec<_> = rig
        .runtime
        .timeline()
        .into_iter()
        .filter(|t| t.status == EventStatus::Complete)
        .map(|t| t.event)
        .collect();
    let expected: Vec<_> = events.iter().map(Event::raw).collect();
    assert_eq!(completed, expected);

    let mut out = [0u8; 4];
    rig.queue
        .read_buffer(&buffer, 0, &mut out, true, &[])
        .unwrap();
    assert_eq!(u32::from_ne_bytes(out), 16);
}

#[test]
fn out_of_order_queue_respects_wait_lists() {
    let rig = rig_with(
        SoftConfig::default(),
        QueueOptions {
            out_of_order: true,
            profiling: false,
        },
    );
    let src = Buffer::new(&rig.context, 64, MemAccess::ReadWrite).unwrap();
    let dst = Buffer::new(&rig.context, 64, MemAccess::ReadWrite).unwrap();

    rig.runtime.pause();
    let write = rig
        .queue
        .write_buffer(&src, 0, &[9u8; 64], false, &[])
        .unwrap();
    let copy = rig
        .queue
        .copy_buffer(&src, &dst, 64, 0, 0, std::slice::from_ref(&write))
        .unwrap();
    rig.runtime.resume();
    copy.wait().unwrap();

    let timeline = rig.runtime.timeline();
    let position = |event: &Event, status: EventStatus| {
        timeline
            .iter()
            .position(|t| t.event == event.raw() && t.status == status)
            .unwrap()
    };
    assert!(position(&copy, EventStatus::Running) > position(&write, EventStatus::Complete));
    assert_eq!(copy.command_type().unwrap(), CommandType::CopyBuffer);

    let mut out = vec![0u8; 64];
    rig.queue
        .read_buffer(&dst, 0, &mut out, false, &[])
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(out, vec![9u8; 64]);
}

#[test]
fn round_trips_preserve_bytes() {
    let rig = rig();
    for len in [0usize, 1, 4096, 1 << 20] {
        let buffer = Buffer::new(&rig.context, len.max(1), MemAccess::ReadWrite).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let write = rig.queue.write_buffer(&buffer, 0, &data, false, &[]).unwrap();

        let mut out = vec![0xAAu8; len];
        let pending = rig
            .queue
            .read_buffer(&buffer, 0, &mut out, false, &[write])
            .unwrap();
        pending.wait().unwrap();
        assert_eq!(out, data, "length {len}");
    }
}

#[test]
fn zero_length_transfers_are_no_ops() {
    let rig = rig();
    let buffer = Buffer::with_data(&rig.context, MemAccess::ReadWrite, &[1, 2, 3, 4]).unwrap();
    let event = rig.queue.write_buffer(&buffer, 4, &[], true, &[]).unwrap();
    assert_eq!(event.command_type().unwrap(), CommandType::Marker);
    rig.queue.copy_buffer(&buffer, &buffer, 0, 0, 0, &[]).unwrap();

    let mut out = [0u8; 4];
    rig.queue.read_buffer(&buffer, 0, &mut out, true, &[]).unwrap();
    assert_eq!(out, [1, 2, 3, 4]);
}

#[test]
fn copies_take_the_size_before_the_offsets() {
    let rig = rig();
    let src = Buffer::with_data(&rig.context, MemAccess::ReadOnly, &[0, 1, 2, 3, 4, 5, 6, 7])
        .unwrap();
    let dst = Buffer::with_data_mappable(&rig.context, MemAccess::ReadWrite, &[0xEE; 8]).unwrap();
    assert!(dst.is_mappable());
    assert!(!src.is_mappable());

    rig.queue.copy_buffer(&src, &dst, 3, 4, 1, &[]).unwrap();
    let mut out = [0u8; 8];
    rig.queue.read_buffer(&dst, 0, &mut out, true, &[]).unwrap();
    assert_eq!(out, [0xEE, 4, 5, 6, 0xEE, 0xEE, 0xEE, 0xEE]);
}

#[test]
fn host_calls_proceed_while_a_kernel_runs() {
    let rig = rig();
    let (started_tx, started) = mpsc::channel();
    let (release, release_rx) = mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let release_rx = Mutex::new(release_rx);
    rig.runtime.register_kernel("hold", move |launch| {
        started_tx.lock().unwrap().send(()).unwrap();
        release_rx
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| Status::OUT_OF_RESOURCES)?;
        launch.store(0, 0, 7u32)
    });
    let program =
        Program::with_source(&rig.context, "__kernel void hold(__global uint *out) {}").unwrap();
    program.build("").unwrap();
    let kernel = program.get_kernel("hold").unwrap();
    let buffer = Buffer::new(&rig.context, 4, MemAccess::ReadWrite).unwrap();
    kernel.set_arg(0, &buffer).unwrap();

    let ran = rig
        .queue
        .run_kernel(&kernel, &NdRange::linear(1), &[])
        .unwrap();
    started.recv_timeout(Duration::from_secs(10)).unwrap();

    let asked = Instant::now();
    assert_eq!(ran.status().unwrap(), EventStatus::Running);
    let scratch = Buffer::new(&rig.context, 4, MemAccess::ReadWrite).unwrap();
    let write = rig
        .queue
        .write_buffer(&scratch, 0, &[1, 2, 3, 4], false, &[])
        .unwrap();
    assert!(!write.is_complete().unwrap());
    assert!(asked.elapsed() < Duration::from_secs(5));

    release.send(()).unwrap();
    rig.queue.finish().unwrap();
    assert_eq!(ran.status().unwrap(), EventStatus::Complete);
    assert!(write.is_complete().unwrap());

    let mut out = [0u8; 4];
    rig.queue.read_buffer(&buffer, 0, &mut out, true, &[]).unwrap();
    assert_eq!(words(&out), vec![7]);
}

#[test]
fn dropping_a_pending_read_still_fills_the_destination() {
    let rig = rig();
    let words_in: Vec<u32> = (0..32).collect();
    let buffer =
        Buffer::with_data(&rig.context, MemAccess::ReadOnly, &bytes_of_words(&words_in)).unwrap();

    let mut out = vec![0u8; 128];
    rig.runtime.pause();
    let pending = rig.queue.read_buffer(&buffer, 0, &mut out, false, &[]).unwrap();
    rig.runtime.resume();
    drop(pending);
    assert_eq!(words(&out), words_in);
}

#[test]
fn invalid_transfers_are_configuration_errors() {
    let rig = rig();
    let buffer = Buffer::new(&rig.context, 8, MemAccess::ReadWrite).unwrap();

    let err = rig
        .queue
        .write_buffer(&buffer, 4, &[0u8; 8], false, &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = rig
        .queue
        .copy_buffer(&buffer, &buffer, 4, 0, 2, &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.status(), Status::MEM_COPY_OVERLAP);

    let other = Context::new(&rig.platform, &rig.devices).unwrap();
    let other_queue = CommandQueue::new(&other, &rig.devices[0], QueueOptions::default()).unwrap();
    let foreign = other_queue.marker(&[]).unwrap();
    let err = rig.queue.marker(&[foreign]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let err = other_queue
        .write_buffer(&buffer, 0, &[1], false, &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn profiling_timestamps_are_ordered() {
    let rig = rig_with(
        SoftConfig::default(),
        QueueOptions {
            out_of_order: false,
            profiling: true,
        },
    );
    let buffer = Buffer::new(&rig.context, 1024, MemAccess::ReadWrite).unwrap();
    let event = rig
        .queue
        .write_buffer(&buffer, 0, &[5u8; 1024], true, &[])
        .unwrap();
    let times = event.profiling().unwrap();
    assert!(times.queued <= times.submit);
    assert!(times.submit <= times.start);
    assert!(times.start <= times.end);

    let plain = CommandQueue::new(&rig.context, &rig.devices[0], QueueOptions::default()).unwrap();
    let err = plain.marker(&[]).unwrap().profiling().unwrap_err();
    assert_eq!(err.status(), Status::PROFILING_INFO_NOT_AVAILABLE);
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn image_regions_round_trip() {
    let rig = rig();
    let pixels: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
    let image = Image2D::with_data(
        &rig.context,
        ImageFormat::RGBA8,
        4,
        4,
        MemAccess::ReadWrite,
        &pixels,
    )
    .unwrap();
    assert_eq!(image.row_pitch(), 16);

    let mut corner = vec![0u8; 2 * 2 * 4];
    rig.queue
        .read_image2d(&image, [1, 1], [2, 2], &mut corner, true, &[])
        .unwrap();
    let expected: Vec<u8> = [&pixels[20..28], &pixels[36..44]].concat();
    assert_eq!(corner, expected);

    rig.queue
        .write_image2d(&image, [0, 3], [4, 1], &[0xFF; 16], false, &[])
        .unwrap();
    let mut all = vec![0u8; pixels.len()];
    rig.queue
        .read_image2d(&image, [0, 0], [4, 4], &mut all, false, &[])
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(&all[..48], &pixels[..48]);
    assert_eq!(&all[48..], &[0xFF; 16]);

    let err = rig
        .queue
        .read_image2d(&image, [3, 3], [2, 2], &mut corner, true, &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let err = Image2D::new(&rig.context, ImageFormat::RGBA8, 0, 4, MemAccess::ReadOnly)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
