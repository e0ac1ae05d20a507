mod common;

use accel_cl::{
    Buffer, CommandQueue, Event, KernelArg, MemAccess, MemoryObject, NdRange, Program,
    QueueOptions,
};
use accel_sys::ObjectKind;
use common::rig;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    NewBuffer(usize),
    CloneBuffer(usize),
    DropBuffer(usize),
    Write(usize),
    Read(usize),
    Marker,
    DropEvent(usize),
    Launch(usize),
    NewQueue,
    Pause,
    Resume,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..256).prop_map(Op::NewBuffer),
        2 => any::<usize>().prop_map(Op::CloneBuffer),
        2 => any::<usize>().prop_map(Op::DropBuffer),
        3 => any::<usize>().prop_map(Op::Write),
        1 => any::<usize>().prop_map(Op::Read),
        1 => Just(Op::Marker),
        2 => any::<usize>().prop_map(Op::DropEvent),
        2 => any::<usize>().prop_map(Op::Launch),
        1 => Just(Op::NewQueue),
        1 => Just(Op::Pause),
        1 => Just(Op::Resume),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        rng_algorithm: proptest::test_runner::RngAlgorithm::ChaCha,
        rng_seed: proptest::test_runner::RngSeed::Fixed(0xACCE1),
        .. ProptestConfig::default()
    })]

    #[test]
    fn every_host_reference_is_released(ops in proptest::collection::vec(op(), 0..48)) {
        let rig = rig();
        rig.runtime.register_kernel("touch", |launch| {
            let len = launch.mem(0)?.len();
            launch.mem_mut(0)?.fill(len as u8);
            Ok(())
        });
        let program = Program::with_source(&rig.context, "__kernel void touch(__global uchar *b) {}")
            .unwrap();
        program.build("").unwrap();
        let kernel = program.get_kernel("touch").unwrap();

        let mut queues: Vec<CommandQueue> = vec![rig.queue.clone()];
        let mut buffers: Vec<Buffer> = Vec::new();
        let mut events: Vec<Event> = Vec::new();
        let mut paused = false;
        for op in ops {
            let queue = queues.last().unwrap().clone();
            match op {
                Op::NewBuffer(size) => {
                    buffers.push(Buffer::new(&rig.context, size, MemAccess::ReadWrite).unwrap());
                }
                Op::CloneBuffer(i) if !buffers.is_empty() => {
                    let copy = buffers[i % buffers.len()].clone();
                    buffers.push(copy);
                }
                Op::DropBuffer(i) if !buffers.is_empty() => {
                    buffers.swap_remove(i % buffers.len());
                }
                Op::Write(i) if !buffers.is_empty() => {
                    let buffer = &buffers[i % buffers.len()];
                    let data = vec![i as u8; buffer.size()];
                    events.push(queue.write_buffer(buffer, 0, &data, false, &events).unwrap());
                }
                // Dropping a pending read blocks until it completes.
                Op::Read(i) if !buffers.is_empty() && !paused => {
                    let buffer = &buffers[i % buffers.len()];
                    let mut out = vec![0u8; buffer.size()];
                    let read = queue.read_buffer(buffer, 0, &mut out, false, &[]).unwrap();
                    events.push(read.event().clone());
                    drop(read);
                }
                Op::Marker => events.push(queue.marker(&[]).unwrap()),
                Op::DropEvent(i) if !events.is_empty() => {
                    events.swap_remove(i % events.len());
                }
                Op::Launch(i) if !buffers.is_empty() => {
                    kernel.set_arg(0, KernelArg::from(&buffers[i % buffers.len()])).unwrap();
                    events.push(queue.run_kernel(&kernel, &NdRange::linear(1), &[]).unwrap());
                }
                Op::NewQueue => {
                    queues.push(
                        CommandQueue::new(&rig.context, &rig.devices[0], QueueOptions::default())
                            .unwrap(),
                    );
                }
                Op::Pause => {
                    rig.runtime.pause();
                    paused = true;
                }
                Op::Resume => {
                    rig.runtime.resume();
                    paused = false;
                }
                _ => {}
            }
        }
        rig.runtime.resume();
        Event::wait_for(&events).unwrap();

        drop((events, buffers, queues, kernel, program));
        let runtime = rig.teardown();
        let ledger = runtime.ledger();
        prop_assert!(ledger.is_balanced(), "{ledger:?}");
        for kind in ObjectKind::ALL {
            prop_assert_eq!(ledger.created(kind), ledger.destroyed(kind), "{}", kind);
        }
    }
}

#[test]
fn in_flight_commands_keep_dropped_objects_alive() {
    let rig = rig();
    let buffer = Buffer::new(&rig.context, 32, MemAccess::ReadWrite).unwrap();

    rig.runtime.pause();
    let write = rig
        .queue
        .write_buffer(&buffer, 0, &[3u8; 32], false, &[])
        .unwrap();
    drop(buffer);
    assert_eq!(rig.runtime.ledger().destroyed(ObjectKind::Mem), 0);

    rig.runtime.resume();
    write.wait().unwrap();
    assert_eq!(rig.runtime.ledger().destroyed(ObjectKind::Mem), 1);
}

#[test]
fn dependents_keep_the_context_alive() {
    let rig = rig();
    let buffer = Buffer::new(&rig.context, 8, MemAccess::ReadWrite).unwrap();
    let runtime = rig.teardown();
    assert_eq!(runtime.ledger().destroyed(ObjectKind::Context), 0);
    assert_eq!(buffer.context().reference_count().unwrap(), 2);

    drop(buffer);
    let ledger = runtime.ledger();
    assert_eq!(ledger.destroyed(ObjectKind::Context), 1);
    assert!(ledger.is_balanced());
}

#[test]
fn clones_retain_and_drops_release() {
    let rig = rig();
    let buffer = Buffer::new(&rig.context, 8, MemAccess::ReadWrite).unwrap();
    assert_eq!(buffer.reference_count().unwrap(), 1);
    let second = buffer.clone();
    assert_eq!(buffer.reference_count().unwrap(), 2);
    drop(second);
    assert_eq!(buffer.reference_count().unwrap(), 1);
    assert_eq!(rig.runtime.ledger().retained(ObjectKind::Mem), 1);
}
