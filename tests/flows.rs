use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use heddle::{
    ContextBuilder, Error, ErrorKind,
    loom::{
        flow::{DataFlow, DataFlowFactory, FlowBackend, FlowError, FlowPolicies, FlowPosition},
        memory::{Heap, HeapFlow, HostBuffer, KB, MB, Memory, MemoryError},
        platform,
        shape::{SlicedTensorShape, TensorShape},
        task::{Status, Task},
    },
};
use rayon::prelude::*;

#[test]
fn test_heap_budget() {
    let context = ContextBuilder::new().heap_limit(5 * MB).build();
    let allocator = context.heap().unwrap().allocator().clone();

    let a = allocator.alloc(MB).unwrap().unwrap();
    let b = allocator.alloc(3 * MB).unwrap().unwrap();
    assert_eq!(allocator.current_usage(), 4 * MB);

    let err = allocator.alloc(2 * MB).unwrap_err();
    assert!(matches!(err, MemoryError::Budget { .. }));
    assert_eq!(err.kind(), ErrorKind::NotEnoughMemory);

    allocator.free(&a).unwrap();
    assert!(a.is_weak());
    let c = allocator.alloc(2 * MB).unwrap().unwrap();
    assert_eq!(allocator.current_usage(), 5 * MB);
    assert_eq!(allocator.cumulated_usage(), 6 * MB);

    drop(b);
    drop(c);
    assert_eq!(allocator.current_usage(), 0);
    assert_eq!(allocator.allocation_count(), 0);
}

#[test]
fn test_strided_copy() {
    const N: u64 = 16;
    const OFFSET: u64 = 12;
    const STRIDE: u64 = 20;

    let context = ContextBuilder::new().heap_limit(64 * KB).build();
    let allocator = context.heap().unwrap().allocator().clone();
    let source = allocator.alloc(N * 4).unwrap().unwrap();
    let destination = allocator.alloc(OFFSET + (N - 1) * STRIDE + 4).unwrap().unwrap();

    let words = (0..N as u32).map(|x| x * 7 + 1).collect::<Vec<_>>();
    HostBuffer::of(&source).unwrap().write_pod(0, &words).unwrap();

    let flow = context
        .initiate_flow(
            &source,
            &destination,
            vec![FlowPosition::contiguous(N, 0, 4)],
            vec![FlowPosition::new(N, OFFSET, 4, STRIDE)],
        )
        .unwrap();
    let status = flow.start();
    assert!(status.is_successful());
    assert!(flow.successful());
    assert!(!flow.running());

    let buffer = HostBuffer::of(&destination).unwrap();
    for (index, &word) in words.iter().enumerate() {
        let offset = (OFFSET + index as u64 * STRIDE) as usize;
        assert_eq!(buffer.read_pod::<u32>(offset, 1).unwrap(), vec![word]);
    }
    // bytes between the strided words are untouched
    assert_eq!(buffer.read_pod::<u32>(OFFSET as usize + 4, 1).unwrap(), vec![0]);

    // blocks are free for further flows
    assert!(source.try_acquire_safe_write_access().unwrap());
    source.release_write_access().unwrap();
}

#[test]
fn test_slice_gather() {
    let context = ContextBuilder::new().heap_limit(64 * KB).build();
    let allocator = context.heap().unwrap().allocator().clone();

    let parent = TensorShape::new([5, 3, 2]).unwrap();
    let sliced = SlicedTensorShape::new(parent.clone(), [1, 1, 0], [3, 2, 2]).unwrap();

    let source = allocator.alloc(parent.size() * 4).unwrap().unwrap();
    let destination = allocator.alloc(sliced.size() * 4).unwrap().unwrap();
    let values = (0..parent.size() as u32).collect::<Vec<_>>();
    HostBuffer::of(&source).unwrap().write_pod(0, &values).unwrap();

    let flow = context
        .initiate_flow(
            &source,
            &destination,
            sliced.parent_sites(4),
            sliced.packed_sites(4),
        )
        .unwrap();
    assert!(flow.start().is_successful());

    let gathered = HostBuffer::of(&destination)
        .unwrap()
        .read_pod::<u32>(0, sliced.size() as usize)
        .unwrap();
    for (packed, &value) in gathered.iter().enumerate() {
        let index = sliced.shape().index_of(packed as u64).unwrap();
        assert_eq!(value as u64, sliced.parent_offset_of(&index).unwrap());
    }
}

#[test]
fn test_busy_blocks() {
    let context = ContextBuilder::new().heap_limit(KB).build();
    let allocator = context.heap().unwrap().allocator().clone();
    let source = allocator.alloc(16).unwrap().unwrap();
    let destination = allocator.alloc(16).unwrap().unwrap();
    let sites = vec![FlowPosition::bytes(16, 0)];

    destination.acquire_safe_read_access().unwrap();
    let flow = context
        .initiate_flow(&source, &destination, sites.clone(), sites)
        .unwrap();
    let status = flow.start();
    assert!(status.is_failure());
    assert!(!status.contains(Status::IN_PROGRESS));
    assert!(!status.contains(Status::INITIATED));

    // flags and signal agree on the outcome
    assert!(flow.terminated());
    assert!(flow.interrupted());
    assert!(!flow.running());
    assert_eq!(flow.flags(), status);
    assert_eq!(flow.wait(), status);

    // the read access on the source was rolled back
    assert!(source.try_acquire_safe_write_access().unwrap());
}

/// Copies nothing and spins until it is aborted.
#[derive(Debug, Default)]
struct StallingFlow {
    aborted: AtomicBool,
}

impl FlowBackend for StallingFlow {
    fn policies(&self) -> FlowPolicies {
        FlowPolicies::SUPPORT_ABORT
    }

    fn transfer(&self, flow: &DataFlow) -> Result<(), FlowError> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.aborted.load(Ordering::Acquire) {
            if Instant::now() > deadline {
                return Err(FlowError::Backend("never aborted".into()));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Err(FlowError::Aborted(flow.id()))
    }

    fn abort(&self, _flow: &DataFlow) -> Result<(), FlowError> {
        self.aborted.store(true, Ordering::Release);
        Ok(())
    }
}

#[test]
fn test_abort() {
    let context = ContextBuilder::new().heap_limit(KB).build();
    let heap = context.heap().unwrap();
    let scratch = Memory::new(&context, "scratch", Heap::descriptor(KB), Heap);
    DataFlowFactory::new(&context, &heap, &scratch, StallingFlow::default()).unwrap();

    let source = heap.allocator().alloc(64).unwrap().unwrap();
    let destination = scratch.allocator().alloc(64).unwrap().unwrap();
    let sites = vec![FlowPosition::bytes(64, 0)];
    let flow = context
        .initiate_flow(&source, &destination, sites.clone(), sites)
        .unwrap();

    let handle = platform::spawn(flow.clone()).unwrap();
    flow.signal()
        .wait(|value| Status(value).contains(Status::IN_PROGRESS));
    assert!(flow.running());
    flow.abort().unwrap();

    let status = handle.join().unwrap();
    assert!(status.is_failure());
    assert!(flow.interrupted());
    assert_eq!(flow.wait(), status);

    // aborting a terminated flow is a no-op
    flow.abort().unwrap();
    assert!(destination.try_acquire_safe_write_access().unwrap());
}

#[test]
#[cfg_attr(not(any(debug_assertions, feature = "strict")), ignore)]
fn test_abort_before_start() {
    let context = ContextBuilder::new().heap_limit(KB).build();
    let heap = context.heap().unwrap();
    let scratch = Memory::new(&context, "scratch", Heap::descriptor(KB), Heap);
    DataFlowFactory::new(&context, &heap, &scratch, StallingFlow::default()).unwrap();

    let source = heap.allocator().alloc(8).unwrap().unwrap();
    let destination = scratch.allocator().alloc(8).unwrap().unwrap();
    let sites = vec![FlowPosition::bytes(8, 0)];
    let flow = context
        .initiate_flow(&source, &destination, sites.clone(), sites)
        .unwrap();

    let err = flow.abort().unwrap_err();
    assert!(matches!(err, FlowError::NotInitiated(_)));
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[test]
fn test_flows_in_parallel() {
    const COUNT: usize = 64;
    const SIZE: u64 = 256;

    let context = ContextBuilder::new().heap_limit(MB).build();
    let allocator = context.heap().unwrap().allocator().clone();
    let pairs = (0..COUNT)
        .map(|index| {
            let source = allocator.alloc(SIZE).unwrap().unwrap();
            let destination = allocator.alloc(SIZE).unwrap().unwrap();
            let bytes = vec![index as u8; SIZE as usize];
            HostBuffer::of(&source).unwrap().write_pod(0, &bytes).unwrap();
            (source, destination)
        })
        .collect::<Vec<_>>();

    let flows = pairs
        .par_iter()
        .map(|(source, destination)| {
            let sites = vec![FlowPosition::bytes(SIZE, 0)];
            context.initiate_flow(source, destination, sites.clone(), sites)
        })
        .collect::<Result<Vec<_>, Error>>()
        .unwrap();
    assert_eq!(context.live_tasks().len(), COUNT);

    let statuses = flows.par_iter().map(|flow| flow.start()).collect::<Vec<_>>();
    assert!(statuses.iter().all(|status| status.is_successful()));

    for (index, (_, destination)) in pairs.iter().enumerate() {
        let bytes = HostBuffer::of(destination)
            .unwrap()
            .read_pod::<u8>(0, SIZE as usize)
            .unwrap();
        assert!(bytes.iter().all(|&byte| byte == index as u8));
    }
}

#[test]
fn test_independent_contexts() {
    let contexts = (0..4)
        .map(|_| ContextBuilder::new().heap_limit(KB).build())
        .collect::<Vec<_>>();
    let handles = contexts
        .iter()
        .cloned()
        .map(|context| {
            thread::spawn(move || {
                let allocator = context.heap().unwrap().allocator().clone();
                let source = allocator.alloc(32).unwrap().unwrap();
                let destination = allocator.alloc(32).unwrap().unwrap();
                let sites = vec![FlowPosition::bytes(32, 0)];
                let flow = context
                    .initiate_flow(&source, &destination, sites.clone(), sites)
                    .unwrap();
                flow.start()
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        assert!(handle.join().unwrap().is_successful());
    }

    // blocks of one context never reach the factories of another
    let a = contexts[0].heap().unwrap().allocator().alloc(8).unwrap().unwrap();
    let b = contexts[1].heap().unwrap().allocator().alloc(8).unwrap().unwrap();
    let sites = vec![FlowPosition::bytes(8, 0)];
    let err = contexts[0]
        .initiate_flow(&a, &b, sites.clone(), sites)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[test]
fn test_heap_flow_factory() {
    let context = ContextBuilder::new().heap_limit(KB).build();
    let heap = context.heap().unwrap();
    let factory = context.flow_factory(heap.id(), heap.id()).unwrap();
    assert!(!factory.policies().contains(FlowPolicies::SUPPORT_ABORT));
    assert!(DataFlowFactory::new(&context, &heap, &heap, HeapFlow).is_err());
}
