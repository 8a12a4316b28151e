use std::{
    collections::{HashMap, HashSet},
    ptr::NonNull,
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    run_loop::test_support::RunLoopInScopedThread, Allocator, CombinedFinalizerQueue, Config,
    Finalizer, FinalizerQueue, FinalizerThread, GcHandle, Heap, ObjectFate, ObjectModel,
    RunLoopFinalizerProcessor,
};

#[derive(Default)]
struct ModelState {
    marked: Mutex<HashSet<usize>>,
    finalizable: Mutex<HashMap<usize, FinalizerThread>>,
    /// Objects whose finalizer was handed out but has not run.
    finalizing: Arc<Mutex<HashSet<usize>>>,
    visits: Mutex<HashMap<usize, usize>>,
}

impl ModelState {
    fn mark(&self, object: NonNull<u8>) {
        self.marked.lock().insert(object.as_ptr() as usize);
    }

    fn needs_finalizer(&self, object: NonNull<u8>, thread: FinalizerThread) {
        self.finalizable
            .lock()
            .insert(object.as_ptr() as usize, thread);
    }

    fn visits(&self, object: NonNull<u8>) -> usize {
        self.visits
            .lock()
            .get(&(object.as_ptr() as usize))
            .copied()
            .unwrap_or(0)
    }
}

/// Collector stand-in: liveness comes from explicit marks, finalization needs
/// from explicit registrations.
struct TestModel(Arc<ModelState>);

impl ObjectModel for TestModel {
    unsafe fn sweep_object(&self, object: NonNull<u8>) -> ObjectFate {
        let address = object.as_ptr() as usize;
        *self.0.visits.lock().entry(address).or_insert(0) += 1;
        if self.0.marked.lock().remove(&address) {
            return ObjectFate::Live;
        }
        if self.0.finalizing.lock().contains(&address) {
            return ObjectFate::Finalizing;
        }
        match self.0.finalizable.lock().remove(&address) {
            Some(thread) => {
                self.0.finalizing.lock().insert(address);
                let finalizing = self.0.finalizing.clone();
                ObjectFate::Finalize {
                    thread,
                    finalizer: Finalizer::new(move || {
                        finalizing.lock().remove(&address);
                    }),
                }
            }
            None => ObjectFate::Reclaim,
        }
    }
}

fn heap() -> (Arc<Heap>, Arc<ModelState>) {
    let state = Arc::new(ModelState::default());
    let heap = Arc::new(Heap::new(Config::default(), TestModel(state.clone())));
    (heap, state)
}

fn collect(heap: &Heap, allocators: &mut [&mut Allocator], epoch: u64) -> CombinedFinalizerQueue {
    for allocator in allocators.iter_mut() {
        allocator.prepare_for_gc();
    }
    heap.prepare_for_gc();
    heap.sweep(GcHandle::new(epoch))
}

fn addresses(objects: Vec<NonNull<u8>>) -> HashSet<usize> {
    objects.into_iter().map(|o| o.as_ptr() as usize).collect()
}

#[test]
fn sweep_keeps_marked_objects_only() {
    let (heap, state) = heap();
    let mut allocator = Allocator::new(heap.clone());
    let sizes = [8, 16, 100, 1024, 2000, 70_000, 300_000];
    let mut survivors = HashSet::new();
    for (i, size) in sizes.iter().cycle().take(70).enumerate() {
        let object = allocator.allocate(*size).unwrap();
        if i % 2 == 0 {
            state.mark(object);
            survivors.insert(object.as_ptr() as usize);
        }
    }

    let finalizers = collect(&heap, &mut [&mut allocator], 1);
    assert!(finalizers.is_empty());
    assert_eq!(addresses(unsafe { heap.allocated_objects() }), survivors);

    let stats = heap.statistics();
    assert_eq!(stats.kept_objects, 35);
    assert_eq!(stats.swept_objects, 35);
    assert_eq!(stats.last_epoch, 1);
    assert_eq!(stats.gc_cycles, 1);

    collect(&heap, &mut [&mut allocator], 2);
    assert!(unsafe { heap.allocated_objects() }.is_empty());
    assert_eq!(heap.statistics().single_object_pages, 0);
}

#[test]
fn finalizable_objects_stay_until_their_finalizer_ran() {
    let (heap, state) = heap();
    let mut allocator = Allocator::new(heap.clone());
    let regular = allocator.allocate(32).unwrap();
    let main = allocator.allocate(32).unwrap();
    state.needs_finalizer(regular, FinalizerThread::Any);
    state.needs_finalizer(main, FinalizerThread::Main);

    let mut finalizers = collect(&heap, &mut [&mut allocator], 1);
    assert_eq!(finalizers.regular.size(), 1);
    assert_eq!(finalizers.main_thread.size(), 1);
    assert_eq!(unsafe { heap.allocated_objects() }.len(), 2);

    // Finalizers not run yet: the blocks must survive another cycle.
    let pending = collect(&heap, &mut [&mut allocator], 2);
    assert!(pending.is_empty());
    assert_eq!(unsafe { heap.allocated_objects() }.len(), 2);

    finalizers.merge_into_regular();
    assert_eq!(finalizers.regular.run_all(), 2);
    collect(&heap, &mut [&mut allocator], 3);
    assert!(unsafe { heap.allocated_objects() }.is_empty());
    assert_eq!(heap.statistics().finalizers_scheduled, 2);
}

#[test]
fn extra_objects_are_swept_separately() {
    let (heap, state) = heap();
    let mut allocator = Allocator::new(heap.clone());
    let kept = allocator.allocate_extra_object().unwrap();
    allocator.allocate_extra_object().unwrap();
    state.mark(kept);

    collect(&heap, &mut [&mut allocator], 1);
    let stats = heap.statistics();
    assert_eq!(stats.kept_extra_objects, 1);
    assert_eq!(stats.swept_extra_objects, 1);
    assert_eq!(stats.kept_objects, 0);
    assert_eq!(
        addresses(unsafe { heap.allocated_extra_objects() }),
        addresses(vec![kept])
    );
}

#[test]
fn concurrent_sweepers_visit_every_object_once_per_cycle() {
    let (heap, state) = heap();
    let mut allocators: Vec<Allocator> = (0..4).map(|_| Allocator::new(heap.clone())).collect();
    let mut objects = vec![];
    for (i, allocator) in allocators.iter_mut().enumerate() {
        for j in 0..4000 {
            objects.push(allocator.allocate(8 * (1 + (i + j) % 40)).unwrap());
        }
    }

    for cycle in 1..=2u64 {
        for object in &objects {
            state.mark(*object);
        }
        for allocator in allocators.iter_mut() {
            allocator.prepare_for_gc();
        }
        heap.prepare_for_gc();
        let sweepers: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                thread::spawn(move || heap.sweep(GcHandle::new(cycle)))
            })
            .collect();
        for sweeper in sweepers {
            assert!(sweeper.join().unwrap().is_empty());
        }
        for object in &objects {
            assert_eq!(state.visits(*object), cycle as usize);
        }
    }
    assert_eq!(heap.statistics().kept_objects, 2 * objects.len());
}

#[test]
fn mutators_and_sweepers_share_a_cycle_without_double_sweeping() {
    let (heap, state) = heap();
    let mut allocators: Vec<Allocator> = (0..4).map(|_| Allocator::new(heap.clone())).collect();
    let mut survivors = vec![];
    for (i, allocator) in allocators.iter_mut().enumerate() {
        for j in 0..2000 {
            survivors.push(allocator.allocate(8 * (1 + (i + j) % 40)).unwrap());
        }
    }

    for cycle in 1..=3u64 {
        for object in &survivors {
            state.mark(*object);
        }
        for allocator in allocators.iter_mut() {
            allocator.prepare_for_gc();
        }
        heap.prepare_for_gc();

        let mutators: Vec<_> = allocators
            .drain(..)
            .enumerate()
            .map(|(i, mut allocator)| {
                thread::spawn(move || {
                    for j in 0..5000 {
                        allocator.allocate(8 * (1 + (i + j) % 40)).unwrap();
                    }
                    allocator
                })
            })
            .collect();
        let sweepers: Vec<_> = (0..3)
            .map(|_| {
                let heap = heap.clone();
                thread::spawn(move || heap.sweep(GcHandle::new(cycle)))
            })
            .collect();
        for sweeper in sweepers {
            assert!(sweeper.join().unwrap().is_empty());
        }
        allocators.extend(mutators.into_iter().map(|m| m.join().unwrap()));

        for object in &survivors {
            assert_eq!(state.visits(*object), cycle as usize);
        }
        let allocated = addresses(unsafe { heap.allocated_objects() });
        assert!(survivors
            .iter()
            .all(|object| allocated.contains(&(object.as_ptr() as usize))));
    }
}

#[test]
fn fixed_block_page_rejects_unsupported_sizes() {
    let (heap, _state) = heap();
    let mut finalizers = CombinedFinalizerQueue::new();
    assert!(heap.get_fixed_block_page(0, &mut finalizers).is_none());
    assert!(heap.get_fixed_block_page(129, &mut finalizers).is_none());
    assert!(heap.get_fixed_block_page(128, &mut finalizers).is_some());
    assert_eq!(heap.statistics().fixed_block_pages, 1);
}

#[test]
fn mutator_sweeps_unswept_pages_it_takes() {
    let (heap, state) = heap();
    let mut allocator = Allocator::new(heap.clone());
    let dead: Vec<_> = (0..10).map(|_| allocator.allocate(16).unwrap()).collect();
    let finalizable = allocator.allocate(16).unwrap();
    state.needs_finalizer(finalizable, FinalizerThread::Any);

    allocator.prepare_for_gc();
    heap.prepare_for_gc();
    // The only unswept page of this size class gets swept by the allocator.
    let reused = allocator.allocate(16).unwrap();
    assert!(dead.contains(&reused));
    for object in &dead {
        assert_eq!(state.visits(*object), 1);
    }
    assert_eq!(allocator.extract_finalizer_queue().regular.size(), 1);

    let finalizers = heap.sweep(GcHandle::new(1));
    assert!(finalizers.is_empty());
    assert_eq!(state.visits(finalizable), 1);
    assert_eq!(heap.statistics().swept_objects, 10);
}

#[test]
fn allocations_never_overlap() {
    let (heap, _state) = heap();
    let mut allocator = Allocator::new(heap);
    let mut ranges = vec![];
    let mut size = 1usize;
    for _ in 0..3000 {
        size = (size * 7919 + 13) % 6000 + 1;
        let object = allocator.allocate(size).unwrap();
        ranges.push((object.as_ptr() as usize, object.as_ptr() as usize + size));
    }
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
}

#[test]
fn pending_finalizer_queue_is_merged_and_extracted() {
    let (heap, _state) = heap();
    let mut first = CombinedFinalizerQueue::new();
    first.push(FinalizerThread::Any, || {});
    let mut second = CombinedFinalizerQueue::new();
    second.push(FinalizerThread::Main, || {});
    second.push(FinalizerThread::Any, || {});

    heap.add_to_finalizer_queue(first);
    heap.add_to_finalizer_queue(second);
    let pending = heap.extract_finalizer_queue();
    assert_eq!(pending.size(), 3);
    assert_eq!(pending.main_thread.size(), 1);
    assert!(heap.extract_finalizer_queue().is_empty());
}

#[test]
fn dropped_allocator_hands_its_finalizers_to_the_heap() {
    let (heap, state) = heap();
    let mut allocator = Allocator::new(heap.clone());
    let object = allocator.allocate(16).unwrap();
    state.needs_finalizer(object, FinalizerThread::Main);
    allocator.prepare_for_gc();
    heap.prepare_for_gc();
    allocator.allocate(16).unwrap();
    drop(allocator);
    assert_eq!(heap.extract_finalizer_queue().main_thread.size(), 1);
}

#[test]
fn clear_for_tests_releases_everything() {
    let (heap, _state) = heap();
    {
        let mut allocator = Allocator::new(heap.clone());
        allocator.allocate(24).unwrap();
        allocator.allocate(4096).unwrap();
        allocator.allocate(1 << 20).unwrap();
        allocator.allocate_extra_object().unwrap();
        assert!(heap.estimate_overhead_per_thread() > std::mem::size_of::<Allocator>());
        assert!(heap.statistics().to_string().contains("1 single-object"));
    }
    unsafe { heap.clear_for_tests() };
    let stats = heap.statistics();
    assert_eq!(stats.bytes_mapped, 0);
    assert_eq!(
        stats.fixed_block_pages + stats.next_fit_pages + stats.extra_object_pages,
        0
    );
    assert_eq!(heap.estimate_overhead_per_thread(), std::mem::size_of::<Allocator>());
}

fn stamped(sender: &mpsc::Sender<(&'static str, Instant)>, name: &'static str) -> Finalizer {
    let sender = sender.clone();
    Finalizer::new(move || sender.send((name, Instant::now())).unwrap())
}

fn sleeping(sender: &mpsc::Sender<(&'static str, Instant)>, name: &'static str) -> Finalizer {
    let sender = sender.clone();
    Finalizer::new(move || {
        thread::sleep(Duration::from_millis(2));
        sender.send((name, Instant::now())).unwrap();
    })
}

fn attached(processor: &Arc<RunLoopFinalizerProcessor>) -> RunLoopInScopedThread {
    let processor = processor.clone();
    RunLoopInScopedThread::new(move || processor.attach_to_current_run_loop())
}

fn receive(receiver: &mpsc::Receiver<(&'static str, Instant)>, n: usize) -> Vec<(&'static str, Instant)> {
    (0..n)
        .map(|_| receiver.recv_timeout(Duration::from_secs(10)).unwrap())
        .collect()
}

fn names(events: &[(&'static str, Instant)]) -> Vec<&'static str> {
    events.iter().map(|(name, _)| *name).collect()
}

#[test]
fn run_loop_processor_runs_batch_most_recent_first() {
    let processor = RunLoopFinalizerProcessor::new();
    let _run_loop = attached(&processor);
    let (sender, receiver) = mpsc::channel();
    processor.schedule([stamped(&sender, "A"), stamped(&sender, "B")].into_iter().collect());
    assert_eq!(names(&receive(&receiver, 2)), vec!["B", "A"]);
}

#[test]
fn run_loop_processor_runs_tasks_scheduled_while_processing_afterwards() {
    let processor = RunLoopFinalizerProcessor::new();
    let _run_loop = attached(&processor);
    let (sender, receiver) = mpsc::channel();
    let rescheduled = {
        let processor = processor.clone();
        let sender = sender.clone();
        Finalizer::new(move || {
            sender.send(("B", Instant::now())).unwrap();
            processor.schedule([stamped(&sender, "C"), stamped(&sender, "D")].into_iter().collect());
        })
    };
    processor.schedule([stamped(&sender, "A"), rescheduled].into_iter().collect());
    assert_eq!(names(&receive(&receiver, 4)), vec!["B", "A", "D", "C"]);
}

#[test]
fn run_loop_processor_yields_when_out_of_time() {
    let processor = RunLoopFinalizerProcessor::new();
    processor.with_config(|config| {
        config.max_time_in_task = Duration::from_millis(1);
        config.min_time_between_tasks = Duration::from_millis(10);
    });
    let _run_loop = attached(&processor);
    let (sender, receiver) = mpsc::channel();
    let tasks: FinalizerQueue = [
        stamped(&sender, "0"),
        stamped(&sender, "1"),
        sleeping(&sender, "2"),
        stamped(&sender, "3"),
    ]
    .into_iter()
    .collect();
    processor.schedule(tasks);

    let events = receive(&receiver, 4);
    assert_eq!(names(&events), vec!["3", "2", "1", "0"]);
    let slept_until = events[1].1;
    let resumed_at = events[2].1;
    assert!(resumed_at.duration_since(slept_until) >= Duration::from_millis(10));
}

#[test]
fn run_loop_processor_finishes_current_batch_before_new_one_after_overtime() {
    let processor = RunLoopFinalizerProcessor::new();
    processor.with_config(|config| {
        config.max_time_in_task = Duration::from_millis(1);
        config.min_time_between_tasks = Duration::from_millis(10);
    });
    let _run_loop = attached(&processor);
    let (sender, receiver) = mpsc::channel();
    let sleeper = {
        let processor = processor.clone();
        let sender = sender.clone();
        Finalizer::new(move || {
            thread::sleep(Duration::from_millis(2));
            processor.schedule([stamped(&sender, "4"), stamped(&sender, "5")].into_iter().collect());
            sender.send(("2", Instant::now())).unwrap();
        })
    };
    let tasks: FinalizerQueue = [
        stamped(&sender, "0"),
        stamped(&sender, "1"),
        sleeper,
        stamped(&sender, "3"),
    ]
    .into_iter()
    .collect();
    processor.schedule(tasks);

    let events = receive(&receiver, 6);
    assert_eq!(names(&events), vec!["3", "2", "1", "0", "5", "4"]);
    assert!(events[2].1.duration_since(events[1].1) >= Duration::from_millis(10));
}

#[test]
fn run_loop_processor_keeps_a_gap_between_rounds() {
    let processor = RunLoopFinalizerProcessor::new();
    processor.with_config(|config| config.min_time_between_tasks = Duration::from_millis(20));
    let run_loop = attached(&processor);
    let (sender, receiver) = mpsc::channel();
    processor.schedule(std::iter::once(stamped(&sender, "first")).collect());
    let first = receive(&receiver, 1);

    // Runs on the loop thread once the first round has returned.
    let later = {
        let processor = processor.clone();
        let sender = sender.clone();
        move || processor.schedule(std::iter::once(stamped(&sender, "second")).collect())
    };
    run_loop.perform(later);
    let second = receive(&receiver, 1);
    assert!(second[0].1.duration_since(first[0].1) >= Duration::from_millis(20));
}
