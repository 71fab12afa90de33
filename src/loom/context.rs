use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;
use uuid::Uuid;

use super::{
    error::{Error, ErrorKind},
    flow::{DataFlow, DataFlowFactory, FlowPosition},
    memory::{DataBlock, DataSize, GB, Heap, HeapFlow, Memory, MemoryDescriptor},
    task::Task,
};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("a flow factory is already registered for memory {from} → memory {to}")]
    FactoryRegistered { from: Uuid, to: Uuid },
    #[error("no flow factory registered for memory {from} → memory {to}")]
    NoFactory { from: Uuid, to: Uuid },
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::FactoryRegistered { .. } => ErrorKind::AlreadyInitialized,
            ContextError::NoFactory { .. } => ErrorKind::IllegalArgument,
        }
    }
}

#[derive(Default)]
struct ContextInner {
    memories: RwLock<HashMap<Uuid, Arc<Memory>>>,
    heap: RwLock<Option<Arc<Memory>>>,
    factories: RwLock<HashMap<(Uuid, Uuid), Arc<DataFlowFactory>>>,
    tasks: Mutex<HashMap<Uuid, Weak<dyn Task>>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        log::info!(
            "context destroyed with {} memories and {} flow factories",
            self.memories.get_mut().len(),
            self.factories.get_mut().len()
        );
    }
}

/// Owns the memory pools, the flow factory of each pool pair and the task registry.
///
/// Cheap to clone. Everything created through a context must be dropped before the context itself.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("memories", &self.0.memories.read().len())
            .field("factories", &self.0.factories.read().len())
            .field("tasks", &self.0.tasks.lock().len())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        ContextBuilder::new().build()
    }
}

impl Context {
    #[inline]
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Draws a fresh random id.
    #[inline]
    pub fn generate_uuid(&self) -> Uuid {
        Uuid::new_v4()
    }

    pub fn register_memory(&self, memory: Arc<Memory>) {
        log::debug!("context: memory {} ({}) registered", memory.name(), memory.id());
        self.0.memories.write().insert(memory.id(), memory);
    }

    pub fn memories(&self) -> Vec<Arc<Memory>> {
        self.0.memories.read().values().cloned().collect()
    }

    #[inline]
    pub fn memory(&self, id: Uuid) -> Option<Arc<Memory>> {
        self.0.memories.read().get(&id).cloned()
    }

    /// The host heap, unless the context was built without one.
    #[inline]
    pub fn heap(&self) -> Option<Arc<Memory>> {
        self.0.heap.read().clone()
    }

    /// Fails if a factory is already registered for the same pool pair.
    pub fn register_flow_factory(&self, factory: Arc<DataFlowFactory>) -> Result<(), ContextError> {
        let descriptor = *factory.descriptor();
        let key = (descriptor.source, descriptor.destination);
        let mut factories = self.0.factories.write();
        if factories.contains_key(&key) {
            let err = ContextError::FactoryRegistered {
                from: descriptor.source,
                to: descriptor.destination,
            };
            log::error!("{err}");
            return Err(err);
        }
        factories.insert(key, factory);
        Ok(())
    }

    #[inline]
    pub fn flow_factory(&self, from: Uuid, to: Uuid) -> Option<Arc<DataFlowFactory>> {
        self.0.factories.read().get(&(from, to)).cloned()
    }

    /// Records a weak reference to `task` under its id.
    pub fn register_task<T: Task + 'static>(&self, task: &Arc<T>) {
        let task: Arc<dyn Task> = task.clone();
        let mut tasks = self.0.tasks.lock();
        tasks.retain(|_, task| task.strong_count() > 0);
        tasks.insert(task.id(), Arc::downgrade(&task));
    }

    #[inline]
    pub fn task(&self, id: Uuid) -> Option<Arc<dyn Task>> {
        self.0.tasks.lock().get(&id).and_then(Weak::upgrade)
    }

    /// All registered tasks that are still alive.
    pub fn live_tasks(&self) -> Vec<Arc<dyn Task>> {
        self.0
            .tasks
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Builds and registers a flow with the factory bound to the pools of `source` and `destination`.
    pub fn initiate_flow(
        &self,
        source: &Arc<DataBlock>,
        destination: &Arc<DataBlock>,
        source_sites: Vec<FlowPosition>,
        destination_sites: Vec<FlowPosition>,
    ) -> Result<Arc<DataFlow>, Error> {
        let (from, to) = (source.memory(), destination.memory());
        let Some(factory) = self.flow_factory(from, to) else {
            let err = ContextError::NoFactory { from, to };
            log::error!("{err}");
            return Err(err.into());
        };
        let id = self.generate_uuid();
        let flow = factory.initiate_flow(source, destination, source_sites, destination_sites, id)?;
        self.register_task(&flow);
        Ok(flow)
    }
}

pub const DEFAULT_HEAP_LIMIT: u64 = 4 * GB;

/// Knobs of a [`Context`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct ContextConfig {
    /// Register a host heap on build.
    pub heap: bool,
    /// Heap budget in bytes.
    pub heap_limit: u64,
    /// Maximum number of live heap blocks.
    pub heap_max_allocations: u64,
    /// Byte alignment of heap blocks, `0` for none.
    pub heap_alignment: u8,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            heap: true,
            heap_limit: DEFAULT_HEAP_LIMIT,
            heap_max_allocations: u64::MAX,
            heap_alignment: 0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ContextBuilder {
    pub config: ContextConfig,
}

impl From<ContextConfig> for ContextBuilder {
    #[inline]
    fn from(config: ContextConfig) -> Self {
        Self { config }
    }
}

impl ContextBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heap_limit(mut self, bytes: u64) -> Self {
        self.config.heap_limit = bytes;
        self
    }

    pub fn heap_max_allocations(mut self, count: u64) -> Self {
        self.config.heap_max_allocations = count;
        self
    }

    pub fn heap_alignment(mut self, bytes: u8) -> Self {
        self.config.heap_alignment = bytes;
        self
    }

    pub fn without_heap(mut self) -> Self {
        self.config.heap = false;
        self
    }

    pub fn build(self) -> Context {
        let context = Context(Arc::new(ContextInner::default()));
        let config = self.config;

        if config.heap {
            let descriptor = MemoryDescriptor {
                alignment: config.heap_alignment,
                max_allocation_count: config.heap_max_allocations,
                ..Heap::descriptor(config.heap_limit)
            };
            let heap = Memory::new(&context, "heap", descriptor, Heap);
            context.0.heap.write().replace(heap.clone());
            if let Err(err) = DataFlowFactory::new(&context, &heap, &heap, HeapFlow) {
                log::error!("failed to register the heap flow factory: {err}");
            }
        }

        log::info!(
            "context created (heap: {})",
            match config.heap {
                true => DataSize(config.heap_limit).to_string(),
                false => "none".into(),
            }
        );
        context
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::{Context, ContextBuilder, ContextConfig, ContextError};
    use crate::loom::{
        error::{Error, ErrorKind},
        flow::{DataFlowFactory, FlowPosition},
        memory::{Heap, HeapFlow, KB, MB, Memory},
        task::{FnTask, Task},
    };

    #[test]
    fn test_build() {
        let context = ContextBuilder::new()
            .heap_limit(5 * MB)
            .heap_max_allocations(8)
            .build();
        let heap = context.heap().unwrap();
        assert_eq!(heap.descriptor().max_usage, 5 * MB);
        assert_eq!(heap.descriptor().max_allocation_count, 8);
        assert_eq!(context.memories().len(), 1);
        assert!(context.memory(heap.id()).is_some());
        assert!(context.flow_factory(heap.id(), heap.id()).is_some());

        let context = ContextBuilder::new().without_heap().build();
        assert!(context.heap().is_none());
        assert!(context.memories().is_empty());
    }

    #[test]
    fn test_factory_registration() {
        let context = Context::default();
        let heap = context.heap().unwrap();
        let err = DataFlowFactory::new(&context, &heap, &heap, HeapFlow).unwrap_err();
        assert!(matches!(err, ContextError::FactoryRegistered { .. }));
        assert_eq!(err.kind(), ErrorKind::AlreadyInitialized);
    }

    #[test]
    fn test_no_factory() {
        let context = ContextBuilder::new().heap_limit(KB).build();
        let other = Memory::new(&context, "scratch", Heap::descriptor(KB), Heap);
        assert_eq!(context.memories().len(), 2);

        let source = context.heap().unwrap().allocator().alloc(16).unwrap().unwrap();
        let destination = other.allocator().alloc(16).unwrap().unwrap();
        let sites = vec![FlowPosition::bytes(16, 0)];
        let err = context
            .initiate_flow(&source, &destination, sites.clone(), sites.clone())
            .unwrap_err();
        assert!(matches!(err, Error::Context(ContextError::NoFactory { .. })));

        DataFlowFactory::new(&context, &context.heap().unwrap(), &other, HeapFlow).unwrap();
        let flow = context
            .initiate_flow(&source, &destination, sites.clone(), sites)
            .unwrap();
        assert!(flow.start().is_successful());
    }

    #[test]
    fn test_task_registry() {
        let context = Context::default();
        let task = Arc::new(FnTask::new(context.generate_uuid(), "noop", || Ok(())));
        context.register_task(&task);

        let found = context.task(task.id()).unwrap();
        assert_eq!(found.name(), "noop");
        assert_eq!(context.live_tasks().len(), 1);

        drop(found);
        drop(task);
        assert!(context.live_tasks().is_empty());
    }

    #[test]
    fn test_independent_contexts() {
        let a = Context::default();
        let b = Context::default();
        let heap_a = a.heap().unwrap();
        let heap_b = b.heap().unwrap();
        assert_ne!(heap_a.id(), heap_b.id());
        assert!(a.flow_factory(heap_b.id(), heap_b.id()).is_none());
    }

    #[test]
    fn test_uuid_uniqueness() {
        let context = Context::default();
        let ids: HashSet<_> = (0..500_000).map(|_| context.generate_uuid()).collect();
        assert_eq!(ids.len(), 500_000);
    }

    #[test]
    fn test_config() {
        let config = ContextConfig {
            heap_limit: MB,
            ..Default::default()
        };
        let context = ContextBuilder::from(config).build();
        assert_eq!(context.heap().unwrap().allocator().max_usage(), MB);
    }
}
