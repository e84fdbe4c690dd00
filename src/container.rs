// Dependency injection container
//
// Type-keyed registry with three lifetimes: eager singleton, lazy singleton,
// and factory. The registration map is written during boot (and by the
// explicit override/unregister/clear operations); request-time traffic only
// reads it.

use crate::Error;
use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace, warn};

type Instance = Arc<dyn Any + Send + Sync>;
type FactoryFn = Arc<dyn Fn(&Container) -> Result<Instance, Error> + Send + Sync>;
type DisposeFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

enum Lifetime {
    Eager,
    Lazy(FactoryFn),
    Factory(FactoryFn),
}

struct Registration {
    lifetime: Lifetime,
    type_name: &'static str,
    dispose: Option<DisposeFn>,
}

struct Inner {
    registrations: RwLock<HashMap<TypeId, Registration>>,
    instances: RwLock<HashMap<TypeId, Instance>>,
    // Instantiation order; disposers run in reverse.
    order: RwLock<Vec<TypeId>>,
    parent: Option<Container>,
}

// The cycle detector's stack. Thread-local and keyed by container identity so
// parallel resolutions on one container never observe each other's frames.
// Factory invocation is synchronous, so a resolution chain stays on one
// thread from start to finish.
thread_local! {
    static RESOLVE_STACK: RefCell<Vec<(usize, TypeId, &'static str)>> =
        const { RefCell::new(Vec::new()) };
}

struct StackFrame;

impl StackFrame {
    fn push(container_id: usize, type_id: TypeId, name: &'static str) -> Self {
        RESOLVE_STACK.with(|stack| stack.borrow_mut().push((container_id, type_id, name)));
        StackFrame
    }
}

impl Drop for StackFrame {
    // Pops even when a factory fails.
    fn drop(&mut self) {
        RESOLVE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// The dependency injection container.
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

impl Container {
    pub fn new() -> Self {
        debug!("Creating new DI container");
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Container>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registrations: RwLock::new(HashMap::new()),
                instances: RwLock::new(HashMap::new()),
                order: RwLock::new(Vec::new()),
                parent,
            }),
        }
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Register a pre-built singleton. Returned by reference on every `get`.
    pub fn register_singleton<T: Any + Send + Sync>(&self, value: T) -> Result<(), Error> {
        self.insert_eager(value, None)
    }

    /// Register a pre-built singleton with a disposer invoked on
    /// [`Container::dispose`].
    pub fn register_singleton_with<T, D>(&self, value: T, dispose: D) -> Result<(), Error>
    where
        T: Any + Send + Sync,
        D: Fn(&T) + Send + Sync + 'static,
    {
        self.insert_eager(value, Some(erase_disposer(dispose)))
    }

    /// Register a lazy singleton: the factory runs at most once, on first
    /// `get`, and the result is cached.
    pub fn register_lazy_singleton<T, F>(&self, factory: F) -> Result<(), Error>
    where
        T: Any + Send + Sync,
        F: Fn(&Container) -> Result<T, Error> + Send + Sync + 'static,
    {
        self.insert_registration::<T>(Lifetime::Lazy(erase_factory(factory)), None)
    }

    /// Lazy singleton with a disposer.
    pub fn register_lazy_singleton_with<T, F, D>(&self, factory: F, dispose: D) -> Result<(), Error>
    where
        T: Any + Send + Sync,
        F: Fn(&Container) -> Result<T, Error> + Send + Sync + 'static,
        D: Fn(&T) + Send + Sync + 'static,
    {
        self.insert_registration::<T>(
            Lifetime::Lazy(erase_factory(factory)),
            Some(erase_disposer(dispose)),
        )
    }

    /// Register a factory: invoked on every `get`, nothing cached.
    pub fn register_factory<T, F>(&self, factory: F) -> Result<(), Error>
    where
        T: Any + Send + Sync,
        F: Fn(&Container) -> Result<T, Error> + Send + Sync + 'static,
    {
        self.insert_registration::<T>(Lifetime::Factory(erase_factory(factory)), None)
    }

    /// Replace any registration for `T` with a pre-built singleton. The only
    /// sanctioned re-registration; the prior constructed instance (if one
    /// exists) is disposed first. Works against unconstructed lazy
    /// registrations too.
    pub fn override_singleton<T: Any + Send + Sync>(&self, value: T) {
        let type_id = TypeId::of::<T>();
        let name = type_name::<T>();

        let prior = self.inner.instances.write().unwrap().remove(&type_id);
        if let Some(prior) = prior {
            let dispose = {
                let regs = self.inner.registrations.read().unwrap();
                regs.get(&type_id).and_then(|r| r.dispose.clone())
            };
            if let Some(dispose) = dispose {
                run_disposer(&dispose, &prior, name);
            }
        }

        self.inner.registrations.write().unwrap().insert(
            type_id,
            Registration {
                lifetime: Lifetime::Eager,
                type_name: name,
                dispose: None,
            },
        );
        self.inner.instances.write().unwrap().insert(type_id, Arc::new(value));
        let mut order = self.inner.order.write().unwrap();
        if !order.contains(&type_id) {
            order.push(type_id);
        }
        debug!(provider = name, "Registration overridden");
    }

    /// Remove the registration for `T`, disposing its constructed instance
    /// if one exists.
    pub fn unregister<T: Any + Send + Sync>(&self) {
        let type_id = TypeId::of::<T>();
        let instance = self.inner.instances.write().unwrap().remove(&type_id);
        let registration = self.inner.registrations.write().unwrap().remove(&type_id);
        if let (Some(instance), Some(reg)) = (instance, registration) {
            if let Some(dispose) = &reg.dispose {
                run_disposer(dispose, &instance, reg.type_name);
            }
        }
        self.inner.order.write().unwrap().retain(|id| *id != type_id);
    }

    /// Drop all registrations and cached instances without running disposers.
    pub fn clear(&self) {
        let count = {
            let mut regs = self.inner.registrations.write().unwrap();
            let count = regs.len();
            regs.clear();
            count
        };
        self.inner.instances.write().unwrap().clear();
        self.inner.order.write().unwrap().clear();
        debug!(provider_count = count, "Cleared all registrations from container");
    }

    /// Resolve `T`. Reads through to the parent when `T` is not registered
    /// locally; fails with [`Error::NotRegistered`] when absent everywhere
    /// and with [`Error::CircularDependency`] when `T` is already being
    /// resolved on this container.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, Error> {
        let type_id = TypeId::of::<T>();
        let name = type_name::<T>();
        trace!(provider = name, "Resolving provider");

        enum Resolved {
            Eager,
            Lazy(FactoryFn),
            Factory(FactoryFn),
        }

        let resolved = {
            let regs = self.inner.registrations.read().unwrap();
            regs.get(&type_id).map(|reg| match &reg.lifetime {
                Lifetime::Eager => Resolved::Eager,
                Lifetime::Lazy(f) => Resolved::Lazy(f.clone()),
                Lifetime::Factory(f) => Resolved::Factory(f.clone()),
            })
        };

        let Some(resolved) = resolved else {
            if let Some(parent) = &self.inner.parent {
                return parent.get::<T>();
            }
            return Err(Error::NotRegistered(name.to_string()));
        };

        let container_id = self.id();
        let cycle = RESOLVE_STACK.with(|stack| {
            let stack = stack.borrow();
            stack
                .iter()
                .position(|(id, tid, _)| *id == container_id && *tid == type_id)
                .map(|first| {
                    let mut chain: Vec<String> =
                        stack[first..].iter().map(|(_, _, n)| n.to_string()).collect();
                    chain.push(name.to_string());
                    chain
                })
        });
        if let Some(chain) = cycle {
            return Err(Error::CircularDependency { chain });
        }

        match resolved {
            Resolved::Eager => {
                let instances = self.inner.instances.read().unwrap();
                instances
                    .get(&type_id)
                    .cloned()
                    .ok_or_else(|| Error::NotRegistered(name.to_string()))
                    .and_then(|i| downcast::<T>(i, name))
            }
            Resolved::Lazy(factory) => {
                if let Some(cached) = self.inner.instances.read().unwrap().get(&type_id).cloned() {
                    return downcast::<T>(cached, name);
                }
                let built = {
                    let _frame = StackFrame::push(container_id, type_id, name);
                    factory(self)?
                };
                // First cached instance wins under a racing first resolution.
                let instance = {
                    let mut instances = self.inner.instances.write().unwrap();
                    match instances.entry(type_id) {
                        std::collections::hash_map::Entry::Occupied(entry) => entry.get().clone(),
                        std::collections::hash_map::Entry::Vacant(entry) => {
                            entry.insert(built.clone());
                            self.inner.order.write().unwrap().push(type_id);
                            built
                        }
                    }
                };
                debug!(provider = name, "Lazy singleton constructed");
                downcast::<T>(instance, name)
            }
            Resolved::Factory(factory) => {
                let built = {
                    let _frame = StackFrame::push(container_id, type_id, name);
                    factory(self)?
                };
                downcast::<T>(built, name)
            }
        }
    }

    /// Check whether `T` is registered here or on an ancestor.
    pub fn has<T: Any + Send + Sync>(&self) -> bool {
        self.has_id(TypeId::of::<T>())
    }

    /// `has` by raw type id (module export assertions).
    pub fn has_id(&self, type_id: TypeId) -> bool {
        if self.inner.registrations.read().unwrap().contains_key(&type_id) {
            return true;
        }
        self.inner.parent.as_ref().is_some_and(|p| p.has_id(type_id))
    }

    /// Create an empty child container that reads through to this one.
    /// Local registrations shadow the parent; the parent is never modified
    /// by the child.
    pub fn create_child(&self) -> Container {
        Container::with_parent(Some(self.clone()))
    }

    /// Run every registered disposer over the cached singletons, in reverse
    /// instantiation order. Each disposer runs at most once; a panicking
    /// disposer is logged and does not abort the rest.
    pub fn dispose(&self) {
        let order: Vec<TypeId> = {
            let mut order = self.inner.order.write().unwrap();
            std::mem::take(&mut *order)
        };
        for type_id in order.into_iter().rev() {
            let instance = self.inner.instances.write().unwrap().remove(&type_id);
            let Some(instance) = instance else { continue };
            let entry = {
                let regs = self.inner.registrations.read().unwrap();
                regs.get(&type_id).map(|r| (r.type_name, r.dispose.clone()))
            };
            if let Some((name, Some(dispose))) = entry {
                run_disposer(&dispose, &instance, name);
            }
        }
    }

    fn insert_eager<T: Any + Send + Sync>(
        &self,
        value: T,
        dispose: Option<DisposeFn>,
    ) -> Result<(), Error> {
        let type_id = TypeId::of::<T>();
        self.insert_registration::<T>(Lifetime::Eager, dispose)?;
        self.inner.instances.write().unwrap().insert(type_id, Arc::new(value));
        self.inner.order.write().unwrap().push(type_id);
        Ok(())
    }

    fn insert_registration<T: Any + Send + Sync>(
        &self,
        lifetime: Lifetime,
        dispose: Option<DisposeFn>,
    ) -> Result<(), Error> {
        let type_id = TypeId::of::<T>();
        let name = type_name::<T>();
        let mut regs = self.inner.registrations.write().unwrap();
        if regs.contains_key(&type_id) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        regs.insert(
            type_id,
            Registration {
                lifetime,
                type_name: name,
                dispose,
            },
        );
        debug!(provider = name, "Provider registered in DI container");
        Ok(())
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

fn erase_factory<T, F>(factory: F) -> FactoryFn
where
    T: Any + Send + Sync,
    F: Fn(&Container) -> Result<T, Error> + Send + Sync + 'static,
{
    Arc::new(move |container| factory(container).map(|value| Arc::new(value) as Instance))
}

fn erase_disposer<T, D>(dispose: D) -> DisposeFn
where
    T: Any + Send + Sync,
    D: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(move |any| {
        if let Some(value) = any.downcast_ref::<T>() {
            dispose(value);
        }
    })
}

fn run_disposer(dispose: &DisposeFn, instance: &Instance, name: &'static str) {
    let outcome = catch_unwind(AssertUnwindSafe(|| dispose(&**instance)));
    if outcome.is_err() {
        warn!(provider = name, "Disposer panicked; continuing shutdown");
    }
}

fn downcast<T: Any + Send + Sync>(instance: Instance, name: &'static str) -> Result<Arc<T>, Error> {
    instance
        .downcast::<T>()
        .map_err(|_| Error::Internal(format!("cached instance has wrong type for {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Greeter {
        greeting: String,
    }

    struct Counter {
        value: AtomicUsize,
    }

    #[test]
    fn eager_singleton_resolves_same_instance() {
        let container = Container::new();
        container
            .register_singleton(Greeter { greeting: "hi".to_string() })
            .unwrap();
        let a = container.get::<Greeter>().unwrap();
        let b = container.get::<Greeter>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.greeting, "hi");
    }

    #[test]
    fn lazy_singleton_builds_once() {
        let container = Container::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_factory = calls.clone();
        container
            .register_lazy_singleton(move |_| {
                calls_in_factory.fetch_add(1, Ordering::SeqCst);
                Ok(Counter { value: AtomicUsize::new(0) })
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let a = container.get::<Counter>().unwrap();
        let b = container.get::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn factory_builds_fresh_instances() {
        let container = Container::new();
        container
            .register_factory(|_| Ok(Counter { value: AtomicUsize::new(0) }))
            .unwrap();
        let a = container.get::<Counter>().unwrap();
        let b = container.get::<Counter>().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn duplicate_registration_fails() {
        let container = Container::new();
        container.register_singleton(1u32).unwrap();
        let err = container.register_singleton(2u32).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
    }

    #[test]
    fn missing_registration_fails() {
        let container = Container::new();
        let err = container.get::<Greeter>().unwrap_err();
        assert!(matches!(err, Error::NotRegistered(_)));
    }

    #[test]
    fn resolution_stack_pops_after_factory_failure() {
        let container = Container::new();
        container
            .register_factory::<Greeter, _>(|_| Err(Error::Internal("boom".to_string())))
            .unwrap();
        assert!(container.get::<Greeter>().is_err());
        // A failed resolution must not leave a frame behind that would fake
        // a cycle on the retry.
        assert!(matches!(
            container.get::<Greeter>().unwrap_err(),
            Error::Internal(_)
        ));
    }

    #[test]
    fn dispose_runs_disposers_in_reverse_instantiation_order() {
        let container = Container::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log_a = log.clone();
        let log_b = log.clone();
        container
            .register_singleton_with(Greeter { greeting: "a".to_string() }, move |_| {
                log_a.lock().unwrap().push("a");
            })
            .unwrap();
        container
            .register_singleton_with(Counter { value: AtomicUsize::new(0) }, move |_| {
                log_b.lock().unwrap().push("b");
            })
            .unwrap();
        container.dispose();
        assert_eq!(*log.lock().unwrap(), vec!["b", "a"]);
        container.dispose();
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn panicking_disposer_does_not_abort_disposal() {
        let container = Container::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log_ok = log.clone();
        container
            .register_singleton_with(Counter { value: AtomicUsize::new(0) }, |_| {
                panic!("disposer failure");
            })
            .unwrap();
        container
            .register_singleton_with(Greeter { greeting: "x".to_string() }, move |_| {
                log_ok.lock().unwrap().push("greeter");
            })
            .unwrap();
        container.dispose();
        assert_eq!(*log.lock().unwrap(), vec!["greeter"]);
    }
}
