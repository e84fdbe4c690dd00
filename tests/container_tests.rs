// DI container: lifetimes, cycle detection, children, override, disposal.

use gantry::{Container, Error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Database {
    url: String,
}

struct Repository {
    db: Arc<Database>,
}

struct Service {
    repo: Arc<Repository>,
}

// Mutually recursive pair for the cycle scenario.
#[derive(Debug)]
struct Alpha;
#[derive(Debug)]
struct Beta;

#[test]
fn singleton_resolutions_share_one_reference() {
    let container = Container::new();
    container
        .register_singleton(Database { url: "postgres://localhost".to_string() })
        .unwrap();

    let a = container.get::<Database>().unwrap();
    let b = container.get::<Database>().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.url, "postgres://localhost");
}

#[test]
fn lazy_singleton_resolutions_share_one_reference() {
    let container = Container::new();
    container
        .register_lazy_singleton(|_| Ok(Database { url: "sqlite://file".to_string() }))
        .unwrap();

    let a = container.get::<Database>().unwrap();
    let b = container.get::<Database>().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn factory_resolutions_are_fresh() {
    let container = Container::new();
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    container
        .register_factory(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Database { url: "mem://".to_string() })
        })
        .unwrap();

    let a = container.get::<Database>().unwrap();
    let b = container.get::<Database>().unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[test]
fn dag_of_lazy_dependencies_resolves() {
    let container = Container::new();
    container
        .register_lazy_singleton(|_| Ok(Database { url: "postgres://prod".to_string() }))
        .unwrap();
    container
        .register_lazy_singleton(|c| Ok(Repository { db: c.get::<Database>()? }))
        .unwrap();
    container
        .register_lazy_singleton(|c| Ok(Service { repo: c.get::<Repository>()? }))
        .unwrap();

    let service = container.get::<Service>().unwrap();
    assert_eq!(service.repo.db.url, "postgres://prod");
}

#[test]
fn scenario_e_cycle_reports_full_chain() {
    let container = Container::new();
    container
        .register_lazy_singleton(|c| {
            c.get::<Beta>()?;
            Ok(Alpha)
        })
        .unwrap();
    container
        .register_lazy_singleton(|c| {
            c.get::<Alpha>()?;
            Ok(Beta)
        })
        .unwrap();

    let err = container.get::<Alpha>().unwrap_err();
    let Error::CircularDependency { chain } = err else {
        panic!("expected CircularDependency, got {:?}", err);
    };
    assert!(chain.iter().any(|n| n.contains("Alpha")));
    assert!(chain.iter().any(|n| n.contains("Beta")));
    assert_eq!(chain.first(), chain.last());
}

#[test]
fn cycle_failure_leaves_container_usable() {
    let container = Container::new();
    container
        .register_lazy_singleton(|c| {
            c.get::<Alpha>()?;
            Ok(Alpha)
        })
        .unwrap();
    assert!(matches!(
        container.get::<Alpha>().unwrap_err(),
        Error::CircularDependency { .. }
    ));
    // The resolution stack unwound; an unrelated registration still works.
    container.register_singleton(42u64).unwrap();
    assert_eq!(*container.get::<u64>().unwrap(), 42);
}

#[test]
fn override_replaces_instance_and_disposes_prior() {
    let container = Container::new();
    let disposed = Arc::new(AtomicUsize::new(0));
    let counter = disposed.clone();
    container
        .register_singleton_with(Database { url: "old".to_string() }, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    container.override_singleton(Database { url: "new".to_string() });
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(container.get::<Database>().unwrap().url, "new");
}

#[test]
fn override_replaces_an_unconstructed_lazy_registration() {
    let container = Container::new();
    container
        .register_lazy_singleton(|_| -> Result<Database, Error> {
            panic!("factory must never run once overridden");
        })
        .unwrap();

    container.override_singleton(Database { url: "forced".to_string() });
    assert_eq!(container.get::<Database>().unwrap().url, "forced");
}

#[test]
fn child_reads_through_to_parent_and_shadows_locally() {
    let parent = Container::new();
    parent
        .register_singleton(Database { url: "parent".to_string() })
        .unwrap();

    let child = parent.create_child();
    assert_eq!(child.get::<Database>().unwrap().url, "parent");

    child
        .register_singleton(Database { url: "child".to_string() })
        .unwrap();
    assert_eq!(child.get::<Database>().unwrap().url, "child");
    // The parent is untouched.
    assert_eq!(parent.get::<Database>().unwrap().url, "parent");
}

#[test]
fn child_local_registration_does_not_leak_to_parent() {
    let parent = Container::new();
    let child = parent.create_child();
    child.register_singleton(7i64).unwrap();
    assert!(child.has::<i64>());
    assert!(matches!(parent.get::<i64>().unwrap_err(), Error::NotRegistered(_)));
}

#[test]
fn unregister_removes_and_disposes() {
    let container = Container::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let disposer_log = log.clone();
    container
        .register_singleton_with(Database { url: "gone".to_string() }, move |db| {
            disposer_log.lock().unwrap().push(db.url.clone());
        })
        .unwrap();

    container.unregister::<Database>();
    assert_eq!(*log.lock().unwrap(), vec!["gone".to_string()]);
    assert!(!container.has::<Database>());
    // The slot is free again.
    container
        .register_singleton(Database { url: "again".to_string() })
        .unwrap();
}

#[test]
fn lazy_disposer_runs_only_when_constructed() {
    let container = Container::new();
    let disposed = Arc::new(AtomicUsize::new(0));

    let counter = disposed.clone();
    container
        .register_lazy_singleton_with(
            |_| Ok(Database { url: "built".to_string() }),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    // Never resolved: nothing to dispose.
    container.dispose();
    assert_eq!(disposed.load(Ordering::SeqCst), 0);

    let container = Container::new();
    let counter = disposed.clone();
    container
        .register_lazy_singleton_with(
            |_| Ok(Database { url: "built".to_string() }),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    container.get::<Database>().unwrap();
    container.dispose();
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[test]
fn clear_empties_the_container() {
    let container = Container::new();
    container.register_singleton(1u8).unwrap();
    container.register_factory(|_| Ok(2u16)).unwrap();
    container.clear();
    assert!(!container.has::<u8>());
    assert!(!container.has::<u16>());
}
