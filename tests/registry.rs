//! Integration coverage for the resource registry through `Kernel` (spec.md
//! §4.7).

use std::time::Duration;

use semian::{Capacity, Kernel, Name, ResourceConfig};

fn unique_name(salt: &str) -> Name {
    Name::new(format!("it_registry_{}_{}", std::process::id(), salt)).unwrap()
}

fn config() -> ResourceConfig {
    ResourceConfig {
        capacity: Capacity::Tickets(1),
        registry_max_size: 2,
        registry_min_age: Duration::from_millis(0),
        ..ResourceConfig::default()
    }
}

#[test]
fn kernel_registers_and_evicts_over_capacity() {
    let kernel = Kernel::new(2, Duration::from_millis(0));

    let names: Vec<Name> = (0..3).map(|i| unique_name(&format!("r{i}"))).collect();
    let mut resources = Vec::new();
    for name in &names {
        resources.push(kernel.register(name.clone(), config()).unwrap());
    }

    assert_eq!(kernel.registry().len(), 2);
    assert!(kernel.registry().get(&names[0]).is_none());
    assert!(kernel.registry().get(&names[2]).is_some());

    for r in resources {
        r.destroy().unwrap();
    }
}

#[test]
fn repeated_registration_is_idempotent() {
    let kernel = Kernel::new(8, Duration::from_secs(60));
    let name = unique_name("idempotent");

    let a = kernel.register(name.clone(), config()).unwrap();
    let b = kernel.register(name.clone(), config()).unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));

    a.destroy().unwrap();
}
