//! Stress tests for the dispatch path

use std::sync::Arc;
use std::thread;
use tessera_rs::backend::HostBackend;
use tessera_rs::prelude::*;

fn increment() -> Arc<dyn CompiledKernel> {
    HostKernel::new("increment", &[1024], &[Access::ReadWrite], |inv| {
        let values: Vec<u32> = inv.read(0)?;
        let out: Vec<u32> = values.iter().map(|v| v + 1).collect();
        inv.write(0, &out)
    })
    .shared()
}

#[test]
#[ignore] // Run with --ignored flag
fn stress_test_many_executions() {
    let backend = HostBackend::new();
    let device = DeviceHandle::with_config(Arc::new(backend.clone()), &Config::default()).unwrap();
    let data = HostBuffer::zeroed::<u32>(1024);

    let mut graph = create_graph("loop");
    graph.task("t0", increment(), vec![(&data).into()]).unwrap();
    graph
        .transfer_to_device(TransferMode::FirstExecution, &[&data])
        .transfer_to_host(TransferMode::UserDefined, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device.clone());
    for _ in 0..5_000 {
        plan.execute().unwrap();
    }
    plan.transfer_to_host(&[&data]).unwrap();

    assert_eq!(data.to_vec::<u32>(), vec![5_000; 1024]);
    assert_eq!(backend.stats().kernels_created, 1);
    assert_eq!(device.event_pool().in_use(), 0);
}

#[test]
#[ignore]
fn stress_test_long_chain() {
    let backend = HostBackend::new();
    let device = DeviceHandle::with_config(Arc::new(backend), &Config::default()).unwrap();
    let data = HostBuffer::zeroed::<u32>(1024);

    let mut graph = create_graph("chain");
    for i in 0..200 {
        graph.task(format!("t{}", i), increment(), vec![(&data).into()]).unwrap();
    }
    graph
        .transfer_to_device(TransferMode::EveryExecution, &[&data])
        .transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device);
    let result = plan.execute().unwrap();

    assert_eq!(data.to_vec::<u32>(), vec![200; 1024]);
    assert_eq!(result.dependencies("t199").unwrap().len(), 199);
}

#[test]
#[ignore]
fn stress_test_independent_devices() {
    let handles: Vec<_> = (0..8)
        .map(|worker| {
            thread::spawn(move || {
                let device = DeviceHandle::host().unwrap();
                let data = HostBuffer::from_slice(&vec![worker as u32; 1024]);

                let mut graph = create_graph(format!("worker{}", worker));
                graph.task("t0", increment(), vec![(&data).into()]).unwrap();
                graph
                    .transfer_to_device(TransferMode::EveryExecution, &[&data])
                    .transfer_to_host(TransferMode::EveryExecution, &[&data]);

                let mut plan = graph.snapshot().unwrap();
                plan.bind_device(device);
                for _ in 0..500 {
                    plan.execute().unwrap();
                }
                data.to_vec::<u32>()
            })
        })
        .collect();

    for (worker, handle) in handles.into_iter().enumerate() {
        let values = handle.join().unwrap();
        assert!(values.iter().all(|v| *v == worker as u32 + 500));
    }
}

#[test]
#[ignore]
fn stress_test_shared_device_across_threads() {
    let device = DeviceHandle::host().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let device = device.clone();
            thread::spawn(move || {
                let data = HostBuffer::zeroed::<u32>(1024);
                let mut graph = create_graph(format!("shared{}", worker));
                graph.task("t0", increment(), vec![(&data).into()]).unwrap();
                graph.transfer_to_host(TransferMode::EveryExecution, &[&data]);

                let mut plan = graph.snapshot().unwrap();
                plan.bind_device(device);
                for _ in 0..250 {
                    plan.execute().unwrap();
                }
                data.to_vec::<u32>()
            })
        })
        .collect();

    for handle in handles {
        let values = handle.join().unwrap();
        assert!(values.iter().all(|v| *v == 250));
    }
    assert_eq!(device.event_pool().in_use(), 0);
}
