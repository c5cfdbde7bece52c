use std::io::Write;
use std::sync::Arc;
use tessera_rs::backend::host::calls;
use tessera_rs::backend::{codes, HostBackend};
use tessera_rs::event::DEFAULT_TAG;
use tessera_rs::prelude::*;

fn device_on(backend: &HostBackend) -> DeviceHandle {
    DeviceHandle::with_config(Arc::new(backend.clone()), &Config::default()).unwrap()
}

// Writes `value` into the half of a 16-element buffer selected by `half`.
fn fill_half(name: &str) -> Arc<dyn CompiledKernel> {
    HostKernel::new(name, &[8], &[Access::Write, Access::Read, Access::Read], |inv| {
        let half = inv.scalar(1)?.as_i64() as usize;
        let value = inv.scalar(2)?.as_f64() as f32;
        inv.write_at(0, half * 8, &[value; 8])
    })
    .shared()
}

fn add_one() -> Arc<dyn CompiledKernel> {
    HostKernel::new("add_one", &[16], &[Access::ReadWrite], |inv| {
        let values: Vec<f32> = inv.read(0)?;
        let out: Vec<f32> = values.iter().map(|v| v + 1.0).collect();
        inv.write(0, &out)
    })
    .shared()
}

#[test]
fn test_shared_buffer_creates_dependency() {
    let backend = HostBackend::new();
    let out = HostBuffer::zeroed::<f32>(16);

    let mut graph = create_graph("regions");
    graph
        .task(
            "low",
            fill_half("fill_low"),
            vec![(&out).into(), Scalar::I32(0).into(), Scalar::F32(1.0).into()],
        )
        .unwrap();
    graph
        .task(
            "high",
            fill_half("fill_high"),
            vec![(&out).into(), Scalar::I32(1).into(), Scalar::F32(2.0).into()],
        )
        .unwrap();
    graph.transfer_to_host(TransferMode::EveryExecution, &[&out]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));
    let result = plan.execute().unwrap();

    let mut expected = vec![1.0f32; 8];
    expected.extend(vec![2.0f32; 8]);
    assert_eq!(out.to_vec::<f32>(), expected);

    assert_eq!(result.dependencies("high").unwrap(), &["low".to_string()][..]);
    let stats = backend.stats();
    let low = stats.launches_of("fill_low").next().unwrap();
    let high = stats.launches_of("fill_high").next().unwrap();
    // the producer, then the task's own frame write
    assert_eq!(high.wait_list.len(), 2);
    assert_eq!(high.wait_list[0], low.event);
}

#[test]
fn test_disjoint_buffers_have_no_dependency() {
    let backend = HostBackend::new();
    let a = HostBuffer::zeroed::<f32>(16);
    let b = HostBuffer::zeroed::<f32>(16);

    let mut graph = create_graph("disjoint");
    graph
        .task(
            "low",
            fill_half("fill_low"),
            vec![(&a).into(), Scalar::I32(0).into(), Scalar::F32(1.0).into()],
        )
        .unwrap();
    graph
        .task(
            "high",
            fill_half("fill_high"),
            vec![(&b).into(), Scalar::I32(1).into(), Scalar::F32(2.0).into()],
        )
        .unwrap();
    graph.transfer_to_host(TransferMode::EveryExecution, &[&a, &b]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));
    let result = plan.execute().unwrap();

    assert!(result.dependencies("high").unwrap().is_empty());
    let stats = backend.stats();
    let low = stats.launches_of("fill_low").next().unwrap();
    let high = stats.launches_of("fill_high").next().unwrap();
    // only the frame write
    assert_eq!(high.wait_list.len(), 1);
    assert!(!high.wait_list.contains(&low.event));
}

#[test]
fn test_first_execution_copies_once() {
    let backend = HostBackend::new();
    let device = device_on(&backend);
    let data = HostBuffer::from_slice(&[0.0f32; 16]);

    let mut graph = create_graph("once");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph
        .transfer_to_device(TransferMode::FirstExecution, &[&data])
        .transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device.clone());
    for _ in 0..3 {
        plan.execute().unwrap();
    }

    let buffer = device.device_buffer(data.id()).unwrap();
    let stats = backend.stats();
    assert_eq!(stats.writes_to(buffer), 1);
    assert_eq!(stats.reads, 3);
    assert_eq!(plan.execution_count(), 3);
    // the device copy accumulates since the host copy is never re-sent
    assert_eq!(data.to_vec::<f32>(), vec![3.0; 16]);
}

#[test]
fn test_every_execution_copies_each_time() {
    let backend = HostBackend::new();
    let device = device_on(&backend);
    let data = HostBuffer::from_slice(&[0.0f32; 16]);

    let mut graph = create_graph("every");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph
        .transfer_to_device(TransferMode::EveryExecution, &[&data])
        .transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device.clone());
    for _ in 0..3 {
        let result = plan.execute().unwrap();
        assert_eq!(result.profiler().bytes_to_device, 64);
        assert_eq!(result.profiler().bytes_to_host, 64);
    }

    let buffer = device.device_buffer(data.id()).unwrap();
    assert_eq!(backend.stats().writes_to(buffer), 3);
    // host values go up every round since each copy carries the last result
    assert_eq!(data.to_vec::<f32>(), vec![3.0; 16]);
}

#[test]
fn test_user_defined_transfers_wait_for_request() {
    let backend = HostBackend::new();
    let data = HostBuffer::from_slice(&[1.0f32; 16]);

    let mut graph = create_graph("manual");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph
        .transfer_to_device(TransferMode::FirstExecution, &[&data])
        .transfer_to_host(TransferMode::UserDefined, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));
    let result = plan.execute().unwrap();

    assert_eq!(result.profiler().bytes_to_host, 0);
    assert_eq!(data.to_vec::<f32>(), vec![1.0; 16]);

    plan.transfer_to_host(&[&data]).unwrap();
    assert_eq!(data.to_vec::<f32>(), vec![2.0; 16]);
}

#[test]
fn test_kernel_failure_is_fatal() {
    let backend = HostBackend::new();
    let data = HostBuffer::from_slice(&[5.0f32; 16]);

    let mut graph = create_graph("failing");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph
        .transfer_to_device(TransferMode::EveryExecution, &[&data])
        .transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));

    backend.fail_next_kernel(codes::OUT_OF_RESOURCES);
    let err = plan.execute().unwrap_err();
    match err {
        Error::EventStatus {
            descriptor,
            tag,
            status,
        } => {
            assert_eq!(descriptor, EventDescriptor::ParallelKernel);
            assert!(tag >= DEFAULT_TAG);
            assert_eq!(status, codes::OUT_OF_RESOURCES);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.stats().reads, 0);
    assert_eq!(data.to_vec::<f32>(), vec![5.0; 16]);

    // the plan stays usable once the device recovers
    plan.execute().unwrap();
    assert_eq!(data.to_vec::<f32>(), vec![6.0; 16]);
}

#[test]
fn test_kernel_body_error_reports_host_failure() {
    let backend = HostBackend::new();
    let data = HostBuffer::zeroed::<f32>(4);
    let broken = HostKernel::new("broken", &[4], &[Access::Write], |_| {
        Err("device fault".to_string())
    })
    .shared();

    let mut graph = create_graph("broken");
    graph.task("t0", broken, vec![(&data).into()]).unwrap();
    graph.transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));
    let err = plan.execute().unwrap_err();
    assert!(matches!(
        err,
        Error::EventStatus {
            status: codes::HOST_KERNEL_FAILED,
            ..
        }
    ));
    assert!(err.to_string().contains("kernel - parallel"));
}

#[test]
fn test_binding_failure_names_argument() {
    let backend = HostBackend::new();
    let data = HostBuffer::zeroed::<f32>(16);

    let mut graph = create_graph("binding");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph.transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));

    backend.fail_call(calls::SET_ARGUMENT, codes::INVALID_ARG_INDEX);
    let err = plan.execute().unwrap_err();
    assert!(matches!(
        err,
        Error::ArgumentBinding {
            index: 0,
            code: codes::INVALID_ARG_INDEX,
            ..
        }
    ));
    assert!(backend.stats().launches.is_empty());
}

#[test]
fn test_launch_failure_is_reported() {
    let backend = HostBackend::new();
    let data = HostBuffer::zeroed::<f32>(16);

    let mut graph = create_graph("launch");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph.transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));

    backend.fail_call(calls::LAUNCH_KERNEL, codes::OUT_OF_RESOURCES);
    let err = plan.execute().unwrap_err();
    assert_eq!(
        err.native_code(),
        Some((calls::LAUNCH_KERNEL, codes::OUT_OF_RESOURCES))
    );
}

#[test]
fn test_prebuilt_kernel_from_file() {
    let backend = HostBackend::new();
    backend.register_kernel("scale", |inv| {
        let factor = inv.scalar(1)?.as_f64() as f32;
        let values: Vec<f32> = inv.read(0)?;
        let out: Vec<f32> = values.iter().map(|v| v * factor).collect();
        inv.write(0, &out)
    });

    let mut file = tempfile::Builder::new().suffix(".spv").tempfile().unwrap();
    let mut module = 0x0723_0203u32.to_le_bytes().to_vec();
    module.extend_from_slice(&[0u8; 16]);
    file.write_all(&module).unwrap();
    file.flush().unwrap();

    let data = HostBuffer::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    let mut graph = create_graph("prebuilt");
    graph
        .prebuilt_task(
            "t0",
            "scale",
            file.path(),
            vec![(&data).into(), Scalar::F32(10.0).into()],
            &[Access::ReadWrite, Access::Read],
            &[8],
        )
        .unwrap();
    graph
        .transfer_to_device(TransferMode::FirstExecution, &[&data])
        .transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));
    plan.execute().unwrap();

    assert_eq!(
        data.to_vec::<f32>(),
        vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0]
    );
}

#[test]
fn test_unregistered_binary_fails_to_load() {
    let backend = HostBackend::new();
    let mut file = tempfile::Builder::new().suffix(".ptx").tempfile().unwrap();
    file.write_all(b".version 7.0\n").unwrap();
    file.flush().unwrap();

    let data = HostBuffer::zeroed::<f32>(8);
    let mut graph = create_graph("missing");
    graph
        .prebuilt_task("t0", "nowhere", file.path(), vec![(&data).into()], &[Access::Write], &[8])
        .unwrap();
    graph.transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));
    let err = plan.execute().unwrap_err();
    assert_eq!(
        err.native_code(),
        Some((calls::KERNEL_CREATE, codes::INVALID_PROGRAM_EXECUTABLE))
    );
}

#[test]
fn test_invalid_worker_grid_falls_back() {
    let backend = HostBackend::new();
    let device = device_on(&backend);
    let data = HostBuffer::zeroed::<f32>(16);

    let mut graph = create_graph("grid");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph.transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut grid = WorkGrid::d1(64);
    grid.set_local_work(48, 1, 1);
    let scheduler = GridScheduler::new().with("grid.t0", grid);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device.clone());
    plan.with_grid_scheduler(&scheduler).unwrap();
    let result = plan.execute().unwrap();

    let launch = &backend.stats().launches[0];
    assert_eq!(launch.global, [64, 1, 1]);
    assert_eq!(64 % launch.local[0], 0);
    assert!(launch.local[0] <= 1024);
    assert_eq!(result.geometry("t0").unwrap().global_work, [64, 1, 1]);

    #[cfg(feature = "telemetry")]
    assert_eq!(device.metrics().unwrap().snapshot().grid_fallbacks, 1);
}

#[test]
fn test_valid_worker_grid_is_kept() {
    let backend = HostBackend::new();
    let data = HostBuffer::zeroed::<f32>(16);

    let mut graph = create_graph("grid");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph.transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut grid = WorkGrid::d1(16);
    grid.set_local_work(4, 1, 1);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));
    plan.with_worker_grid("t0", grid).unwrap();
    plan.execute().unwrap();

    let launch = &backend.stats().launches[0];
    assert_eq!(launch.local, [4, 1, 1]);
    assert_eq!(launch.groups, [4, 1, 1]);
}

#[test]
fn test_batch_threads_override_domain() {
    let backend = HostBackend::new();
    let data = HostBuffer::zeroed::<f32>(16);

    let mut graph = create_graph("batch");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph.transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device_on(&backend));
    plan.with_batch_threads(128);
    plan.execute().unwrap();

    assert_eq!(backend.stats().launches[0].global, [128, 1, 1]);
}

#[test]
fn test_events_return_to_pool() {
    let backend = HostBackend::new();
    let device = device_on(&backend);
    let data = HostBuffer::zeroed::<f32>(16);

    let mut graph = create_graph("pool");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph
        .transfer_to_device(TransferMode::EveryExecution, &[&data])
        .transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device.clone());
    {
        let result = plan.execute().unwrap();
        assert!(device.event_pool().in_use() > 0);
        result.wait_all().unwrap();
    }
    device.synchronize().unwrap();
    assert_eq!(device.event_pool().in_use(), 0);
}

#[test]
fn test_unbound_plan_uses_runtime_device() {
    tessera_rs::shutdown();
    let data = HostBuffer::from_slice(&[1.0f32; 16]);

    let mut graph = create_graph("runtime");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    graph
        .transfer_to_device(TransferMode::FirstExecution, &[&data])
        .transfer_to_host(TransferMode::EveryExecution, &[&data]);

    let mut plan = graph.snapshot().unwrap();
    assert!(matches!(plan.execute(), Err(Error::NotInitialized)));

    tessera_rs::init().unwrap();
    plan.execute().unwrap();
    assert_eq!(data.to_vec::<f32>(), vec![2.0; 16]);
    assert!(plan.device().is_some());

    drop(plan);
    tessera_rs::shutdown();
}

#[test]
fn test_graph_validation_errors() {
    let data = HostBuffer::zeroed::<f32>(16);
    let stray = HostBuffer::zeroed::<f32>(16);

    assert!(create_graph("empty").snapshot().is_err());

    let mut graph = create_graph("untransferred");
    graph.task("t0", add_one(), vec![(&data).into()]).unwrap();
    assert!(matches!(graph.snapshot(), Err(Error::Configuration(_))));

    graph.transfer_to_host(TransferMode::EveryExecution, &[&data, &stray]);
    let err = graph.snapshot().unwrap_err();
    assert!(err.to_string().contains("no task uses it"));

    let mut graph = create_graph("arity");
    let err = graph.task("t0", add_one(), vec![]).unwrap_err();
    assert!(err.to_string().contains("takes 1 arguments, 0 given"));
}
