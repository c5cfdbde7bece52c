//! Event timing. Profiling is a process-wide switch, so these tests live in
//! their own binary.

use std::sync::Arc;
use tessera_rs::backend::HostBackend;
use tessera_rs::config::HostDeviceConfig;
use tessera_rs::prelude::*;
use tessera_rs::runtime;

fn scale() -> Arc<dyn CompiledKernel> {
    HostKernel::new("scale", &[256], &[Access::ReadWrite], |inv| {
        let values: Vec<f32> = inv.read(0)?;
        let out: Vec<f32> = values.iter().map(|v| v * 0.5).collect();
        inv.write(0, &out)
    })
    .shared()
}

fn plan_for(data: &HostBuffer, backend: HostBackend) -> ExecutionPlan {
    let mut graph = create_graph("timed");
    graph.task("t0", scale(), vec![data.into()]).unwrap();
    graph
        .transfer_to_device(TransferMode::EveryExecution, &[data])
        .transfer_to_host(TransferMode::EveryExecution, &[data]);

    let device = DeviceHandle::with_config(Arc::new(backend), &Config::default()).unwrap();
    let mut plan = graph.snapshot().unwrap();
    plan.bind_device(device);
    plan
}

#[test]
fn test_profiled_execution_reports_times() {
    runtime::set_profiling(true);
    let data = HostBuffer::from_slice(&vec![4.0f32; 256]);
    let mut plan = plan_for(&data, HostBackend::new());

    let result = plan.execute().unwrap();
    let event = result.per_task_event("t0").unwrap();

    assert!(event.submit_time() >= 0);
    assert!(event.start_time() >= 0);
    assert!(event.end_time() >= event.start_time());
    assert_eq!(event.total_time(), event.execution_time());
    assert!(event.execution_time_secs() >= 0.0);

    let profiler = result.profiler();
    assert!(profiler.device_kernel_time_ns >= 0);
    assert!(profiler.device_write_time_ns >= 0);
    assert!(profiler.device_read_time_ns >= 0);
    assert_eq!(result.device_kernel_time(), profiler.device_kernel_time_ns);
    assert!(result.total_time().as_nanos() > 0);

    #[cfg(feature = "telemetry")]
    {
        let json = profiler.to_json().unwrap();
        assert!(json.contains("device_kernel_time_ns"));
    }
}

#[test]
fn test_device_without_timestamps_reports_unavailable() {
    runtime::set_profiling(true);
    let backend = HostBackend::from_config(&HostDeviceConfig {
        supports_profiling: false,
        ..HostDeviceConfig::default()
    });
    let data = HostBuffer::from_slice(&vec![4.0f32; 256]);
    let mut plan = plan_for(&data, backend);

    let result = plan.execute().unwrap();
    let event = result.per_task_event("t0").unwrap();
    assert_eq!(event.execution_time(), -1);
    assert_eq!(result.device_kernel_time(), -1);
    assert_eq!(data.to_vec::<f32>(), vec![2.0; 256]);
}
