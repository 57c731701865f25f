#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Ordering and failure propagation over generated plans.

use async_trait::async_trait;
use foreman_core::ReasonCode;
use foreman_orchestrator::{Executor, ExecutorConfig, Plan, RunStatus, Step, StepStatus};
use foreman_skills::{
    Capability, CapabilityDescriptor, CapabilityFailure, CapabilityRegistry, RegisterMode,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Logs `start:<id>` and `end:<id>` around a short sleep. Fails when the
/// input carries `"fail": true`.
struct Recorder {
    descriptor: CapabilityDescriptor,
    log: Mutex<Vec<String>>,
}

#[async_trait]
impl Capability for Recorder {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityFailure> {
        let id = input["id"].as_str().unwrap_or_default().to_string();
        self.log.lock().push(format!("start:{id}"));
        let delay = input["delay_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.log.lock().push(format!("end:{id}"));
        if input["fail"].as_bool().unwrap_or(false) {
            return Err(CapabilityFailure::runtime("asked to fail"));
        }
        Ok(json!({ "id": id }))
    }
}

fn recorder(max_workers: usize) -> (Arc<Recorder>, Executor) {
    let cap = Arc::new(Recorder {
        descriptor: CapabilityDescriptor::builtin("record", "Record a call", json!({}), json!({})),
        log: Mutex::new(Vec::new()),
    });
    let registry = Arc::new(CapabilityRegistry::new());
    registry.register(cap.clone(), RegisterMode::Create).unwrap();
    let config = ExecutorConfig {
        max_workers,
        ..ExecutorConfig::default()
    };
    (cap, Executor::new(registry, config))
}

fn step(i: usize, deps: &[usize], delay_ms: u64, fail: bool) -> Step {
    let mut s = Step::bound(format!("s{i}"), "record")
        .literal("id", json!(format!("s{i}")))
        .literal("delay_ms", json!(delay_ms))
        .literal("fail", json!(fail));
    for d in deps {
        s = s.after(format!("s{d}"));
    }
    s
}

/// Each step depends on the earlier steps whose bit is set.
fn dag() -> impl Strategy<Value = Vec<(Vec<bool>, u64)>> {
    prop::collection::vec((prop::collection::vec(any::<bool>(), 10), 0u64..4), 1..10)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn steps_start_after_their_dependencies_end(shape in dag(), workers in 1usize..4) {
        let steps: Vec<Step> = shape
            .iter()
            .enumerate()
            .map(|(i, (bits, delay))| {
                let deps: Vec<usize> = (0..i).filter(|&j| bits[j]).collect();
                step(i, &deps, *delay, false)
            })
            .collect();
        let plan = Plan::new(Uuid::new_v4(), "", steps).unwrap();

        let (cap, exec) = recorder(workers);

        let rt = tokio::runtime::Runtime::new().unwrap();
        let report = rt.block_on(exec.execute(&plan, CancellationToken::new())).unwrap();
        prop_assert_eq!(report.status, RunStatus::Succeeded);
        prop_assert_eq!(report.trace.len(), plan.len());

        let log = cap.log.lock().clone();
        let pos = |entry: String| log.iter().position(|e| *e == entry).unwrap();
        for s in plan.steps() {
            let started = pos(format!("start:{}", s.id));
            for dep in &s.depends_on {
                prop_assert!(pos(format!("end:{dep}")) < started, "{} started before {} ended", s.id, dep);
            }
        }
    }
}

#[tokio::test]
async fn failure_skips_only_transitive_dependents() {
    let (cap, exec) = recorder(4);
    // s0 fails; s1 and s3 depend on it (s3 through s1); s2 is independent.
    let plan = Plan::new(
        Uuid::new_v4(),
        "",
        vec![
            step(0, &[], 0, true),
            step(1, &[0], 0, false),
            step(2, &[], 0, false),
            step(3, &[1, 2], 0, false),
            step(4, &[2], 0, false),
        ],
    )
    .unwrap();
    let report = exec.execute(&plan, CancellationToken::new()).await.unwrap();

    assert_eq!(report.result("s0").unwrap().status, StepStatus::Failed);
    for id in ["s1", "s3"] {
        let r = report.result(id).unwrap();
        assert_eq!(r.status, StepStatus::Skipped);
        assert_eq!(r.failure.as_ref().unwrap().code, ReasonCode::DependencyFailure);
    }
    assert_eq!(report.result("s2").unwrap().status, StepStatus::Succeeded);
    assert_eq!(report.result("s4").unwrap().status, StepStatus::Succeeded);
    assert_eq!(report.status, RunStatus::Partial);

    let log = cap.log.lock();
    assert!(!log.iter().any(|e| e == "start:s1" || e == "start:s3"));
}

#[tokio::test]
async fn worker_limit_bounds_concurrency() {
    struct Gauge {
        descriptor: CapabilityDescriptor,
        current: Mutex<usize>,
        peak: Mutex<usize>,
    }

    #[async_trait]
    impl Capability for Gauge {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, _input: Value) -> Result<Value, CapabilityFailure> {
            {
                let mut current = self.current.lock();
                *current += 1;
                let mut peak = self.peak.lock();
                *peak = (*peak).max(*current);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            *self.current.lock() -= 1;
            Ok(json!({}))
        }
    }

    let gauge = Arc::new(Gauge {
        descriptor: CapabilityDescriptor::builtin("gauge", "g", json!({}), json!({})),
        current: Mutex::new(0),
        peak: Mutex::new(0),
    });
    let registry = Arc::new(CapabilityRegistry::new());
    registry.register(gauge.clone(), RegisterMode::Create).unwrap();
    let exec = Executor::new(
        registry,
        ExecutorConfig {
            max_workers: 2,
            ..ExecutorConfig::default()
        },
    );
    let steps = (0..6).map(|i| Step::bound(format!("g{i}"), "gauge")).collect();
    let plan = Plan::new(Uuid::new_v4(), "", steps).unwrap();

    let report = exec.execute(&plan, CancellationToken::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(*gauge.peak.lock(), 2);
}
