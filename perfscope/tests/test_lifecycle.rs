use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use perfscope::config::EngineConfig;
use perfscope::domain::{CurrentState, PatchTarget};
use perfscope::host::SampleProgram;
use perfscope::patching::PatchSpec;
use perfscope::profiling::ManualClock;
use perfscope::Engine;

fn engine_for(sample: &SampleProgram) -> Engine {
    Engine::with_clock(EngineConfig::default(), Arc::clone(&sample.program), Arc::new(ManualClock::new()))
        .expect("default config is valid")
}

fn specs() -> Vec<PatchSpec> {
    vec![
        PatchSpec::measure(PatchTarget::new("World", "Tick")),
        PatchSpec::measure(PatchTarget::new("Music", "Update")),
        PatchSpec::measure(PatchTarget::new("Rng", "Next")),
    ]
}

fn hook_count(engine: &Engine, target: &PatchTarget) -> usize {
    let id = engine.program().resolve(target).expect("target exists");
    engine.program().hooks(id).map_or(0, |chain| chain.len())
}

#[test]
fn test_patch_unpatch_patch_ends_open() {
    let sample = SampleProgram::build(2);
    let engine = engine_for(&sample);
    let specs = specs();

    // Teardown timing varies per round: cancelled while queued, waited on
    // while running, or already finished
    for _ in 0..25 {
        engine.request_patch(&specs).unwrap();
        let _teardown = engine.request_unpatch();
        engine.request_patch(&specs).unwrap();

        assert_eq!(engine.state(), CurrentState::Open);
        assert_eq!(engine.lifecycle().descriptor_count(), specs.len());
        for spec in &specs {
            assert_eq!(hook_count(&engine, &spec.target), 1, "{} leaked interceptors", spec.target);
        }
    }

    // Any teardown still queued is stale and must not strip the new patches
    if let Some(pending) = engine.lifecycle().pending_teardown() {
        pending.wait();
    }
    assert_eq!(engine.state(), CurrentState::Open);
    assert_eq!(engine.lifecycle().active_targets().len(), specs.len());
}

#[test]
fn test_unpatch_restores_host() {
    let sample = SampleProgram::build(3);
    let engine = engine_for(&sample);

    engine.request_patch(&specs()).unwrap();
    sample.run_frame().unwrap();
    engine.request_unpatch().wait();

    assert_eq!(engine.state(), CurrentState::Uninitialised);
    assert!(engine.can_patch());
    assert!(engine.can_cleanup());
    for spec in specs() {
        assert_eq!(hook_count(&engine, &spec.target), 0);
    }
    assert!(engine.registry().keys().is_empty());

    // The host keeps running unpatched
    sample.run_frame().unwrap();
    assert_eq!(sample.pawn_ticks(), 6);
}

#[test]
fn test_bad_targets_skipped() {
    let sample = SampleProgram::build(1);
    let engine = engine_for(&sample);

    let mut requested = specs();
    requested.insert(1, PatchSpec::measure(PatchTarget::new("World", "Missing")));
    let report = engine.request_patch(&requested).unwrap();

    assert_eq!(report.applied.len(), 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, PatchTarget::new("World", "Missing"));
    assert_eq!(engine.state(), CurrentState::Open);

    sample.run_frame().unwrap();
    engine.refresh_logs();
    let keys: Vec<String> = engine.current_logs().iter().map(|log| log.key.clone()).collect();
    assert!(keys.contains(&"World.Tick".to_string()));
    assert!(!keys.contains(&"World.Missing".to_string()));
}

#[test]
fn test_kill_switch_mode() {
    let sample = SampleProgram::build(1);
    let engine = engine_for(&sample);
    let kill = Arc::new(AtomicBool::new(true));
    for mode in SampleProgram::modes(&kill) {
        engine.register_mode(mode);
    }

    engine.switch_mode("KillMusic").unwrap();
    sample.run_frame().unwrap();
    sample.run_frame().unwrap();
    assert_eq!(sample.music_plays(), 0);
    assert_eq!(sample.pawn_ticks(), 2);

    kill.store(false, std::sync::atomic::Ordering::Relaxed);
    sample.run_frame().unwrap();
    assert_eq!(sample.music_plays(), 1);
}
