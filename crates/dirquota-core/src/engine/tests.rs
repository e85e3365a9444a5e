use std::fs;

use tempfile::TempDir;

use super::*;
use crate::metrics::MetricsRegistry;
use crate::quota::{InMemoryQuota, QuotaCall};

const GIB_KIB: u64 = 1024 * 1024;

struct Fixture {
    dir: TempDir,
    root: PathBuf,
    config: QuotaConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("homes");
        fs::create_dir(&root).unwrap();
        let config = QuotaConfig {
            paths: vec![root.clone()],
            projects_file: dir.path().join("projects"),
            projid_file: dir.path().join("projid"),
            min_projid: 1001,
            hard_quota_gib: 1.0,
            ..QuotaConfig::default()
        };
        Self { dir, root, config }
    }

    fn mkdirs(&self, names: &[&str]) {
        for name in names {
            fs::create_dir(self.root.join(name)).unwrap();
        }
    }

    fn home(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn engine(&self) -> Engine<InMemoryQuota> {
        Engine::new(self.config.clone(), InMemoryQuota::new(self.dir.path()))
    }

    fn projid(&self) -> String {
        fs::read_to_string(&self.config.projid_file).unwrap()
    }
}

#[test]
fn first_cycle_registers_and_enforces() {
    let fx = Fixture::new();
    fx.mkdirs(&["a", "b"]);
    let mut engine = fx.engine();

    let report = engine.reconcile_step().unwrap();
    assert_eq!(report.discovered, 2);
    assert_eq!(report.added, vec![fx.home("a"), fx.home("b")]);
    assert!(report.registry_written);
    assert_eq!(report.projects_set_up, 2);
    assert_eq!(report.limits_applied, 2);
    assert!(report.is_clean());

    let backend = engine.backend();
    assert_eq!(backend.project(&fx.home("a")), Some(1001));
    assert_eq!(backend.project(&fx.home("b")), Some(1002));
    let record = backend.record(&fx.home("a")).unwrap();
    assert_eq!(record.limits(), QuotaLimits::hard_block_limit(1 << 30));
    assert_eq!(record.blocks.hard, GIB_KIB);
}

#[test]
fn second_cycle_is_idempotent() {
    let fx = Fixture::new();
    fx.mkdirs(&["a", "b", "c"]);
    let mut engine = fx.engine();
    engine.reconcile_step().unwrap();
    let before = fx.projid();
    engine.backend().clear_calls();

    let report = engine.reconcile_step().unwrap();
    assert!(!report.registry_written);
    assert_eq!(report.projects_set_up, 0);
    assert_eq!(report.limits_applied, 0);
    assert!(engine.backend().calls().is_empty());
    assert_eq!(fx.projid(), before);
}

#[test]
fn override_beats_exclusion() {
    let mut fx = Fixture::new();
    fx.mkdirs(&["a", "b", "c"]);
    fx.config.exclude = vec!["a".to_string(), "b".to_string()];
    fx.config.quota_overrides.insert("a".to_string(), 2.0);
    let mut engine = fx.engine();
    engine.reconcile_step().unwrap();

    let backend = engine.backend();
    assert_eq!(backend.record(&fx.home("a")).unwrap().blocks.hard, 2 * GIB_KIB);
    assert_eq!(backend.record(&fx.home("b")).unwrap().blocks.hard, 0);
    assert_eq!(backend.record(&fx.home("c")).unwrap().blocks.hard, GIB_KIB);
}

#[test]
fn drift_in_unmanaged_field_is_reverted() {
    let fx = Fixture::new();
    fx.mkdirs(&["a", "b"]);
    let mut engine = fx.engine();
    engine.reconcile_step().unwrap();

    engine
        .backend()
        .tamper(&fx.home("a"), |record| record.inodes.hard = 50);
    engine.backend().clear_calls();

    let report = engine.reconcile_step().unwrap();
    assert_eq!(report.projects_set_up, 0);
    assert_eq!(report.limits_applied, 1);
    assert_eq!(
        engine.backend().calls(),
        vec![QuotaCall::Limit {
            path: fx.home("a"),
            id: 1001,
            limits: QuotaLimits::hard_block_limit(1 << 30),
        }]
    );
    assert_eq!(engine.backend().record(&fx.home("a")).unwrap().inodes.hard, 0);
}

#[test]
fn lost_project_association_is_set_up_again() {
    let fx = Fixture::new();
    fx.mkdirs(&["a"]);
    let mut engine = fx.engine();
    engine.reconcile_step().unwrap();

    engine.backend().forget_project(&fx.home("a"));
    let report = engine.reconcile_step().unwrap();
    assert!(!report.registry_written);
    assert_eq!(report.projects_set_up, 1);
    assert_eq!(report.limits_applied, 1);
    assert_eq!(engine.backend().project(&fx.home("a")), Some(1001));
}

#[test]
fn enforcement_failure_does_not_block_other_paths() {
    let fx = Fixture::new();
    fx.mkdirs(&["a", "b"]);
    let mut engine = fx.engine();
    engine.backend().fail_path(fx.home("a"));

    let report = engine.reconcile_step().unwrap();
    assert!(report.registry_written);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, fx.home("a"));
    assert_eq!(report.failures[0].operation, Operation::SetupProject);
    assert_eq!(report.outcome(), CycleOutcome::Partial);
    assert_eq!(engine.backend().project(&fx.home("b")), Some(1002));
    assert!(fx.projid().contains(&format!("{}:1001", fx.home("a").display())));
}

#[test]
fn query_failure_aborts_after_registry_sync() {
    let fx = Fixture::new();
    fx.mkdirs(&["a"]);
    let mut engine = fx.engine();
    engine.backend().fail_queries(Some("quota not enabled"));

    let result = engine.reconcile_step();
    assert!(matches!(result, Err(EngineError::Query(_))));
    assert!(fx.projid().contains(":1001"));
    assert!(engine.backend().calls().is_empty());
}

#[test]
fn malformed_registry_aborts_cycle() {
    let fx = Fixture::new();
    fx.mkdirs(&["a"]);
    fs::write(&fx.config.projid_file, "/nowhere\n").unwrap();
    let registry = MetricsRegistry::new().unwrap();
    let mut engine = fx.engine().with_metrics(registry.quota_metrics().clone());

    let result = engine.reconcile_step();
    assert!(matches!(
        result,
        Err(EngineError::Registry(RegistryError::Parse { line: 1, .. }))
    ));
    assert!(engine.backend().calls().is_empty());
    assert!((registry.quota_metrics().cycle_count(CycleOutcome::Failed) - 1.0).abs() < f64::EPSILON);
}

#[test]
fn missing_root_is_created_and_yields_nothing() {
    let mut fx = Fixture::new();
    let missing = fx.dir.path().join("new-homes");
    fx.config.paths = vec![missing.clone()];
    let mut engine = fx.engine();

    let report = engine.reconcile_step().unwrap();
    assert!(missing.is_dir());
    assert_eq!(report.discovered, 0);
    assert!(report.is_clean());
    assert!(engine.backend().calls().is_empty());
}

#[test]
fn failed_root_keeps_its_entries() {
    let mut fx = Fixture::new();
    let other = fx.dir.path().join("other");
    fs::create_dir(&other).unwrap();
    fs::create_dir(other.join("x")).unwrap();
    fx.mkdirs(&["a"]);
    fx.config.paths.push(other.clone());
    let mut engine = fx.engine();
    engine.reconcile_step().unwrap();
    assert_eq!(engine.backend().project(&other.join("x")), Some(1002));

    fs::remove_dir_all(&other).unwrap();
    fs::write(&other, b"not a directory").unwrap();
    engine.backend().forget_project(&other.join("x"));
    fx.mkdirs(&["b"]);
    engine.backend().clear_calls();

    let report = engine.reconcile_step().unwrap();
    assert_eq!(report.failed_roots, vec![other.clone()]);
    assert!(report.removed.is_empty());
    assert_eq!(report.added, vec![fx.home("b")]);
    assert!(fx.projid().contains(&format!("{}:1002", other.join("x").display())));
    assert!(fx.projid().contains(&format!("{}:1003", fx.home("b").display())));
    assert!(engine
        .backend()
        .calls()
        .iter()
        .all(|call| !matches!(call, QuotaCall::Setup { path, .. } if *path == other.join("x"))));
}

#[test]
fn dirty_engine_reapplies_everything() {
    let fx = Fixture::new();
    fx.mkdirs(&["a", "b"]);
    let mut engine = fx.engine();
    engine.reconcile_step().unwrap();

    let mut config = fx.config.clone();
    config.min_projid = 5000;
    engine.update_config(config);
    assert!(engine.is_dirty());

    let report = engine.reconcile_step().unwrap();
    assert!(report.registry_written);
    assert_eq!(report.projects_set_up, 2);
    assert_eq!(report.limits_applied, 2);
    assert_eq!(engine.backend().project(&fx.home("a")), Some(1001));
    assert!(!engine.is_dirty());
}

#[test]
fn dirty_survives_a_failed_cycle() {
    let fx = Fixture::new();
    fx.mkdirs(&["a"]);
    let mut engine = fx.engine();
    engine.mark_dirty();
    engine.backend().fail_path(fx.home("a"));

    engine.reconcile_step().unwrap();
    assert!(engine.is_dirty());
}

#[test]
fn unrelated_config_change_keeps_engine_clean() {
    let fx = Fixture::new();
    let mut engine = fx.engine();
    let mut config = fx.config.clone();
    config.hard_quota_gib = 3.0;
    config.exclude = vec!["a".to_string()];
    engine.update_config(config);
    assert!(!engine.is_dirty());
    assert!((engine.config().hard_quota_gib - 3.0).abs() < f64::EPSILON);
}

#[test]
fn changed_default_quota_is_applied_next_cycle() {
    let fx = Fixture::new();
    fx.mkdirs(&["a"]);
    let mut engine = fx.engine();
    engine.reconcile_step().unwrap();

    let mut config = fx.config.clone();
    config.hard_quota_gib = 0.5;
    engine.update_config(config);
    let report = engine.reconcile_step().unwrap();
    assert_eq!(report.projects_set_up, 0);
    assert_eq!(report.limits_applied, 1);
    assert_eq!(
        engine.backend().record(&fx.home("a")).unwrap().blocks.hard,
        GIB_KIB / 2
    );
}

#[test]
fn mirror_drift_triggers_rewrite() {
    let fx = Fixture::new();
    fx.mkdirs(&["a"]);
    let mut engine = fx.engine();
    engine.reconcile_step().unwrap();

    fs::write(&fx.config.projects_file, crate::registry::OWNERSHIP_PREAMBLE).unwrap();
    let report = engine.reconcile_step().unwrap();
    assert!(report.registry_written);
    assert!(fs::read_to_string(&fx.config.projects_file)
        .unwrap()
        .ends_with(&format!("1001:{}\n", fx.home("a").display())));
}

#[test]
fn metrics_reflect_live_usage() {
    let fx = Fixture::new();
    fx.mkdirs(&["a"]);
    let registry = MetricsRegistry::new().unwrap();
    let metrics = registry.quota_metrics();
    let mut engine = fx.engine().with_metrics(metrics.clone());
    engine.reconcile_step().unwrap();
    assert!((metrics.hard_limit("a") - f64::from(1u32 << 30)).abs() < f64::EPSILON);

    engine.backend().set_used_kib(&fx.home("a"), 10);
    engine.reconcile_step().unwrap();
    assert!((metrics.total_size("a") - 10240.0).abs() < f64::EPSILON);
    assert!((metrics.cycle_count(CycleOutcome::Ok) - 2.0).abs() < f64::EPSILON);
}

#[test]
fn unstorable_name_does_not_stop_enforcement() {
    let fx = Fixture::new();
    fx.mkdirs(&["alice", "evil\nname"]);
    let mut engine = fx.engine();

    for cycle in 1..=3 {
        engine
            .backend()
            .tamper(&fx.home("alice"), |record| record.blocks.hard = 1);
        let report = engine.reconcile_step().unwrap();
        assert!(report.is_clean(), "cycle {cycle}: {report:?}");
        assert_eq!(report.discovered, 1);
        assert_eq!(engine.backend().project(&fx.home("alice")), Some(1001));
        assert_eq!(
            engine.backend().record(&fx.home("alice")).unwrap().blocks.hard,
            GIB_KIB
        );
    }
    assert!(!fx.projid().contains("evil"));
    assert_eq!(engine.backend().project(&fx.home("evil\nname")), None);
}

#[cfg(unix)]
#[test]
fn non_utf8_name_does_not_churn_ids() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let fx = Fixture::new();
    fx.mkdirs(&["alice"]);
    fs::create_dir(fx.root.join(OsStr::from_bytes(b"bad\xffname"))).unwrap();
    let mut engine = fx.engine();
    engine.reconcile_step().unwrap();
    let before = fx.projid();

    for _ in 0..2 {
        let report = engine.reconcile_step().unwrap();
        assert!(report.added.is_empty());
        assert!(report.removed.is_empty());
        assert!(!report.registry_written);
    }
    assert_eq!(fx.projid(), before);
    assert!(before.contains(&format!("{}:1001", fx.home("alice").display())));
}

#[test]
fn exhausted_id_space_is_reported_not_registered() {
    let mut fx = Fixture::new();
    fx.config.min_projid = MAX_PROJID;
    fx.mkdirs(&["a", "b"]);
    let mut engine = fx.engine();

    let report = engine.reconcile_step().unwrap();
    assert_eq!(report.added, vec![fx.home("a")]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, fx.home("b"));
    assert_eq!(report.failures[0].operation, Operation::AssignProjectId);
    assert_eq!(report.outcome(), CycleOutcome::Partial);
    assert_eq!(engine.backend().project(&fx.home("a")), Some(MAX_PROJID));
    assert_eq!(engine.backend().project(&fx.home("b")), None);
    assert!(!fx.projid().contains(&fx.home("b").display().to_string()));
}
