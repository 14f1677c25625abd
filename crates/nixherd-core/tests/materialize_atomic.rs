//! Rematerialization against a live supervisor: running children are stopped
//! first and the map flips from the old set to the new set in one step.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nixherd_core::builder::{BuildArtifact, Builder, BuilderError, TargetInfo};
use nixherd_core::bus::LogBus;
use nixherd_core::materializer::Materializer;
use nixherd_core::supervisor::{RunStatus, RunnableSpec, Supervisor};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Builder producing prebuilt script binaries, with a configurable delay per
/// build so concurrent observers get a window to race the swap.
struct ScriptBuilder {
    targets: BTreeMap<String, PathBuf>,
    build_delay: Duration,
}

#[async_trait]
impl Builder for ScriptBuilder {
    async fn enumerate(
        &self,
        _repo_url: &str,
    ) -> Result<BTreeMap<String, TargetInfo>, BuilderError> {
        Ok(self
            .targets
            .keys()
            .map(|key| {
                (
                    key.clone(),
                    TargetInfo {
                        name: key.clone(),
                        kind: "derivation".to_string(),
                    },
                )
            })
            .collect())
    }

    async fn build(&self, _repo_url: &str, key: &str) -> Result<BuildArtifact, BuilderError> {
        tokio::time::sleep(self.build_delay).await;
        let binary = self.targets[key].clone();
        Ok(BuildArtifact {
            store_path: binary.parent().unwrap().to_path_buf(),
            binary_path: binary,
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rematerialize_stops_running_children_first() {
    let bus = Arc::new(LogBus::new());
    let supervisor = Supervisor::new(Arc::clone(&bus));
    let dir = tempfile::tempdir().unwrap();

    // Old set, installed directly, with one child running.
    let old_script = write_script(dir.path(), "old-sleeper", "sleep 60");
    let mut old = BTreeMap::new();
    old.insert(
        "sleeper".to_string(),
        RunnableSpec::built("sleeper", &old_script),
    );
    supervisor.replace_all(old);
    let old_pid = supervisor.start("sleeper").unwrap();

    let new_script = write_script(dir.path(), "new-sleeper", "sleep 60");
    let builder = ScriptBuilder {
        targets: [("sleeper".to_string(), new_script.clone())].into(),
        build_delay: Duration::ZERO,
    };
    let materializer = Materializer::new(builder, supervisor.clone());

    let report = materializer.materialize("github:ex/r").await.unwrap();
    assert_eq!(report.succeeded, vec!["sleeper"]);

    // The old process is gone and the fresh entry is stopped with the new
    // binary; at no point can a snapshot pair the new binary with the old
    // pid, because the old child is reaped before the swap.
    let snap = supervisor.status("sleeper").unwrap();
    assert_eq!(snap.status, RunStatus::Stopped);
    assert_eq!(snap.pid, None);
    assert_eq!(snap.binary_path.as_deref(), Some(new_script.as_path()));
    assert!(
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(old_pid as i32), None).is_err(),
        "old child survived rematerialization"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn observers_see_old_set_or_new_set_never_a_union() {
    let bus = Arc::new(LogBus::new());
    let supervisor = Supervisor::new(Arc::clone(&bus));
    let dir = tempfile::tempdir().unwrap();

    let mut old = BTreeMap::new();
    for key in ["alpha", "beta"] {
        let script = write_script(dir.path(), key, "sleep 60");
        old.insert(key.to_string(), RunnableSpec::built(key, script));
    }
    supervisor.replace_all(old);

    let old_keys: BTreeSet<String> = ["alpha", "beta"].iter().map(ToString::to_string).collect();
    let new_keys: BTreeSet<String> = ["gamma", "delta", "epsilon"]
        .iter()
        .map(ToString::to_string)
        .collect();

    let targets: BTreeMap<String, PathBuf> = new_keys
        .iter()
        .map(|key| (key.clone(), write_script(dir.path(), key, "sleep 60")))
        .collect();
    let materializer = Materializer::new(
        ScriptBuilder {
            targets,
            build_delay: Duration::from_millis(50),
        },
        supervisor.clone(),
    );

    // Poll the map continuously while the (slow) materialization runs.
    let observer = {
        let supervisor = supervisor.clone();
        let old_keys = old_keys.clone();
        let new_keys = new_keys.clone();
        tokio::spawn(async move {
            loop {
                let seen: BTreeSet<String> =
                    supervisor.list().into_iter().map(|s| s.key).collect();
                assert!(
                    seen == old_keys || seen == new_keys,
                    "observed a partial map: {seen:?}"
                );
                if seen == new_keys {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    materializer.materialize("github:ex/r").await.unwrap();
    observer.await.unwrap();

    let seen: BTreeSet<String> = supervisor.list().into_iter().map(|s| s.key).collect();
    assert_eq!(seen, new_keys);
}
