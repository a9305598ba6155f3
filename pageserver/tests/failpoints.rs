//! Failure injection: every failpoint must leave the directories it touches as they were.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use fail::FailScenario;
use pageserver::config::PageServerConf;
use pageserver::failpoint_support::names;
use pageserver::metrics::{TaskEvent, TaskEventCounts};
use pageserver::tenant::config::TenantConfOpt;
use pageserver::tenant::storage_layer::{DeltaLayerWriter, ImageLayerWriter, Value};
use pageserver::tenant::tasks::BackgroundLoopKind;
use pageserver::tenant::{CheckpointConfig, CreateTimelineParams};
use pageserver::TenantManager;
use pageserver_api::key::Key;
use tokio::runtime::Handle;
use utils::id::{TenantId, TimelineId};
use utils::lsn::Lsn;

fn leaked_conf(repo_dir: &Utf8TempDir) -> &'static PageServerConf {
    Box::leak(Box::new(PageServerConf::dummy_conf(
        repo_dir.path().to_owned(),
    )))
}

fn dir_entries(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = dir
        .read_dir_utf8()
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn image_layer_writer_failpoint_leaves_no_file() {
    let scenario = FailScenario::setup();
    let repo_dir = camino_tempfile::tempdir().unwrap();
    let conf = leaked_conf(&repo_dir);
    let tenant_id = TenantId::generate();
    let timeline_id = TimelineId::generate();
    let timeline_dir = conf.timeline_path(&tenant_id, &timeline_id);
    std::fs::create_dir_all(&timeline_dir).unwrap();
    std::fs::write(timeline_dir.join("metadata"), b"unrelated").unwrap();

    fail::cfg(names::IMAGE_LAYER_WRITER_FAIL_BEFORE_FINISH, "return").unwrap();
    let mut writer = ImageLayerWriter::new(
        conf,
        timeline_id,
        tenant_id,
        &(Key::from_u32(0)..Key::from_u32(10)),
        Lsn(0x20),
    )
    .unwrap();
    writer
        .put_image(Key::from_u32(1), Bytes::from_static(b"image"))
        .unwrap();
    let err = writer.finish().unwrap_err();
    assert!(format!("{err:#}").contains(names::IMAGE_LAYER_WRITER_FAIL_BEFORE_FINISH));
    assert_eq!(dir_entries(&timeline_dir), vec!["metadata".to_owned()]);

    fail::remove(names::IMAGE_LAYER_WRITER_FAIL_BEFORE_FINISH);
    let mut writer = ImageLayerWriter::new(
        conf,
        timeline_id,
        tenant_id,
        &(Key::from_u32(0)..Key::from_u32(10)),
        Lsn(0x20),
    )
    .unwrap();
    writer
        .put_image(Key::from_u32(1), Bytes::from_static(b"image"))
        .unwrap();
    let layer = writer.finish().unwrap();
    assert!(layer.path().exists());
    assert_eq!(dir_entries(&timeline_dir).len(), 2);

    scenario.teardown();
}

#[test]
fn delta_layer_writer_failpoint_leaves_no_file() {
    let scenario = FailScenario::setup();
    let repo_dir = camino_tempfile::tempdir().unwrap();
    let conf = leaked_conf(&repo_dir);
    let tenant_id = TenantId::generate();
    let timeline_id = TimelineId::generate();
    let timeline_dir = conf.timeline_path(&tenant_id, &timeline_id);
    std::fs::create_dir_all(&timeline_dir).unwrap();

    fail::cfg(names::DELTA_LAYER_WRITER_FAIL_BEFORE_FINISH, "return").unwrap();
    let mut writer = DeltaLayerWriter::new(
        conf,
        timeline_id,
        tenant_id,
        Key::from_u32(1),
        Lsn(0x10)..Lsn(0x30),
    )
    .unwrap();
    writer
        .put_value(
            Key::from_u32(1),
            Lsn(0x10),
            &Value::Image(Bytes::from_static(b"a")),
        )
        .unwrap();
    assert!(writer.finish(Key::from_u32(2)).is_err());
    assert!(dir_entries(&timeline_dir).is_empty());

    scenario.teardown();
}

#[tokio::test]
async fn tenant_creation_failpoint_leaves_no_tenant_dir() {
    let scenario = FailScenario::setup();
    let repo_dir = camino_tempfile::tempdir().unwrap();
    let conf = leaked_conf(&repo_dir);
    std::fs::create_dir_all(conf.tenants_path()).unwrap();
    let mgr = TenantManager::new(
        conf,
        Arc::new(TaskEventCounts::default()),
        Handle::current(),
    );
    let tenant_id = TenantId::generate();

    fail::cfg(names::TENANT_CREATION_BEFORE_TMP_RENAME, "return").unwrap();
    assert!(mgr
        .create_tenant(TenantConfOpt::default(), tenant_id)
        .await
        .is_err());
    assert!(dir_entries(&conf.tenants_path()).is_empty());
    assert!(mgr.list_tenants().await.is_empty());

    fail::remove(names::TENANT_CREATION_BEFORE_TMP_RENAME);
    let tenant = mgr
        .create_tenant(TenantConfOpt::default(), tenant_id)
        .await
        .unwrap();
    tenant.wait_to_become_active().await.unwrap();
    assert_eq!(
        dir_entries(&conf.tenants_path()),
        vec![tenant_id.to_string()]
    );
    mgr.shutdown_all_tenants().await;

    scenario.teardown();
}

#[tokio::test]
async fn timeline_creation_failpoint_leaves_no_timeline_dir() {
    let scenario = FailScenario::setup();
    let repo_dir = camino_tempfile::tempdir().unwrap();
    let conf = leaked_conf(&repo_dir);
    std::fs::create_dir_all(conf.tenants_path()).unwrap();
    let events = Arc::new(TaskEventCounts::default());
    let mgr = TenantManager::new(conf, events.clone(), Handle::current());
    let tenant_id = TenantId::generate();
    let timeline_id = TimelineId::generate();
    let tenant = mgr
        .create_tenant(TenantConfOpt::default(), tenant_id)
        .await
        .unwrap();
    tenant.wait_to_become_active().await.unwrap();

    fail::cfg(names::TIMELINE_CREATION_BEFORE_TMP_RENAME, "return").unwrap();
    let bootstrap = CreateTimelineParams::Bootstrap {
        initdb_lsn: Lsn(0x10),
    };
    assert!(mgr
        .create_timeline(tenant_id, timeline_id, bootstrap)
        .await
        .is_err());
    assert!(dir_entries(&conf.timelines_path(&tenant_id)).is_empty());
    assert!(tenant.list_timelines().is_empty());
    assert!(!tenant.background_loops_running());
    assert_eq!(events.total(TaskEvent::Start), 0);

    fail::remove(names::TIMELINE_CREATION_BEFORE_TMP_RENAME);
    mgr.create_timeline(tenant_id, timeline_id, bootstrap)
        .await
        .unwrap();
    assert_eq!(
        dir_entries(&conf.timelines_path(&tenant_id)),
        vec![timeline_id.to_string()]
    );
    mgr.shutdown_all_tenants().await;

    scenario.teardown();
}

/// Fails image creation during compaction through `failpoint` and checks that the
/// timeline directory keeps exactly the layers it had.
async fn failed_image_creation_leaves_layers_unchanged(failpoint: &str) {
    let repo_dir = camino_tempfile::tempdir().unwrap();
    let conf = leaked_conf(&repo_dir);
    std::fs::create_dir_all(conf.tenants_path()).unwrap();
    let mgr = TenantManager::new(
        conf,
        Arc::new(TaskEventCounts::default()),
        Handle::current(),
    );
    let tenant_id = TenantId::generate();
    let timeline_id = TimelineId::generate();
    mgr.create_tenant(TenantConfOpt::default(), tenant_id)
        .await
        .unwrap()
        .wait_to_become_active()
        .await
        .unwrap();
    let timeline = mgr
        .create_timeline(
            tenant_id,
            timeline_id,
            CreateTimelineParams::Bootstrap {
                initdb_lsn: Lsn(0x10),
            },
        )
        .await
        .unwrap();

    // two level-0 deltas, enough for image creation
    let mut lsn = Lsn(0x10);
    for round in 0..2u32 {
        let writer = timeline.writer();
        for k in 0..10 {
            lsn += 0x10;
            writer
                .put(
                    Key::from_u32(k),
                    lsn,
                    &Value::Image(Bytes::from(format!("key {k} round {round}"))),
                )
                .unwrap();
        }
        writer.finish_write(lsn).unwrap();
        drop(writer);
        timeline.checkpoint(CheckpointConfig::Flush).unwrap();
    }
    let timeline_dir = conf.timeline_path(&tenant_id, &timeline_id);
    let before = dir_entries(&timeline_dir);
    assert_eq!(before.len(), 3, "{before:?}");
    let size_before = timeline.physical_size();

    fail::cfg(failpoint, "return").unwrap();
    let err = timeline.checkpoint(CheckpointConfig::Forced).unwrap_err();
    assert!(format!("{err:#}").contains(failpoint), "{err:#}");
    assert_eq!(dir_entries(&timeline_dir), before);
    assert_eq!(timeline.physical_size(), size_before);
    assert_eq!(
        timeline.get(Key::from_u32(3), timeline.get_last_record_lsn()).unwrap(),
        Bytes::from("key 3 round 1")
    );

    fail::remove(failpoint);
    timeline.checkpoint(CheckpointConfig::Forced).unwrap();
    assert!(timeline
        .layer_map_info()
        .historic_layers
        .iter()
        .any(|l| matches!(l, pageserver_api::models::HistoricLayerInfo::Image { .. })));
    mgr.shutdown_all_tenants().await;
}

#[tokio::test]
async fn image_writer_failpoint_during_compaction() {
    let scenario = FailScenario::setup();
    failed_image_creation_leaves_layers_unchanged(names::IMAGE_LAYER_WRITER_FAIL_BEFORE_FINISH)
        .await;
    scenario.teardown();
}

#[tokio::test]
async fn image_layer_failpoint_during_compaction() {
    let scenario = FailScenario::setup();
    failed_image_creation_leaves_layers_unchanged("image-layer-fail-before-finish").await;
    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compaction_panic_is_counted() {
    let scenario = FailScenario::setup();
    let repo_dir = camino_tempfile::tempdir().unwrap();
    let conf = leaked_conf(&repo_dir);
    std::fs::create_dir_all(conf.tenants_path()).unwrap();
    let events = Arc::new(TaskEventCounts::default());
    let mgr = TenantManager::new(conf, events.clone(), Handle::current());
    let tenant_id = TenantId::generate();

    fail::cfg(names::COMPACTION_ITERATION, "panic(injected compaction panic)").unwrap();
    let tenant_conf = TenantConfOpt {
        compaction_period: Some(Duration::from_millis(10)),
        ..TenantConfOpt::default()
    };
    let tenant = mgr.create_tenant(tenant_conf, tenant_id).await.unwrap();
    tenant.wait_to_become_active().await.unwrap();
    mgr.create_timeline(
        tenant_id,
        TimelineId::generate(),
        CreateTimelineParams::Bootstrap {
            initdb_lsn: Lsn(0x10),
        },
    )
    .await
    .unwrap();

    let compaction = BackgroundLoopKind::Compaction;
    tokio::time::timeout(Duration::from_secs(10), async {
        while events.get(tenant_id, compaction, TaskEvent::Stop) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("compaction loop did not stop after the panic");
    assert_eq!(events.get(tenant_id, compaction, TaskEvent::Start), 1);
    assert_eq!(events.get(tenant_id, compaction, TaskEvent::Panic), 1);
    assert_eq!(events.get(tenant_id, compaction, TaskEvent::Stop), 1);
    fail::remove(names::COMPACTION_ITERATION);

    // the gc loop is unaffected and stops with the tenant
    let gc = BackgroundLoopKind::Gc;
    assert_eq!(events.get(tenant_id, gc, TaskEvent::Stop), 0);
    mgr.detach_tenant(tenant_id).await.unwrap();
    assert_eq!(events.get(tenant_id, gc, TaskEvent::Start), 1);
    assert_eq!(events.get(tenant_id, gc, TaskEvent::Stop), 1);
    assert_eq!(events.get(tenant_id, gc, TaskEvent::Panic), 0);
    assert_eq!(events.get(tenant_id, compaction, TaskEvent::Stop), 1);

    scenario.teardown();
}
