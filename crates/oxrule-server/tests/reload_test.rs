mod common;

use anyhow::Result;
use common::{build_test_context, wait_for_first_evaluation, RULES_YAML};
use oxrule_engine::config as rules;
use oxrule_server::reload::{fingerprint, reload_once};
use std::sync::Arc;

#[tokio::test]
async fn unchanged_rule_files_are_not_reapplied() -> Result<()> {
    let ctx = build_test_context().await?;
    let mut last = fingerprint(&rules::load(&ctx.patterns())?);
    let before = ctx.state.manager.groups();

    let changed = reload_once(&ctx.state.manager, &ctx.patterns(), &mut last).await?;
    assert!(!changed);
    let after = ctx.state.manager.groups();
    assert!(Arc::ptr_eq(&before[0], &after[0]));
    Ok(())
}

#[tokio::test]
async fn new_groups_are_started_and_removed_ones_stopped() -> Result<()> {
    let ctx = build_test_context().await?;
    let mut last = fingerprint(&rules::load(&ctx.patterns())?);
    let old_id = ctx.state.manager.groups()[0].id();

    std::fs::write(
        &ctx.rules_path,
        RULES_YAML.replace("name: api", "name: web"),
    )?;
    assert!(reload_once(&ctx.state.manager, &ctx.patterns(), &mut last).await?);
    wait_for_first_evaluation(&ctx.state.manager).await;

    let groups = ctx.state.manager.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name(), "web");
    assert!(ctx.state.manager.group(old_id).is_none());
    assert_eq!(last[0].1, "web");
    Ok(())
}

#[tokio::test]
async fn changed_group_is_updated_in_place() -> Result<()> {
    let ctx = build_test_context().await?;
    let mut last = fingerprint(&rules::load(&ctx.patterns())?);
    let before = ctx.state.manager.groups();

    std::fs::write(
        &ctx.rules_path,
        RULES_YAML.replace("severity: page", "severity: ticket"),
    )?;
    assert!(reload_once(&ctx.state.manager, &ctx.patterns(), &mut last).await?);

    let after = ctx.state.manager.groups();
    assert!(Arc::ptr_eq(&before[0], &after[0]));
    let checksum = rules::load(&ctx.patterns())?[0].checksum.clone();
    // the running group applies the update asynchronously
    let applied = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while after[0].checksum() != checksum {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(applied.is_ok(), "group update was not applied");
    Ok(())
}

#[tokio::test]
async fn broken_rule_files_keep_previous_groups() -> Result<()> {
    let ctx = build_test_context().await?;
    let mut last = fingerprint(&rules::load(&ctx.patterns())?);
    let snapshot = last.clone();

    std::fs::write(&ctx.rules_path, "groups:\n  - name: api\n    rules:\n      - expr: up\n")?;
    assert!(reload_once(&ctx.state.manager, &ctx.patterns(), &mut last)
        .await
        .is_err());
    assert_eq!(last, snapshot);
    assert_eq!(ctx.state.manager.groups()[0].name(), "api");
    Ok(())
}
