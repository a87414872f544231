//! System tree reconciliation, sub-system splicing and tree-level mutators.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast::Receiver;

use common::{context, settle, ScriptedTransport};
use zyppmon_engine::engine::{
    Method, Outcome, SystemKind, SystemStatus, SystemTree, TreeEvent,
};
use zyppmon_engine::types::EngineError;

const CHILD_LIST: &str = "http://h1:8880/systems";

fn drain(events: &mut Receiver<TreeEvent>) -> Vec<TreeEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn changed_count(events: &[TreeEvent]) -> usize {
    events.iter().filter(|e| **e == TreeEvent::Changed).count()
}

fn fleet() -> Value {
    json!([
        {"usid": "1", "name": "me", "type": "self"},
        {"usid": "2", "name": "box", "type": "host", "host": "h1"},
        {"usid": "3", "name": "snap", "type": "file", "ufl": "u", "file": "f"}
    ])
}

fn root(transport: &Arc<ScriptedTransport>) -> Arc<SystemTree> {
    SystemTree::root(context(transport), Vec::new())
}

#[tokio::test]
async fn test_new_host_grows_tree_with_one_change() {
    let transport = ScriptedTransport::new();
    transport.push_json("/systems", json!([{"usid": "1", "type": "self"}]));
    transport.push_json(
        "/systems",
        json!([{"usid": "1", "type": "self"}, {"usid": "2", "type": "host", "host": "h1"}]),
    );
    transport.always(CHILD_LIST, Outcome::Completed(json!([])));
    let tree = root(&transport);
    let mut events = tree.subscribe();

    tree.refresh().await.unwrap();
    assert_eq!(tree.len(), 1);
    let first = drain(&mut events);
    assert!(first.contains(&TreeEvent::SelfSystemLoaded("1".to_string())));

    let report = tree.refresh().await.unwrap();
    let second = drain(&mut events);

    assert_eq!(tree.len(), 2);
    assert_eq!(report.added, vec!["2".to_string()]);
    assert_eq!(changed_count(&second), 1);
    assert_eq!(tree.get_by_usid("2").unwrap().kind(), SystemKind::Host);
    tree.destroy();
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::Completed(fleet()));
    transport.always(CHILD_LIST, Outcome::Completed(json!([])));
    let tree = root(&transport);

    tree.refresh().await.unwrap();
    let mut events = tree.subscribe();
    let report = tree.refresh().await.unwrap();
    let seen = drain(&mut events);

    assert!(!report.changed());
    assert_eq!(changed_count(&seen), 0);
    assert!(seen.contains(&TreeEvent::StatesRefreshed));
    tree.destroy();
}

#[tokio::test(start_paused = true)]
async fn test_list_fetch_retries_then_succeeds() {
    let transport = ScriptedTransport::new();
    transport.push("/systems", Outcome::Failed);
    transport.push("/systems", Outcome::Aborted);
    transport.push_json("/systems", json!([{"usid": "1", "type": "self"}]));
    let tree = root(&transport);

    let report = tree.refresh().await.unwrap();

    assert_eq!(report.added, vec!["1".to_string()]);
    assert_eq!(transport.count("/systems"), 3);
    tree.destroy();
}

#[tokio::test(start_paused = true)]
async fn test_list_fetch_gives_up_past_the_retry_ceiling() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::TimedOut);
    let tree = root(&transport);

    let err = tree.refresh().await.unwrap_err();

    assert!(matches!(err, EngineError::Abandoned { attempts: 4, .. }));
    assert_eq!(transport.count("/systems"), 4);
    assert!(tree.is_empty());
}

#[tokio::test]
async fn test_members_with_parent_field_are_removed_by_the_root() {
    let transport = ScriptedTransport::new();
    transport.push_json(
        "/systems",
        json!([
            {"usid": "1", "type": "self"},
            {"usid": "5", "name": "imported", "type": "file", "parentUSID": "9"}
        ]),
    );
    transport.push_json("/systems", json!([{"usid": "1", "type": "self"}]));
    let tree = root(&transport);

    tree.refresh().await.unwrap();
    let imported = tree.get_by_usid("5").unwrap();
    assert_eq!(imported.parent_usid(), Some("9"));

    let report = tree.refresh().await.unwrap();

    assert_eq!(report.removed, vec!["5".to_string()]);
    assert_eq!(tree.usids(), vec!["1".to_string()]);
    assert_eq!(imported.status(), SystemStatus::Removed);
    tree.destroy();
}

#[tokio::test]
async fn test_vanished_systems_are_destroyed() {
    let transport = ScriptedTransport::new();
    transport.push_json("/systems", fleet());
    transport.push_json("/systems", json!([{"usid": "1", "type": "self"}]));
    transport.always(CHILD_LIST, Outcome::Completed(json!([])));
    let tree = root(&transport);

    tree.refresh().await.unwrap();
    let host = tree.get_by_usid("2").unwrap();
    let report = tree.refresh().await.unwrap();

    assert_eq!(report.removed, vec!["2".to_string(), "3".to_string()]);
    assert_eq!(tree.usids(), vec!["1".to_string()]);
    assert_eq!(host.status(), SystemStatus::Removed);
}

#[tokio::test]
async fn test_disabled_hosts_do_not_load_sub_systems() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::Completed(fleet()));
    let tree = SystemTree::root(context(&transport), vec!["2".to_string()]);

    tree.refresh().await.unwrap();
    settle().await;

    assert!(!tree.get_by_usid("2").unwrap().enabled());
    assert!(tree.get_by_usid("3").unwrap().enabled());
    assert_eq!(transport.count(CHILD_LIST), 0);
}

#[tokio::test]
async fn test_sub_systems_are_spliced_after_their_host() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::Completed(fleet()));
    transport.always(
        CHILD_LIST,
        Outcome::Completed(json!([
            {"usid": "10", "name": "box-self", "type": "self"},
            {"usid": "11", "name": "old", "type": "file"},
            {"usid": "12", "name": "older", "type": "file"}
        ])),
    );
    let tree = root(&transport);

    tree.refresh().await.unwrap();
    settle().await;

    assert_eq!(tree.usids(), vec!["1", "2", "11", "12", "3"]);
    let child = tree.get_by_usid("11").unwrap();
    assert_eq!(child.parent_usid(), Some("2"));
    assert_eq!(child.label(), " - old @box");
    assert_eq!(child.url("stat", false), "http://h1:8880/11/stat");
    assert_eq!(tree.self_system().unwrap().usid(), "1");

    // Reconciling the root again keeps the spliced children in place.
    tree.refresh().await.unwrap();
    assert_eq!(tree.len(), 5);
    tree.destroy();
}

#[tokio::test]
async fn test_removed_host_takes_its_children_along() {
    let transport = ScriptedTransport::new();
    transport.push_json("/systems", fleet());
    transport.always(
        CHILD_LIST,
        Outcome::Completed(json!([{"usid": "11", "name": "old", "type": "file"}])),
    );
    let tree = root(&transport);
    tree.refresh().await.unwrap();
    settle().await;
    let child = tree.get_by_usid("11").unwrap();

    transport.push_json(
        "/systems",
        json!([{"usid": "1", "type": "self"}, {"usid": "3", "type": "file"}]),
    );
    tree.refresh().await.unwrap();

    assert_eq!(tree.usids(), vec!["1", "3"]);
    assert_eq!(child.status(), SystemStatus::Removed);
}

#[tokio::test]
async fn test_child_list_falls_back_to_proxied_path() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::Completed(fleet()));
    transport.always(
        CHILD_LIST,
        Outcome::Completed(json!({"status": "error", "error": "AUTH_NO_TOKEN"})),
    );
    transport.always(
        "/2/systems",
        Outcome::Completed(json!([{"usid": "11", "name": "old", "type": "file"}])),
    );
    let tree = root(&transport);

    tree.refresh().await.unwrap();
    settle().await;

    let host = tree.get_by_usid("2").unwrap();
    assert!(host.proxied());
    assert_eq!(transport.count(CHILD_LIST), 1);
    assert_eq!(transport.count("/2/systems"), 1);
    assert_eq!(tree.usids(), vec!["1", "2", "11", "3"]);
    tree.destroy();
}

#[tokio::test]
async fn test_save_states_persists_disabled_set_and_order() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::Completed(fleet()));
    transport.always(CHILD_LIST, Outcome::Completed(json!([])));
    transport.always("/systems/setOrder", Outcome::Completed(json!({"status": "ok"})));
    let tree = root(&transport);
    tree.refresh().await.unwrap();

    tree.get_by_usid("3").unwrap().set_enabled(false);
    let order = vec!["3".to_string(), "1".to_string(), "2".to_string()];
    let disabled = tree.save_states(Some(order.as_slice())).await.unwrap();

    assert_eq!(disabled, vec!["3".to_string()]);
    assert_eq!(tree.usids(), order);
    let request = &transport.requests_to("/systems/setOrder")[0];
    assert_eq!(request.param_value("order"), Some("3;1;2"));

    // The disabled flag survives the next reconciliation.
    tree.refresh().await.unwrap();
    assert!(!tree.get_by_usid("3").unwrap().enabled());
    tree.destroy();
}

#[tokio::test]
async fn test_active_defaults_to_self_system() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::Completed(fleet()));
    transport.always(CHILD_LIST, Outcome::Completed(json!([])));
    let tree = root(&transport);
    tree.refresh().await.unwrap();
    let mut events = tree.subscribe();

    assert_eq!(tree.active().unwrap().usid(), "1");
    tree.set_active("3").unwrap();

    assert_eq!(tree.active().unwrap().usid(), "3");
    assert_eq!(
        drain(&mut events),
        vec![TreeEvent::ActiveChanged {
            old: Some("1".to_string()),
            new: "3".to_string()
        }]
    );
    assert!(tree.set_active("404").is_none());
    tree.destroy();
}

#[tokio::test]
async fn test_remove_system_drops_the_entity_named_in_reply() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::Completed(fleet()));
    transport.always(CHILD_LIST, Outcome::Completed(json!([])));
    transport.push_json("/system/remove/3", json!({"usid": "3"}));
    let tree = root(&transport);
    tree.refresh().await.unwrap();
    let snapshot = tree.get_by_usid("3").unwrap();

    let removed = tree.remove_system("3").await.unwrap();

    assert_eq!(removed.as_deref(), Some("3"));
    assert!(tree.get_by_usid("3").is_none());
    assert_eq!(snapshot.status(), SystemStatus::Removed);
    tree.destroy();
}

#[tokio::test]
async fn test_add_host_and_create_template_post_form_fields() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::Completed(json!([{"usid": "1", "type": "self"}])));
    transport.push_json("/system/add/host", json!({"status": "ok"}));
    transport.push_json("/templates/create", json!({"usid": "t1"}));
    let tree = root(&transport);

    tree.add_host("lab", "10.0.0.5").await.unwrap();
    let add = &transport.requests_to("/system/add/host")[0];
    assert_eq!(add.method, Method::Post);
    assert_eq!(add.param_value("usn"), Some("lab"));
    assert_eq!(add.param_value("host"), Some("10.0.0.5"));
    assert_eq!(transport.count("/systems"), 1);

    let reply = tree
        .create_template(&["1".to_string(), "3".to_string()])
        .await
        .unwrap();
    assert_eq!(reply["usid"], "t1");
    let create = &transport.requests_to("/templates/create")[0];
    assert_eq!(create.param_value("count"), Some("2"));
    assert_eq!(create.param_value("usid0"), Some("1"));
    assert_eq!(create.param_value("usid1"), Some("3"));
}

#[tokio::test]
async fn test_self_system_list_change_triggers_refresh() {
    let transport = ScriptedTransport::new();
    transport.push_json("/systems", json!([{"usid": "1", "type": "self"}]));
    transport.always(
        "/systems",
        Outcome::Completed(json!([{"usid": "1", "type": "self"}, {"usid": "4", "type": "template"}])),
    );
    transport.push_json("/check", json!({"status": "ok", "systems-ts": 1}));
    transport.push_json("/check", json!({"status": "ok", "systems-ts": 2}));
    let tree = root(&transport);
    tree.refresh().await.unwrap();
    let own = tree.self_system().unwrap();

    own.check_now().await;
    own.check_now().await;
    settle().await;

    assert_eq!(tree.usids(), vec!["1", "4"]);
    tree.destroy();
}

#[tokio::test]
async fn test_live_status_changes_are_forwarded() {
    let transport = ScriptedTransport::new();
    transport.always("/systems", Outcome::Completed(fleet()));
    transport.always(CHILD_LIST, Outcome::Completed(json!([])));
    transport.push("http://h1:8880/check", Outcome::TimedOut);
    let tree = root(&transport);
    tree.refresh().await.unwrap();
    let mut events = tree.subscribe();

    tree.get_by_usid("2").unwrap().check_now().await;
    settle().await;

    assert!(drain(&mut events).contains(&TreeEvent::StatusesUpdated));
    tree.destroy();
}
