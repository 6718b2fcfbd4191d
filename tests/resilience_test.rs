//! Failover, re-authentication and watch recovery as seen by an application.

mod support;

use cinder::ClientError;
use cinder::ClientOptions;
use cinder::WatchEvent;
use cinder::api::RpcError;
use cinder_testing::DeterministicStore;
use tokio::sync::mpsc;

async fn next_put(events: &mut mpsc::UnboundedReceiver<WatchEvent>) -> Vec<u8> {
    loop {
        if let WatchEvent::Put { kv, .. } = events.recv().await.unwrap() {
            return kv.value;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_client_fails_over_between_hosts() {
    let store = DeterministicStore::new();
    let client = support::client_for(&store, ClientOptions::new(["a:1", "b:1", "c:1"]));

    client.put("k").value("1").exec().await.unwrap();
    store.set_host_down("a:1", true);
    store.set_host_down("b:1", true);

    for _ in 0..5 {
        assert_eq!(client.get("k").string().await.unwrap().as_deref(), Some("1"));
    }
    assert_eq!(client.pool().available_hosts().len(), 1);
    assert_eq!(client.pool().available_hosts()[0].address(), "c:1");
}

#[tokio::test(start_paused = true)]
async fn test_down_hosts_recover_after_backoff() {
    let store = DeterministicStore::new();
    let client = support::client_for(&store, ClientOptions::new(["only:1"]));

    store.set_host_down("only:1", true);
    assert!(client.get("k").string().await.unwrap_err().is_transport());
    store.set_host_down("only:1", false);

    // The next call waits out the backoff window and then succeeds.
    assert_eq!(client.get("k").string().await.unwrap(), None);
    assert_eq!(client.pool().available_hosts().len(), 1);
}

#[tokio::test]
async fn test_refreshes_stale_tokens_transparently() {
    let store = DeterministicStore::new();
    store.add_user("app", "secret");
    let client = support::client_for(&store, ClientOptions::new(["a:1"]).with_auth("app", "secret"));

    client.put("k").value("v").exec().await.unwrap();
    store.invalidate_tokens();
    assert_eq!(client.get("k").string().await.unwrap().as_deref(), Some("v"));
    assert_eq!(store.method_calls("authenticate"), 2);
}

#[tokio::test]
async fn test_server_errors_reach_the_caller_untouched() {
    let (store, client) = support::client();
    store.fail_next("range", RpcError::PermissionDenied("no read access".into()));
    let err = client.get("k").string().await.unwrap_err();
    assert_eq!(err, ClientError::Server(RpcError::PermissionDenied("no read access".into())));
    assert_eq!(client.get("k").string().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_watchers_survive_stream_loss_without_missing_events() {
    let (store, client) = support::client();
    let watcher = client.watch().prefix("jobs/").create().await.unwrap();
    let mut events = watcher.subscribe();

    store.put(b"jobs/1", b"queued");
    assert_eq!(next_put(&mut events).await, b"queued".to_vec());

    store.disconnect_watch_streams();
    store.put(b"jobs/2", b"missed while disconnected");
    store.put(b"jobs/3", b"also missed");

    assert_eq!(next_put(&mut events).await, b"missed while disconnected".to_vec());
    assert_eq!(next_put(&mut events).await, b"also missed".to_vec());
    assert_eq!(store.open_watch_streams(), 1);
}

#[tokio::test]
async fn test_close_ends_watchers() {
    let (_store, client) = support::client();
    let watcher = client.watch().key("k").create().await.unwrap();
    let mut events = watcher.subscribe();

    client.close();
    loop {
        if events.recv().await.unwrap() == WatchEvent::End {
            break;
        }
    }
    assert_eq!(client.watch().key("k").create().await.unwrap_err(), ClientError::Closed);
}
