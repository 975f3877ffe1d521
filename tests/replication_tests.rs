//! Log replication, commit and repair on a running cluster.


use std::time::Duration;

use raft_lite::raft::RaftRole;
use test_harness::{assert_eventually, TestCluster};

#[tokio::test]
async fn test_submitted_command_commits_everywhere() {
    let mut cluster = TestCluster::new(3, 42000).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let index = cluster.submit("Q").await.unwrap();
    assert_eq!(index, 1);

    assert!(
        cluster
            .wait_for_commit_on_all(1, Duration::from_secs(5))
            .await,
        "all nodes should commit the entry"
    );

    for node in cluster.nodes.values() {
        let committed = node.raft_node.committed_commands().await;
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].submitter, test_harness::CLIENT_ID);
        assert_eq!(committed[0].action, "Q");
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_outcome_announced_to_client() {
    let mut cluster = TestCluster::new(3, 42010).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    cluster.submit("Q").await.unwrap();
    let outcome = cluster
        .next_outcome(Duration::from_secs(5))
        .await
        .expect("client should hear the outcome");
    assert_eq!(outcome.outcome, "client 9 did Q (x1)");
    assert_eq!(outcome.rendering, "client 9: Q=1");
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_many_commands_keep_order() {
    let mut cluster = TestCluster::new(3, 42020).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let actions = ["A", "B", "C", "D", "E"];
    for action in actions {
        cluster.submit(action).await.unwrap();
        // Let each proposal gather its acks before the next
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    assert!(cluster.wait_for_commit_on_all(5, Duration::from_secs(5)).await);
    for node in cluster.nodes.values() {
        let got: Vec<String> = node
            .raft_node
            .committed_commands()
            .await
            .into_iter()
            .map(|c| c.action)
            .collect();
        assert_eq!(got, actions);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_rejects_submission() {
    let mut cluster = TestCluster::new(3, 42030).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let follower_id = (0..3).find(|id| *id != leader_id).unwrap();

    let err = cluster.submit_to_node(follower_id, "Q").await.unwrap_err();
    assert!(err.contains("Not the leader"), "unexpected error: {}", err);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_action_rejected() {
    let mut cluster = TestCluster::new(3, 42040).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    assert!(cluster.submit("two words").await.is_err());
    let leader_id = cluster.get_leader_id().await.unwrap();
    assert_eq!(
        cluster.get_node(leader_id).unwrap().log().await.len(),
        0,
        "rejected action must not reach the log"
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_commit_with_one_follower_down() {
    let mut cluster = TestCluster::new(3, 42050).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let lagging = (0..3).find(|id| *id != leader_id).unwrap();

    cluster.isolate_node(lagging).await;
    // The isolated node cannot disturb the majority, re-check the leader
    let leader_id = cluster
        .wait_for_leader_in_group(
            &(0..3).filter(|id| *id != lagging).collect::<Vec<_>>(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    cluster.submit_to_node(leader_id, "Q").await.unwrap();
    let live: Vec<u64> = (0..3).filter(|id| *id != lagging).collect();
    assert!(
        cluster
            .wait_for_commit_on_nodes(&live, 1, Duration::from_secs(5))
            .await,
        "two of three servers are a majority"
    );
    assert_eq!(cluster.get_node(lagging).unwrap().committed().await, 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lagging_follower_is_repaired() {
    let mut cluster = TestCluster::new(3, 42060).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let lagging = (0..3).find(|id| *id != leader_id).unwrap();

    cluster.isolate_node(lagging).await;
    cluster.submit_to_node(leader_id, "Q").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    cluster.submit_to_node(leader_id, "W").await.unwrap();

    let live: Vec<u64> = (0..3).filter(|id| *id != lagging).collect();
    assert!(
        cluster
            .wait_for_commit_on_nodes(&live, 2, Duration::from_secs(5))
            .await
    );

    cluster.heal_node(lagging).await;
    // Cut off, it kept raising its term; wait until it settles behind a leader
    let healed = cluster.get_node(lagging).unwrap();
    assert_eventually(
        || async { healed.role().await == RaftRole::Follower && healed.leader_id().await.is_some() },
        Duration::from_secs(10),
        "healed node should follow a leader",
    )
    .await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    // The next proposal exposes any remaining gap and triggers a full-log overwrite
    cluster.submit_to_node(leader_id, "E").await.unwrap();

    assert!(
        cluster
            .wait_for_commit_on_all(3, Duration::from_secs(5))
            .await,
        "repaired follower should catch up on commits"
    );
    assert_eventually(
        || async { cluster.logs_identical().await },
        Duration::from_secs(5),
        "repaired follower should hold the leader's log",
    )
    .await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_commit_persists_log() {
    let mut cluster = TestCluster::new(3, 42070).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    cluster.submit("Q").await.unwrap();
    assert!(cluster.wait_for_commit_on_all(1, Duration::from_secs(5)).await);

    for node in cluster.nodes.values() {
        assert_eventually(
            || async { node.log_path.exists() },
            Duration::from_secs(2),
            "committed log should be written to disk",
        )
        .await;
        let bytes = std::fs::read(&node.log_path).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"last_committed_index\": 1"));
    }
    cluster.shutdown().await;
}
