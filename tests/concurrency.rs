//! Concurrency tests: many agents on one controller, shared store contention

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use control_channel::config::RegistrationPolicy;
use control_channel::service::{Agent, IdentityCache};
use control_channel::store::IdentityStore;

const AGENTS: usize = 20;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_agent_gets_only_its_own_command() {
    let server = TestServer::start(server_config()).await;

    let mut agents = Vec::new();
    for i in 0..AGENTS {
        let (agent, commands) = Agent::spawn_with_cache(
            agent_config(server.addr),
            device(&format!("hw-{i}")),
            IdentityCache::in_memory(),
        )
        .unwrap();
        agents.push((agent, commands));
    }
    for (agent, _) in &agents {
        agent.wait_connected(Duration::from_secs(5)).await.unwrap();
    }

    let identities: Vec<String> = agents.iter().map(|(a, _)| a.identity().unwrap()).collect();
    let unique: HashSet<&String> = identities.iter().collect();
    assert_eq!(unique.len(), AGENTS);

    for identity in &identities {
        server.enqueue(identity, &format!("RUN {identity}")).unwrap();
    }

    let mut tasks = Vec::new();
    for ((agent, mut commands), identity) in agents.into_iter().zip(identities) {
        tasks.push(tokio::spawn(async move {
            let received = tokio::time::timeout(Duration::from_secs(3), commands.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, format!("RUN {identity}"));
            // requests keep working alongside pushes
            agent.send_log("done").await.unwrap();
            agent.shutdown();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(server.metrics.snapshot().commands_delivered, AGENTS as u64);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_on_one_agent() {
    let server = TestServer::start(server_config()).await;
    let (agent, _commands) = Agent::spawn_with_cache(
        agent_config(server.addr),
        device("hw-busy"),
        IdentityCache::in_memory(),
    )
    .unwrap();
    agent.wait_connected(Duration::from_secs(3)).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..50 {
        let agent = agent.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                agent.request_otp().await.map(|_| ())
            } else {
                agent.send_log(format!("line {i}")).await
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    agent.shutdown();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_concurrent_registration_and_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identities.json");
    let store = Arc::new(IdentityStore::load(&path).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..50 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let record = store
                .register(device(&format!("hw-{i}")), RegistrationPolicy::ReuseExisting)
                .await
                .unwrap();
            let key = store.issue_key_if_absent(&record.id).await.unwrap().unwrap();
            assert!(store.verify_key(&record.id, &key).unwrap());
            store.mark_authenticated(&record.id).await.unwrap();
            record
        }));
    }
    let mut codes = HashSet::new();
    for task in tasks {
        assert!(codes.insert(task.await.unwrap().code));
    }
    assert_eq!(codes.len(), 50);

    let reloaded = IdentityStore::load(&path).await.unwrap();
    assert_eq!(reloaded.len(), 50);
    assert!(reloaded.list().iter().all(|r| r.authenticated && r.key.is_some()));
}
